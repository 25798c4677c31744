// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::errors;
use crate::errors::LldpdError;
use protocol::types::ChassisId;

pub type LldpdResult<T> = Result<T, errors::LldpdError>;

/// Information describing this system, shared by every agent.
#[derive(Clone, Debug)]
pub struct SystemInfo {
    pub chassis_id: ChassisId,
    pub system_name: Option<String>,
    pub system_description: Option<String>,
}

/// The per-agent settings described in section 9.2.5 of the standard, along
/// with a couple of implementation limits.
#[derive(Clone, Debug)]
pub struct AgentCfg {
    /// Whether the agent should be sending, receiving, or both.
    pub admin_status: AdminStatus,
    /// How quickly to resend LLDPDUs during fast tx periods.
    /// Measured in ticks from 1-3600.
    pub msg_fast_tx: u16,
    /// Multiplier of msg_tx_interval, used to calculate TTL.  Legal values
    /// are 1-100.
    pub msg_tx_hold: u16,
    /// Time between LLDPDU transmissions during normal tx periods.
    /// Measured in ticks from 1-3600.
    pub msg_tx_interval: u16,
    /// After becoming disabled, ticks to wait before attempting
    /// reinitialization.
    pub reinit_delay: u16,
    /// Maximum value of tx_credit.  1-10.
    pub tx_credit_max: u16,
    /// Number of LLDPDUs sent in a fast tx burst.  1-8.
    pub tx_fast_init: u16,
    /// Number of peers the remote MIB will hold before declaring
    /// tooManyNeighbors.
    pub max_neighbors: usize,
    /// Length of one protocol tick.  The standard fixes this at one second.
    pub tick: Duration,
}

impl Default for AgentCfg {
    /// Returns an AgentCfg with all fields set as recommended by the
    /// standard
    fn default() -> Self {
        AgentCfg {
            admin_status: AdminStatus::default(),
            msg_fast_tx: 1,
            msg_tx_hold: 4,
            msg_tx_interval: 30,
            reinit_delay: 2,
            tx_credit_max: 5,
            tx_fast_init: 4,
            max_neighbors: 32,
            tick: Duration::from_secs(1),
        }
    }
}

fn range_check(name: &str, val: u16, min: u16, max: u16) -> LldpdResult<()> {
    if val < min || val > max {
        Err(LldpdError::Invalid(format!(
            "{name} must be in the range {min}-{max}, not {val}"
        )))
    } else {
        Ok(())
    }
}

impl AgentCfg {
    pub fn validate(&self) -> LldpdResult<()> {
        range_check("msg_fast_tx", self.msg_fast_tx, 1, 3600)?;
        range_check("msg_tx_hold", self.msg_tx_hold, 1, 100)?;
        range_check("msg_tx_interval", self.msg_tx_interval, 1, 3600)?;
        range_check("reinit_delay", self.reinit_delay, 1, 10)?;
        range_check("tx_credit_max", self.tx_credit_max, 1, 10)?;
        range_check("tx_fast_init", self.tx_fast_init, 1, 8)?;
        if self.max_neighbors == 0 {
            return Err(LldpdError::Invalid(
                "max_neighbors must be non-zero".into(),
            ));
        }
        if self.tick.is_zero() {
            return Err(LldpdError::Invalid("tick must be non-zero".into()));
        }
        Ok(())
    }

    /// The TTL advertised in our LLDPDUs: msgTxInterval * msgTxHold + 1,
    /// capped at 65535 (section 9.2.2.2).
    pub fn tx_ttl(&self) -> u16 {
        let ttl = self.msg_tx_interval as u32 * self.msg_tx_hold as u32 + 1;
        ttl.min(u16::MAX as u32) as u16
    }
}

/// Whether the agent should be sending, receiving, or both.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub enum AdminStatus {
    #[default]
    EnabledRxTx,
    EnabledRxOnly,
    EnabledTxOnly,
    Disabled,
}

impl AdminStatus {
    pub fn has_rx(self) -> bool {
        self == AdminStatus::EnabledRxTx || self == AdminStatus::EnabledRxOnly
    }

    pub fn has_tx(self) -> bool {
        self == AdminStatus::EnabledRxTx || self == AdminStatus::EnabledTxOnly
    }
}

impl FromStr for AdminStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rxtx" | "both" => Ok(AdminStatus::EnabledRxTx),
            "rx" | "rxonly" => Ok(AdminStatus::EnabledRxOnly),
            "tx" | "txonly" => Ok(AdminStatus::EnabledTxOnly),
            "disable" | "disabled" => Ok(AdminStatus::Disabled),
            _ => Err(format!("invalid admin mode: {s}")),
        }
    }
}

impl fmt::Display for AdminStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            AdminStatus::EnabledRxTx => "rxtx",
            AdminStatus::EnabledRxOnly => "rx",
            AdminStatus::EnabledTxOnly => "tx",
            AdminStatus::Disabled => "disabled",
        };
        write!(f, "{s}")
    }
}

/// Statistics described in section 9.2.6 of the standard
#[derive(Clone, Debug, Default, Serialize)]
pub struct Stats {
    /// How many times a neighbor's record has been deleted because its TTL
    /// expired
    pub ageouts_total: u64,
    /// How many LLDP frames have been discarded because of an invalid TLV or
    /// lack of local space
    pub frames_discarded_total: u64,
    /// LLDPDU frames discarded because of a detected error
    pub frames_in_errors_total: u64,
    /// Count of all LLDPDU frames received
    pub frames_in_total: u64,
    /// Count of all LLDPDU frames transmitted
    pub frames_out_total: u64,
    /// TLVs that were received and discarded for any reason
    pub tlvs_discarded_total: u64,
    /// Well-formed TLVs that were discarded because they were not recognized.
    pub tlvs_unrecognized_total: u64,
    /// LLDPDUs that were discarded because they violated a length restriction
    pub lldpdu_length_errors: u64,
    /// LLDPDUs dropped because the remote MIB had no room for a new peer
    pub too_many_neighbors_total: u64,
}

#[test]
fn test_tx_ttl() {
    let cfg = AgentCfg::default();
    assert_eq!(cfg.tx_ttl(), 121);
    let cfg = AgentCfg {
        msg_tx_interval: 3600,
        msg_tx_hold: 100,
        ..Default::default()
    };
    assert_eq!(cfg.tx_ttl(), u16::MAX);
}

#[test]
fn test_cfg_validation() {
    assert!(AgentCfg::default().validate().is_ok());
    let cfg = AgentCfg {
        tx_credit_max: 0,
        ..Default::default()
    };
    assert!(matches!(cfg.validate(), Err(LldpdError::Invalid(_))));
    let cfg = AgentCfg {
        msg_tx_hold: 101,
        ..Default::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_admin_status() {
    assert!(AdminStatus::EnabledRxOnly.has_rx());
    assert!(!AdminStatus::EnabledRxOnly.has_tx());
    assert!(!AdminStatus::Disabled.has_rx());
    assert_eq!("tx".parse::<AdminStatus>(), Ok(AdminStatus::EnabledTxOnly));
    assert!("sideways".parse::<AdminStatus>().is_err());
}
