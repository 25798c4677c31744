// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! IEEE 802.1Qaz DCBX TLVs.  These ride inside organizationally specific
//! LLDP TLVs carrying the IEEE 802.1 OUI.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::invalid;
use crate::malformed;
use crate::packet::LldpTlv;
use crate::ProtocolResult;

/// OUI assigned to IEEE 802.1
pub const IEEE_8021_OUI: [u8; 3] = [0x00, 0x80, 0xc2];
/// Subtype of the PFC Configuration TLV (802.1Qaz table D-1)
pub const PFC_SUBTYPE: u8 = 0x0b;
/// Number of 802.1p priorities
pub const PRIORITIES: u8 = 8;

const PFC_WILLING: u8 = 0x80;
const PFC_MBC: u8 = 0x40;
const PFC_CAP_MASK: u8 = 0x0f;

/// The negotiable portion of a station's PFC settings.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize,
)]
pub struct PfcConfig {
    /// MACsec bypass capability
    pub mbc: bool,
    /// How many traffic classes may simultaneously have PFC enabled
    pub cap: u8,
    /// Bitmap of priorities with PFC enabled; bit n is priority n
    pub enable: u8,
}

impl PfcConfig {
    pub fn priorities(&self) -> Vec<u8> {
        (0..PRIORITIES).filter(|p| self.enable & (1 << p) != 0).collect()
    }

    pub fn from_priorities(
        mbc: bool,
        cap: u8,
        prios: &[u8],
    ) -> ProtocolResult<Self> {
        let mut enable = 0u8;
        for p in prios {
            if *p >= PRIORITIES {
                return Err(invalid(format!("priority {p} out of range")));
            }
            enable |= 1 << p;
        }
        let cfg = PfcConfig { mbc, cap, enable };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> ProtocolResult<()> {
        if self.cap > PRIORITIES {
            return Err(invalid(format!("pfc cap {} exceeds 8", self.cap)));
        }
        let enabled = self.enable.count_ones() as u8;
        if enabled > self.cap {
            return Err(invalid(format!(
                "{enabled} priorities enabled with a pfc cap of {}",
                self.cap
            )));
        }
        Ok(())
    }
}

impl fmt::Display for PfcConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let prios = self
            .priorities()
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<String>>()
            .join(",");
        write!(f, "cap={} mbc={} enable=[{prios}]", self.cap, self.mbc)
    }
}

/// Contents of a PFC Configuration TLV
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize,
)]
pub struct PfcTlv {
    pub willing: bool,
    pub config: PfcConfig,
}

impl TryFrom<&PfcTlv> for LldpTlv {
    type Error = crate::ProtocolError;

    fn try_from(pfc: &PfcTlv) -> ProtocolResult<Self> {
        if pfc.config.cap > PRIORITIES {
            return Err(invalid(format!("pfc cap {} exceeds 8", pfc.config.cap)));
        }
        let mut flags = pfc.config.cap & PFC_CAP_MASK;
        if pfc.willing {
            flags |= PFC_WILLING;
        }
        if pfc.config.mbc {
            flags |= PFC_MBC;
        }
        LldpTlv::org_specific(
            IEEE_8021_OUI,
            PFC_SUBTYPE,
            &[flags, pfc.config.enable],
        )
    }
}

impl TryFrom<&LldpTlv> for PfcTlv {
    type Error = crate::ProtocolError;

    fn try_from(tlv: &LldpTlv) -> ProtocolResult<Self> {
        match tlv.org_id() {
            Some((IEEE_8021_OUI, PFC_SUBTYPE)) => {}
            _ => return Err(malformed("not a PFC configuration TLV")),
        }
        match &tlv.lldp_tlv_octets[4..] {
            [flags, enable] => {
                let cap = flags & PFC_CAP_MASK;
                if cap > PRIORITIES {
                    return Err(malformed(format!("pfc cap {cap} exceeds 8")));
                }
                Ok(PfcTlv {
                    willing: flags & PFC_WILLING != 0,
                    config: PfcConfig {
                        mbc: flags & PFC_MBC != 0,
                        cap,
                        enable: *enable,
                    },
                })
            }
            x => Err(malformed(format!(
                "PFC tlv carries {} octets of data, expected 2",
                x.len()
            ))),
        }
    }
}
