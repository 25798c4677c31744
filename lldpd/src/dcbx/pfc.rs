// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Priority-based Flow Control

use std::sync::Arc;

use protocol::dcbx::PfcConfig;
use protocol::dcbx::PfcTlv;
use protocol::dcbx::PRIORITIES;

use super::Feature;
use super::FeatureOps;
use super::LocalParams;
use crate::errors::LldpdError;
use crate::tlv::Fields;
use crate::tlv::TlvData;
use crate::tlv::TlvKey;
use crate::types::LldpdResult;

/// Called with the link name whenever the operating PFC configuration must
/// be applied to the hardware
pub type PfcAction =
    Arc<dyn Fn(&str, &PfcConfig) -> LldpdResult<()> + Send + Sync>;

pub struct PfcOps {
    action: Option<PfcAction>,
}

impl PfcOps {
    pub fn new(action: Option<PfcAction>) -> Self {
        PfcOps { action }
    }
}

fn parse_bool(key: &str, value: &str) -> LldpdResult<bool> {
    value
        .parse()
        .map_err(|_| LldpdError::Invalid(format!("{key} must be true or false")))
}

impl FeatureOps for PfcOps {
    type Config = PfcConfig;

    fn feature(&self) -> Feature {
        Feature::Pfc
    }

    fn default_config(&self) -> PfcConfig {
        PfcConfig {
            mbc: false,
            cap: PRIORITIES,
            enable: 0,
        }
    }

    fn default_willing(&self) -> bool {
        true
    }

    fn is_compatible(&self, oper: &PfcConfig, peer: &PfcConfig) -> bool {
        oper.enable == peer.enable
    }

    fn set_config(
        &self,
        target: &mut PfcConfig,
        source: &PfcConfig,
    ) -> LldpdResult<()> {
        let enabled = source.enable.count_ones() as u8;
        if enabled > target.cap {
            return Err(LldpdError::Invalid(format!(
                "peer enables {enabled} priorities, local cap is {}",
                target.cap
            )));
        }
        target.enable = source.enable;
        target.mbc = source.mbc;
        Ok(())
    }

    fn peer_config(&self, fields: &Fields) -> Option<(bool, PfcConfig)> {
        match fields.get(&TlvKey::PFC) {
            Some(TlvData::Pfc(pfc)) => Some((pfc.willing, pfc.config)),
            _ => None,
        }
    }

    fn advertise(&self, willing: bool, config: &PfcConfig) -> TlvData {
        TlvData::Pfc(PfcTlv {
            willing,
            config: *config,
        })
    }

    fn set_property(
        &self,
        local: &mut LocalParams<PfcConfig>,
        key: &str,
        value: &str,
    ) -> LldpdResult<()> {
        let mut config = local.config;
        match key {
            "willing" => {
                local.willing = parse_bool(key, value)?;
                return Ok(());
            }
            "mbc" => config.mbc = parse_bool(key, value)?,
            "cap" => {
                config.cap = value.parse().map_err(|_| {
                    LldpdError::Invalid(format!("invalid pfc cap: {value}"))
                })?
            }
            "enable" => {
                let prios = value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(|p| {
                        p.parse::<u8>().map_err(|_| {
                            LldpdError::Invalid(format!("invalid priority: {p}"))
                        })
                    })
                    .collect::<LldpdResult<Vec<u8>>>()?;
                config = PfcConfig::from_priorities(config.mbc, config.cap, &prios)?;
            }
            _ => {
                return Err(LldpdError::Invalid(format!(
                    "unknown pfc property: {key}"
                )))
            }
        }
        config.validate()?;
        local.config = config;
        Ok(())
    }

    fn action(&self, link: &str, config: &PfcConfig) -> LldpdResult<()> {
        match &self.action {
            Some(f) => f(link, config).map_err(|e| match e {
                LldpdError::Action(_) => e,
                e => LldpdError::Action(e.to_string()),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn params() -> LocalParams<PfcConfig> {
        let ops = PfcOps::new(None);
        LocalParams {
            willing: ops.default_willing(),
            config: ops.default_config(),
        }
    }

    #[test]
    fn test_properties() {
        let ops = PfcOps::new(None);
        let mut p = params();
        ops.set_property(&mut p, "enable", "3, 4").unwrap();
        assert_eq!(p.config.enable, 0x18);
        ops.set_property(&mut p, "willing", "false").unwrap();
        assert!(!p.willing);
        ops.set_property(&mut p, "mbc", "true").unwrap();
        assert!(p.config.mbc);
        ops.set_property(&mut p, "enable", "").unwrap();
        assert_eq!(p.config.enable, 0);

        let before = p.clone();
        for (k, v) in [
            ("enable", "8"),
            ("enable", "x"),
            ("cap", "9"),
            ("willing", "maybe"),
            ("speed", "fast"),
        ] {
            assert!(
                matches!(ops.set_property(&mut p, k, v), Err(LldpdError::Invalid(_))),
                "{k}={v}"
            );
        }
        assert_eq!(p, before);
    }

    #[test]
    fn test_cap_limits_enable() {
        let ops = PfcOps::new(None);
        let mut p = params();
        ops.set_property(&mut p, "enable", "0,1,2").unwrap();
        assert!(ops.set_property(&mut p, "cap", "2").is_err());
        assert_eq!(p.config.cap, 8);

        let mut target = PfcConfig {
            mbc: false,
            cap: 2,
            enable: 0,
        };
        assert!(ops.set_config(&mut target, &p.config).is_err());
        assert_eq!(target.enable, 0);
        target.cap = 3;
        ops.set_config(&mut target, &p.config).unwrap();
        assert_eq!(target.enable, 0x07);
        assert_eq!(target.cap, 3);
    }

    #[test]
    fn test_compatibility() {
        let ops = PfcOps::new(None);
        let a = PfcConfig {
            mbc: false,
            cap: 8,
            enable: 0x08,
        };
        let b = PfcConfig {
            mbc: true,
            cap: 4,
            ..a
        };
        assert!(ops.is_compatible(&a, &b));
        assert!(!ops.is_compatible(&a, &PfcConfig { enable: 0x0c, ..a }));
    }

    #[test]
    fn test_action_hook() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let hook: PfcAction =
            Arc::new(move |link: &str, cfg: &PfcConfig| -> LldpdResult<()> {
                if cfg.enable == 0xff {
                    return Err(LldpdError::Other("no".to_string()));
                }
                s.lock().unwrap().push((link.to_string(), cfg.enable));
                Ok(())
            });
        let ops = PfcOps::new(Some(hook));
        let cfg = PfcConfig {
            mbc: false,
            cap: 8,
            enable: 0x01,
        };
        ops.action("qsfp0", &cfg).unwrap();
        assert!(matches!(
            ops.action("qsfp0", &PfcConfig { enable: 0xff, ..cfg }),
            Err(LldpdError::Action(_))
        ));
        assert_eq!(*seen.lock().unwrap(), vec![("qsfp0".to_string(), 0x01)]);
    }
}
