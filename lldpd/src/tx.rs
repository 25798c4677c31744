// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The transmit state machine (802.1AB section 9.2.8)

use std::sync::Arc;

use serde::Serialize;
use slog::debug;
use slog::error;
use slog::trace;
use slog::warn;

use crate::agent::Agent;
use crate::errors::LldpdError;
use crate::mib::LocalMib;
use crate::tlv::TlvKey;
use crate::tlv::TlvRegistry;
use crate::txtimer::TxPacer;
use crate::txtimer::TxTimerState;
use crate::types::AgentCfg;
use crate::types::LldpdResult;
use protocol::packet::EthHdr;
use protocol::packet::LldpTlv;
use protocol::types::ttl_to_tlv;
use protocol::MacAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TxState {
    Initialize,
    Idle,
    /// Sent a shutdown LLDPDU, and waiting out the reinit delay
    PortShutdown,
}

/// Transmit-side state, shared by the transmitter and its timer
pub(crate) struct TxShared {
    pub state: TxState,
    pub timer_state: TxTimerState,
    pub pacer: TxPacer,
    /// Ticks left before a shut-down port may reinitialize
    pub shutdown_while: u16,
}

impl TxShared {
    pub fn new(cfg: &AgentCfg) -> Self {
        TxShared {
            state: TxState::Initialize,
            timer_state: TxTimerState::Initialize,
            pacer: TxPacer::new(cfg),
            shutdown_while: 0,
        }
    }
}

fn mandatory(
    registry: &TlvRegistry,
    local: &LocalMib,
) -> LldpdResult<Vec<LldpTlv>> {
    [TlvKey::CHASSIS_ID, TlvKey::PORT_ID, TlvKey::TTL]
        .iter()
        .map(|key| {
            let codec = registry
                .lookup(key)
                .ok_or_else(|| LldpdError::Missing(format!("codec for {key}")))?;
            codec.write(local)?.ok_or_else(|| {
                LldpdError::Invalid(format!("no local value for {key}"))
            })
        })
        .collect()
}

fn finish(smac: MacAddr, tlvs: &[LldpTlv]) -> Vec<u8> {
    let hdr = EthHdr::lldp(smac);
    let mut frame = Vec::with_capacity(
        hdr.size() + tlvs.iter().map(LldpTlv::wire_size).sum::<usize>(),
    );
    hdr.deparse(&mut frame);
    tlvs.iter().for_each(|tlv| tlv.deparse(&mut frame));
    frame
}

/// Assemble an LLDPDU from the local MIB.  The mandatory TLVs must all be
/// present.  Optional TLVs that fail to encode are skipped, as are any that
/// would push the LLDPDU past the link's MTU.
pub fn build_frame(
    registry: &TlvRegistry,
    local: &LocalMib,
    smac: MacAddr,
    mtu: usize,
    log: &slog::Logger,
) -> LldpdResult<Vec<u8>> {
    let mut tlvs = mandatory(registry, local)?;
    let end = LldpTlv::end();
    let mut size: usize =
        tlvs.iter().map(LldpTlv::wire_size).sum::<usize>() + end.wire_size();
    if size > mtu {
        return Err(LldpdError::Invalid(format!(
            "mandatory tlvs need {size} bytes, mtu is {mtu}"
        )));
    }

    let mut dropped = Vec::new();
    for codec in local.write_list.iter() {
        let tlv = match codec.write(local) {
            Ok(Some(tlv)) => tlv,
            Ok(None) => continue,
            Err(e) => {
                warn!(log, "skipping {} tlv: {e}", codec.name());
                continue;
            }
        };
        if !dropped.is_empty() || size + tlv.wire_size() > mtu {
            dropped.push(codec.name());
            continue;
        }
        size += tlv.wire_size();
        tlvs.push(tlv);
    }
    if !dropped.is_empty() {
        warn!(log, "lldpdu exceeds mtu {mtu}; dropped {}", dropped.join(", "));
    }

    tlvs.push(end);
    Ok(finish(smac, &tlvs))
}

/// The LLDPDU announcing that this agent is going away
pub fn build_shutdown_frame(
    registry: &TlvRegistry,
    local: &LocalMib,
    smac: MacAddr,
) -> LldpdResult<Vec<u8>> {
    let mut tlvs = mandatory(registry, local)?;
    tlvs[2] = ttl_to_tlv(0);
    tlvs.push(LldpTlv::end());
    Ok(finish(smac, &tlvs))
}

fn send(agent: &Agent, log: &slog::Logger, frame: LldpdResult<Vec<u8>>) {
    let frame = match frame {
        Ok(f) => f,
        Err(e) => {
            error!(log, "failed to build lldpdu: {e}");
            return;
        }
    };
    match agent.transport.send(&frame) {
        Ok(()) => {
            trace!(log, "sent {} byte lldpdu", frame.len());
            agent.bump(|s| s.frames_out_total += 1);
        }
        Err(e) => error!(log, "failed to send lldpdu: {e}"),
    }
}

fn send_info(agent: &Agent, log: &slog::Logger) {
    let mtu = agent.status().mtu;
    let frame = {
        let local = agent.local.read().unwrap();
        build_frame(&agent.services.tlvs, &local, agent.mac, mtu, log)
    };
    send(agent, log, frame);
}

fn send_shutdown(agent: &Agent, log: &slog::Logger) {
    debug!(log, "sending shutdown lldpdu");
    let frame = {
        let local = agent.local.read().unwrap();
        build_shutdown_frame(&agent.services.tlvs, &local, agent.mac)
    };
    send(agent, log, frame);
}

pub(crate) fn tx_loop(agent: Arc<Agent>) {
    let log = agent.log.new(slog::o!("unit" => "tx"));
    debug!(log, "tx state machine started");

    let mut tx = agent.tx.lock().unwrap();
    loop {
        let status = agent.status();
        if status.shutdown {
            if tx.state == TxState::Idle && status.link_up {
                drop(tx);
                send_shutdown(&agent, &log);
            }
            break;
        }

        let next = match tx.state {
            TxState::Initialize if status.tx_enabled() => {
                drop(tx);
                agent.local.write().unwrap().ttl = agent.cfg.tx_ttl();
                tx = agent.tx.lock().unwrap();
                Some(TxState::Idle)
            }
            TxState::Initialize => None,
            TxState::Idle if !status.tx_enabled() => {
                if status.link_up {
                    drop(tx);
                    send_shutdown(&agent, &log);
                    tx = agent.tx.lock().unwrap();
                    tx.shutdown_while = agent.cfg.reinit_delay;
                    Some(TxState::PortShutdown)
                } else {
                    Some(TxState::Initialize)
                }
            }
            TxState::Idle => {
                if tx.pacer.take_send() {
                    drop(tx);
                    send_info(&agent, &log);
                    tx = agent.tx.lock().unwrap();
                    continue;
                }
                None
            }
            TxState::PortShutdown if tx.shutdown_while == 0 => {
                Some(TxState::Initialize)
            }
            TxState::PortShutdown => None,
        };

        match next {
            Some(next) => {
                trace!(log, "{:?} -> {next:?}", tx.state);
                tx.state = next;
            }
            None => tx = agent.tx_cv.wait(tx).unwrap(),
        }
    }
    debug!(log, "tx state machine exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::test_logger;
    use crate::mib::Msap;
    use crate::tlv::TlvData;
    use protocol::packet::TlvReader;
    use protocol::types::ChassisId;
    use protocol::types::PortId;

    const SMAC: MacAddr = MacAddr::new(0xa8, 0x40, 0x25, 0, 0, 1);

    fn local(registry: &TlvRegistry) -> LocalMib {
        let mut local = LocalMib::new(
            Msap {
                chassis_id: ChassisId::MacAddress(SMAC),
                port_id: PortId::InterfaceName("qsfp0".to_string()),
            },
            121,
        );
        local
            .fields
            .insert(TlvKey::SYS_NAME, TlvData::SystemName("sw0".to_string()));
        local.fields.insert(
            TlvKey::SYS_DESC,
            TlvData::SystemDescription("x".repeat(200)),
        );
        for key in [TlvKey::PORT_DESC, TlvKey::SYS_NAME, TlvKey::SYS_DESC] {
            local.write_list.add(registry.lookup(&key).unwrap());
        }
        local
    }

    fn tlv_keys(frame: &[u8]) -> Vec<TlvKey> {
        let (hdr, len) = EthHdr::parse(frame).unwrap();
        assert_eq!(hdr, EthHdr::lldp(SMAC));
        TlvReader::new(&frame[len..])
            .map(|t| TlvKey::of(&t.unwrap()))
            .collect()
    }

    #[test]
    fn test_frame_layout() {
        let registry = TlvRegistry::with_defaults();
        let local = local(&registry);
        let frame =
            build_frame(&registry, &local, SMAC, 1500, &test_logger()).unwrap();
        let end = TlvKey::of(&LldpTlv::end());
        // No port description has been set, so none is sent
        assert_eq!(
            tlv_keys(&frame),
            vec![
                TlvKey::CHASSIS_ID,
                TlvKey::PORT_ID,
                TlvKey::TTL,
                TlvKey::SYS_NAME,
                TlvKey::SYS_DESC,
                end
            ]
        );
    }

    #[test]
    fn test_mtu_drops_trailing_tlvs() {
        let registry = TlvRegistry::with_defaults();
        let local = local(&registry);
        let frame =
            build_frame(&registry, &local, SMAC, 100, &test_logger()).unwrap();
        let keys = tlv_keys(&frame);
        assert!(keys.contains(&TlvKey::SYS_NAME));
        assert!(!keys.contains(&TlvKey::SYS_DESC));

        assert!(build_frame(&registry, &local, SMAC, 10, &test_logger())
            .is_err());
    }

    #[test]
    fn test_shutdown_frame() {
        let registry = TlvRegistry::with_defaults();
        let local = local(&registry);
        let frame = build_shutdown_frame(&registry, &local, SMAC).unwrap();
        let (_, len) = EthHdr::parse(&frame).unwrap();
        let tlvs: Vec<LldpTlv> =
            TlvReader::new(&frame[len..]).map(|t| t.unwrap()).collect();
        assert_eq!(tlvs.len(), 4);
        assert_eq!(tlvs[2], ttl_to_tlv(0));
        assert_eq!(tlvs[3], LldpTlv::end());
    }

    #[test]
    fn test_missing_mandatory_codec() {
        let registry = TlvRegistry::new();
        let local = local(&TlvRegistry::with_defaults());
        assert!(matches!(
            build_frame(&registry, &local, SMAC, 1500, &test_logger()),
            Err(LldpdError::Missing(_))
        ));
    }
}
