// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The receive state machine (802.1AB section 9.2.9).
//!
//! Frames are read from the link by a separate reader thread, which hands
//! them to the state machine through a single-slot mailbox.  The state
//! machine parses each LLDPDU, updates the remote MIB, and keeps one aging
//! timer per peer.  Aging timers never touch the remote MIB themselves: they
//! queue the expired MSAP and wake this thread, which does the removal.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use slog::debug;
use slog::error;
use slog::info;
use slog::trace;
use slog::warn;

use crate::agent::Agent;
use crate::events::Event;
use crate::events::RemoteChange;
use crate::dcbx::FeatureEvent;
use crate::mib::diff;
use crate::mib::ChangeKind;
use crate::mib::ChangeSet;
use crate::mib::Msap;
use crate::mib::RemoteEntry;
use crate::mib::RemoteMib;
use crate::timer::TimerId;
use crate::tlv::Fields;
use crate::tlv::TlvData;
use crate::tlv::TlvError;
use crate::tlv::TlvKey;
use crate::tlv::TlvRegistry;
use crate::types::LldpdResult;
use protocol::packet::EthHdr;
use protocol::packet::TlvReader;
use protocol::packet::ETHER_LLDP;
use protocol::MacAddr;
use protocol::ProtocolError;

/// How long the reader blocks in the transport before checking whether it
/// has been asked to stop
const READ_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RxState {
    PortDisabled,
    Initialize,
    WaitForFrame,
    Frame,
}

/// Active too-many-neighbors backoff
pub(crate) struct TooMany {
    deadline: Instant,
    timer: Option<TimerId>,
}

/// State shared between the receive state machine and the threads that
/// wake it
pub(crate) struct RxShared {
    pub state: RxState,
    /// Peers whose aging timers have fired
    pub aged: Vec<Msap>,
    pub too_many: Option<TooMany>,
}

impl RxShared {
    pub fn new() -> Self {
        RxShared {
            state: RxState::PortDisabled,
            aged: Vec::new(),
            too_many: None,
        }
    }
}

/// Handoff between the reader thread and the state machine
#[derive(Default)]
pub(crate) struct ReaderSlot {
    pub frame: Option<Vec<u8>>,
    pub running: bool,
}

/// Everything the state machine needs to pick its next step
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RxInputs {
    pub shutdown: bool,
    pub link_up: bool,
    pub rx_enabled: bool,
    pub aged: bool,
    pub frame: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RxAction {
    /// Nothing to do until something changes
    Wait,
    /// Remove expired peers, then re-evaluate in the same state
    DeleteAged,
    Enter(RxState),
    Exit,
}

pub(crate) fn rx_next(state: RxState, i: &RxInputs) -> RxAction {
    if i.shutdown {
        return RxAction::Exit;
    }
    match state {
        RxState::PortDisabled => {
            if i.aged {
                RxAction::DeleteAged
            } else if i.link_up {
                RxAction::Enter(RxState::Initialize)
            } else {
                RxAction::Wait
            }
        }
        RxState::Initialize => {
            if !i.link_up {
                RxAction::Enter(RxState::PortDisabled)
            } else if i.rx_enabled {
                RxAction::Enter(RxState::WaitForFrame)
            } else {
                RxAction::Wait
            }
        }
        RxState::WaitForFrame => {
            if i.aged {
                RxAction::DeleteAged
            } else if !i.link_up {
                RxAction::Enter(RxState::PortDisabled)
            } else if !i.rx_enabled {
                RxAction::Enter(RxState::Initialize)
            } else if i.frame {
                RxAction::Enter(RxState::Frame)
            } else {
                RxAction::Wait
            }
        }
        RxState::Frame => RxAction::Enter(RxState::WaitForFrame),
    }
}

/// Why an LLDPDU was not accepted
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RxError {
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A TLV claimed more octets than the LLDPDU holds
    #[error("length error: {0}")]
    Length(String),
    /// The remote MIB has no room for a new peer
    #[error("too many neighbors")]
    TooManyNeighbors { ttl: u16 },
}

/// A successfully parsed LLDPDU, and how it relates to the remote MIB
#[derive(Debug)]
pub struct ParsedFrame {
    pub msap: Msap,
    pub ttl: u16,
    /// Every TLV other than the mandatory three
    pub fields: Fields,
    pub changes: ChangeSet,
    /// Well-formed TLVs with no registered codec
    pub unrecognized: u64,
    /// TLVs skipped as duplicates
    pub discarded: u64,
}

fn protocol(msg: impl ToString) -> RxError {
    RxError::Protocol(msg.to_string())
}

fn framing(e: ProtocolError) -> RxError {
    match e {
        ProtocolError::Truncated(_) => RxError::Length(e.to_string()),
        e => protocol(e),
    }
}

/// Parse an LLDPDU (the frame with its Ethernet header removed) and classify
/// it against the remote MIB.
pub fn parse_frame(
    registry: &TlvRegistry,
    data: &[u8],
    remote: &RemoteMib,
    max_neighbors: usize,
) -> Result<ParsedFrame, RxError> {
    let mut reader = TlvReader::new(data);
    let mut fields = Fields::new();

    for (idx, expected) in
        [TlvKey::CHASSIS_ID, TlvKey::PORT_ID, TlvKey::TTL].iter().enumerate()
    {
        let tlv = match reader.next() {
            Some(Ok(tlv)) => tlv,
            Some(Err(e)) => return Err(framing(e)),
            None => {
                return Err(protocol(format!("missing mandatory {expected} tlv")))
            }
        };
        let key = TlvKey::of(&tlv);
        if key != *expected {
            return Err(protocol(format!(
                "tlv {idx} is {key}, expected {expected}"
            )));
        }
        let codec = registry
            .lookup(expected)
            .ok_or_else(|| protocol(format!("no codec for {expected}")))?;
        codec.parse(&tlv, &mut fields).map_err(|e| protocol(e))?;
    }

    let chassis_id = match fields.remove(&TlvKey::CHASSIS_ID) {
        Some(TlvData::ChassisId(c)) => c,
        _ => return Err(protocol("chassis id codec stored no id")),
    };
    let port_id = match fields.remove(&TlvKey::PORT_ID) {
        Some(TlvData::PortId(p)) => p,
        _ => return Err(protocol("port id codec stored no id")),
    };
    let ttl = match fields.remove(&TlvKey::TTL) {
        Some(TlvData::Ttl(t)) => t,
        _ => return Err(protocol("ttl codec stored no ttl")),
    };
    let msap = Msap {
        chassis_id,
        port_id,
    };
    let existing = remote.get(&msap).map(|e| &e.fields);

    if ttl == 0 {
        return Ok(ParsedFrame {
            msap,
            ttl,
            fields,
            changes: ChangeSet::shutdown(existing),
            unrecognized: 0,
            discarded: 0,
        });
    }

    let mut unrecognized = 0;
    let mut discarded = 0;
    for tlv in reader {
        let tlv = tlv.map_err(framing)?;
        if tlv.lldp_tlv_type == 0 {
            break;
        }
        let key = TlvKey::of(&tlv);
        if key.is_mandatory() {
            return Err(protocol(format!("repeated {key} tlv")));
        }
        let Some(codec) = registry.lookup(&key) else {
            unrecognized += 1;
            continue;
        };
        match codec.parse(&tlv, &mut fields) {
            Ok(()) => {}
            Err(TlvError::Duplicate) => discarded += 1,
            Err(TlvError::Resource) => {
                return Err(RxError::TooManyNeighbors { ttl })
            }
            Err(TlvError::Protocol(e)) => {
                return Err(protocol(format!("{}: {e}", codec.name())))
            }
        }
    }

    if existing.is_none() && remote.len() >= max_neighbors {
        return Err(RxError::TooManyNeighbors { ttl });
    }
    let changes = diff(registry, existing, &fields);
    Ok(ParsedFrame {
        msap,
        ttl,
        fields,
        changes,
        unrecognized,
        discarded,
    })
}

/// Aging timer callback
fn info_aged(agent: &Agent, msap: Msap) {
    let mut rx = agent.rx.lock().unwrap();
    rx.aged.push(msap);
    agent.rx_cv.notify_all();
}

fn schedule_aging(
    agent: &Arc<Agent>,
    msap: &Msap,
    ttl: u16,
) -> LldpdResult<(TimerId, Instant)> {
    let delay = agent.cfg.tick * ttl as u32;
    let deadline = Instant::now() + delay;
    let a = agent.clone();
    let m = msap.clone();
    let id = agent
        .services
        .timers
        .schedule(delay, move || info_aged(&a, m))?;
    Ok((id, deadline))
}

/// Apply a parsed LLDPDU to the remote MIB.  Returns the kind of change made,
/// if any.
fn apply(
    agent: &Arc<Agent>,
    log: &slog::Logger,
    remote: &mut RemoteMib,
    p: ParsedFrame,
    src_mac: MacAddr,
) -> Option<(Msap, ChangeKind)> {
    let timers = &agent.services.timers;
    let now = Utc::now();

    match p.changes.kind {
        ChangeKind::Shutdown => {
            let old = remote.remove(&p.msap)?;
            if let Some(id) = old.timer {
                timers.cancel(id);
            }
            info!(log, "neighbor {} shut down", p.msap);
            Some((p.msap, ChangeKind::Shutdown))
        }
        ChangeKind::NoChange => {
            let entry = remote.get_mut(&p.msap)?;
            // If we can't reschedule, leave the old timer to age the entry
            // out at its original expiration.
            let (id, deadline) = match schedule_aging(agent, &p.msap, p.ttl) {
                Ok(x) => x,
                Err(e) => {
                    error!(log, "failed to refresh {}: {e}", p.msap);
                    return None;
                }
            };
            if let Some(old) = entry.timer.replace(id) {
                timers.cancel(old);
            }
            entry.rx_info_ttl = deadline;
            entry.ttl = p.ttl;
            entry.src_mac = src_mac;
            entry.last_seen = now;
            trace!(log, "refreshed {}", p.msap);
            None
        }
        kind @ (ChangeKind::NewNeighbor | ChangeKind::Modified) => {
            // An entry without a live aging timer would never go away, so we
            // drop the LLDPDU rather than store it.
            let (id, deadline) = match schedule_aging(agent, &p.msap, p.ttl) {
                Ok(x) => x,
                Err(e) => {
                    error!(log, "dropping lldpdu from {}: {e}", p.msap);
                    agent.bump(|s| s.frames_discarded_total += 1);
                    return None;
                }
            };
            let old = remote.remove(&p.msap);
            if let Some(t) = old.as_ref().and_then(|o| o.timer) {
                timers.cancel(t);
            }
            let (index, first_seen) = match &old {
                Some(o) => (o.index, o.first_seen),
                None => (remote.alloc_index(), now),
            };
            if kind == ChangeKind::NewNeighbor {
                info!(log, "new neighbor {} via {src_mac}", p.msap;
                    "index" => index);
            } else {
                info!(log, "neighbor {} updated", p.msap;
                    "added" => p.changes.added.len(),
                    "deleted" => p.changes.deleted.len(),
                    "modified" => p.changes.modified.len());
            }
            remote.insert(
                p.msap.clone(),
                RemoteEntry {
                    index,
                    src_mac,
                    ttl: p.ttl,
                    fields: p.fields,
                    rx_info_ttl: deadline,
                    timer: Some(id),
                    first_seen,
                    last_changed: now,
                    last_seen: now,
                },
            );
            Some((p.msap, kind))
        }
    }
}

fn too_many_expired(agent: &Agent) {
    let mut rx = agent.rx.lock().unwrap();
    if rx.too_many.as_ref().is_some_and(|t| t.deadline <= Instant::now()) {
        rx.too_many = None;
        info!(agent.log, "too-many-neighbors condition cleared");
    }
}

/// The remote MIB is full.  Hold the too-many-neighbors condition until the
/// later of its current expiration and this peer's TTL.
fn too_many_neighbors(agent: &Arc<Agent>, log: &slog::Logger, ttl: u16) {
    let delay = agent.cfg.tick * ttl as u32;
    let deadline = Instant::now() + delay;
    let mut rx = agent.rx.lock().unwrap();
    match rx.too_many.take() {
        Some(t) if t.deadline >= deadline => {
            rx.too_many = Some(t);
            return;
        }
        Some(t) => {
            if let Some(id) = t.timer {
                agent.services.timers.cancel(id);
            }
        }
        None => warn!(log, "remote MIB is full; ignoring new neighbors"),
    }
    let a = agent.clone();
    let timer = match agent
        .services
        .timers
        .schedule(delay, move || too_many_expired(&a))
    {
        Ok(id) => Some(id),
        Err(e) => {
            error!(log, "failed to schedule too-many-neighbors timer: {e}");
            None
        }
    };
    rx.too_many = Some(TooMany { deadline, timer });
}

fn process_frame(agent: &Arc<Agent>, log: &slog::Logger, frame: &[u8]) {
    let (hdr, hdr_len) = match EthHdr::parse(frame) {
        Ok(x) => x,
        Err(e) => {
            debug!(log, "bad ethernet header: {e}");
            agent.bump(|s| {
                s.frames_in_errors_total += 1;
                s.frames_discarded_total += 1;
            });
            return;
        }
    };
    if hdr.eth_type != ETHER_LLDP {
        trace!(log, "ignoring ethertype {:#x}", hdr.eth_type);
        return;
    }
    if hdr.eth_smac == agent.mac {
        trace!(log, "ignoring reflected lldpdu");
        return;
    }
    agent.bump(|s| s.frames_in_total += 1);

    let mut remote = agent.remote.lock().unwrap();
    let parsed = parse_frame(
        &agent.services.tlvs,
        &frame[hdr_len..],
        &remote,
        agent.cfg.max_neighbors,
    );
    let p = match parsed {
        Ok(p) => p,
        Err(RxError::Protocol(e)) => {
            drop(remote);
            debug!(log, "discarding lldpdu from {}: {e}", hdr.eth_smac);
            agent.bump(|s| {
                s.frames_in_errors_total += 1;
                s.frames_discarded_total += 1;
                s.tlvs_discarded_total += 1;
            });
            return;
        }
        Err(RxError::Length(e)) => {
            drop(remote);
            debug!(log, "discarding lldpdu from {}: {e}", hdr.eth_smac);
            agent.bump(|s| {
                s.frames_in_errors_total += 1;
                s.frames_discarded_total += 1;
                s.lldpdu_length_errors += 1;
            });
            return;
        }
        Err(RxError::TooManyNeighbors { ttl }) => {
            drop(remote);
            agent.bump(|s| {
                s.frames_discarded_total += 1;
                s.too_many_neighbors_total += 1;
            });
            too_many_neighbors(agent, log, ttl);
            return;
        }
    };
    let (unrecognized, discarded) = (p.unrecognized, p.discarded);
    agent.bump(|s| {
        s.tlvs_unrecognized_total += unrecognized;
        s.tlvs_discarded_total += unrecognized + discarded;
    });

    let outcome = apply(agent, log, &mut remote, p, hdr.eth_smac);
    drop(remote);

    let Some((msap, kind)) = outcome else {
        return;
    };
    let change = match kind {
        ChangeKind::NewNeighbor => {
            agent.new_neighbor();
            RemoteChange::NewNeighbor
        }
        ChangeKind::Modified => RemoteChange::Modified,
        ChangeKind::Shutdown => RemoteChange::Shutdown,
        ChangeKind::NoChange => return,
    };
    agent.publish(Event::RemoteChanged {
        link: agent.name.clone(),
        msap: Some(msap),
        change,
    });
    agent.poke_features(FeatureEvent::PeerUpdate);
}

fn delete_aged(agent: &Agent, log: &slog::Logger) {
    let aged = std::mem::take(&mut agent.rx.lock().unwrap().aged);
    let now = Instant::now();
    let mut removed = Vec::new();
    {
        let mut remote = agent.remote.lock().unwrap();
        for msap in aged {
            // A refresh after the timer fired leaves a later expiration
            // behind.  That entry has a new timer of its own.
            if remote.get(&msap).is_some_and(|e| e.rx_info_ttl <= now) {
                remote.remove(&msap);
                removed.push(msap);
            } else {
                trace!(log, "ignoring stale aging event for {msap}");
            }
        }
    }
    if removed.is_empty() {
        return;
    }
    for msap in removed {
        info!(log, "neighbor {msap} aged out");
        agent.bump(|s| s.ageouts_total += 1);
        agent.publish(Event::RemoteChanged {
            link: agent.name.clone(),
            msap: Some(msap),
            change: RemoteChange::Aged,
        });
    }
    agent.poke_features(FeatureEvent::PeerUpdate);
}

/// Forget every peer, cancelling their aging timers
fn flush_remote(agent: &Agent) -> bool {
    let timers = agent.remote.lock().unwrap().clear();
    let flushed = !timers.is_empty();
    for id in timers {
        agent.services.timers.cancel(id);
    }
    flushed
}

fn rx_initialize(agent: &Arc<Agent>, log: &slog::Logger) {
    if flush_remote(agent) {
        agent.publish(Event::RemoteChanged {
            link: agent.name.clone(),
            msap: None,
            change: RemoteChange::Cleared,
        });
        agent.poke_features(FeatureEvent::PeerUpdate);
    }

    let mut slot = agent.reader.lock().unwrap();
    if slot.frame.take().is_some() {
        agent.reader_cv.notify_all();
    }
    if !slot.running {
        slot.running = true;
        drop(slot);
        if let Err(e) = agent.spawn("rx-reader", reader_loop) {
            error!(log, "failed to start frame reader: {e}");
            agent.reader.lock().unwrap().running = false;
        }
    }
}

fn rx_exit(agent: &Agent) {
    flush_remote(agent);
    if let Some(t) = agent.rx.lock().unwrap().too_many.take() {
        if let Some(id) = t.timer {
            agent.services.timers.cancel(id);
        }
    }
}

fn rx_frame(agent: &Arc<Agent>, log: &slog::Logger) {
    let Some(frame) = agent.reader.lock().unwrap().frame.take() else {
        return;
    };
    process_frame(agent, log, &frame);

    let _slot = agent.reader.lock().unwrap();
    agent.reader_cv.notify_all();
}

pub(crate) fn reader_loop(agent: Arc<Agent>) {
    let log = agent.log.new(slog::o!("unit" => "rx-reader"));
    debug!(log, "frame reader started");
    loop {
        {
            let mut slot = agent.reader.lock().unwrap();
            loop {
                if agent.status().shutdown {
                    slot.running = false;
                    debug!(log, "frame reader exiting");
                    return;
                }
                if slot.frame.is_none() {
                    break;
                }
                slot = agent.reader_cv.wait(slot).unwrap();
            }
        }

        match agent.transport.recv(READ_TIMEOUT) {
            Ok(None) => {}
            Ok(Some(frame)) => {
                trace!(log, "read {} byte frame", frame.len());
                agent.reader.lock().unwrap().frame = Some(frame);
                let _rx = agent.rx.lock().unwrap();
                agent.rx_cv.notify_all();
            }
            Err(e) => {
                if !agent.status().shutdown {
                    error!(log, "failed to read from link: {e}");
                    std::thread::sleep(READ_TIMEOUT);
                }
            }
        }
    }
}

pub(crate) fn rx_loop(agent: Arc<Agent>) {
    let log = agent.log.new(slog::o!("unit" => "rx"));
    let mut state = RxState::PortDisabled;
    debug!(log, "rx state machine started");

    loop {
        let action = {
            let mut rx = agent.rx.lock().unwrap();
            loop {
                let status = agent.status();
                let inputs = RxInputs {
                    shutdown: status.shutdown,
                    link_up: status.link_up,
                    rx_enabled: status.rx_enabled(),
                    aged: !rx.aged.is_empty(),
                    frame: agent.reader.lock().unwrap().frame.is_some(),
                };
                match rx_next(state, &inputs) {
                    RxAction::Wait => rx = agent.rx_cv.wait(rx).unwrap(),
                    action => break action,
                }
            }
        };

        match action {
            RxAction::Wait => {}
            RxAction::Exit => break,
            RxAction::DeleteAged => delete_aged(&agent, &log),
            RxAction::Enter(next) => {
                trace!(log, "{state:?} -> {next:?}");
                state = next;
                agent.rx.lock().unwrap().state = state;
                match state {
                    RxState::Initialize => rx_initialize(&agent, &log),
                    RxState::Frame => rx_frame(&agent, &log),
                    RxState::PortDisabled | RxState::WaitForFrame => {}
                }
            }
        }
    }

    rx_exit(&agent);
    debug!(log, "rx state machine exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::link::LinkEvent;
    use crate::link::Segment;
    use crate::link::Transport;
    use crate::test_support::*;
    use crate::types::AgentCfg;
    use protocol::dcbx::PfcConfig;
    use protocol::dcbx::PfcTlv;
    use protocol::packet::LldpTlv;
    use protocol::types::ttl_to_tlv;
    use protocol::types::ChassisId;
    use protocol::types::PortId;
    use protocol::types::TlvType;

    fn chassis(n: u8) -> LldpTlv {
        let id = ChassisId::MacAddress(MacAddr::new(0xa8, 0x40, 0x25, 0, 0, n));
        LldpTlv::try_from(&id).unwrap()
    }

    fn port(name: &str) -> LldpTlv {
        LldpTlv::try_from(&PortId::InterfaceName(name.to_string())).unwrap()
    }

    fn sysname(name: &str) -> LldpTlv {
        LldpTlv::new(TlvType::SystemName.into(), name.as_bytes()).unwrap()
    }

    fn parse(
        tlvs: &[LldpTlv],
        remote: &RemoteMib,
    ) -> Result<ParsedFrame, RxError> {
        let registry = TlvRegistry::with_defaults();
        let data = protocol::packet::deparse_tlvs(tlvs);
        parse_frame(&registry, &data, remote, 4)
    }

    fn store(remote: &mut RemoteMib, p: ParsedFrame) {
        let index = remote.alloc_index();
        let now = Utc::now();
        remote.insert(
            p.msap,
            RemoteEntry {
                index,
                src_mac: MacAddr::ZERO,
                ttl: p.ttl,
                fields: p.fields,
                rx_info_ttl: Instant::now(),
                timer: None,
                first_seen: now,
                last_changed: now,
                last_seen: now,
            },
        );
    }

    #[test]
    fn test_mandatory_order() {
        let remote = RemoteMib::new();
        let end = LldpTlv::end();
        let orders = [
            vec![port("p0"), chassis(1), ttl_to_tlv(120), end.clone()],
            vec![chassis(1), ttl_to_tlv(120), port("p0"), end.clone()],
            vec![ttl_to_tlv(120), chassis(1), port("p0"), end.clone()],
            vec![chassis(1), port("p0"), sysname("x"), end.clone()],
            vec![chassis(1), port("p0")],
            vec![],
        ];
        for tlvs in orders {
            assert!(
                matches!(parse(&tlvs, &remote), Err(RxError::Protocol(_))),
                "{tlvs:?}"
            );
        }
        assert!(remote.is_empty());
    }

    #[test]
    fn test_parse_new_neighbor() {
        let remote = RemoteMib::new();
        let p = parse(
            &[
                chassis(1),
                port("p0"),
                ttl_to_tlv(120),
                sysname("sw1"),
                LldpTlv::new(9, &[1, 2, 3]).unwrap(),
                LldpTlv::end(),
            ],
            &remote,
        )
        .unwrap();
        assert_eq!(p.ttl, 120);
        assert_eq!(p.changes.kind, ChangeKind::NewNeighbor);
        assert_eq!(p.changes.added, vec![TlvKey::SYS_NAME]);
        assert_eq!(p.unrecognized, 1);
        assert_eq!(p.msap.port_id, PortId::InterfaceName("p0".to_string()));
    }

    #[test]
    fn test_end_stops_parsing() {
        let remote = RemoteMib::new();
        let mut data = protocol::packet::deparse_tlvs(&[
            chassis(1),
            port("p0"),
            ttl_to_tlv(120),
            LldpTlv::end(),
        ]);
        // trailing garbage after the End TLV
        data.extend_from_slice(&[0xff, 0xff, 0x01]);
        let registry = TlvRegistry::with_defaults();
        let p = parse_frame(&registry, &data, &remote, 4).unwrap();
        assert!(p.fields.is_empty());
    }

    #[test]
    fn test_duplicate_and_repeated_tlvs() {
        let remote = RemoteMib::new();
        let p = parse(
            &[
                chassis(1),
                port("p0"),
                ttl_to_tlv(120),
                sysname("a"),
                sysname("b"),
                LldpTlv::end(),
            ],
            &remote,
        )
        .unwrap();
        assert_eq!(p.discarded, 1);
        assert_eq!(
            p.fields.get(&TlvKey::SYS_NAME),
            Some(&TlvData::SystemName("a".to_string()))
        );

        let e = parse(
            &[chassis(1), port("p0"), ttl_to_tlv(120), chassis(2)],
            &remote,
        );
        assert!(matches!(e, Err(RxError::Protocol(_))));
    }

    #[test]
    fn test_malformed_optional_tlv_discards_pdu() {
        let remote = RemoteMib::new();
        let bad_pfc = LldpTlv::org_specific(
            protocol::dcbx::IEEE_8021_OUI,
            protocol::dcbx::PFC_SUBTYPE,
            &[0x01],
        )
        .unwrap();
        let e = parse(&[chassis(1), port("p0"), ttl_to_tlv(120), bad_pfc], &remote);
        assert!(matches!(e, Err(RxError::Protocol(_))));
    }

    #[test]
    fn test_no_change_and_modified() {
        let mut remote = RemoteMib::new();
        let pdu = [chassis(1), port("p0"), ttl_to_tlv(120), sysname("a")];
        let first = parse(&pdu, &remote).unwrap();
        store(&mut remote, first);

        let second = parse(&pdu, &remote).unwrap();
        assert_eq!(second.changes.kind, ChangeKind::NoChange);

        let third =
            parse(&[chassis(1), port("p0"), ttl_to_tlv(120)], &remote).unwrap();
        assert_eq!(third.changes.kind, ChangeKind::Modified);
        assert_eq!(third.changes.deleted, vec![TlvKey::SYS_NAME]);
    }

    #[test]
    fn test_zero_ttl_is_shutdown() {
        let mut remote = RemoteMib::new();
        let first = parse(
            &[chassis(1), port("p0"), ttl_to_tlv(120), sysname("a")],
            &remote,
        )
        .unwrap();
        store(&mut remote, first);

        // Nothing after the TTL is needed, or even looked at
        let p = parse(
            &[chassis(1), port("p0"), ttl_to_tlv(0), chassis(7)],
            &remote,
        )
        .unwrap();
        assert_eq!(p.changes.kind, ChangeKind::Shutdown);
        assert_eq!(p.changes.deleted, vec![TlvKey::SYS_NAME]);
    }

    #[test]
    fn test_table_full() {
        let mut remote = RemoteMib::new();
        for n in 0..4 {
            let p = parse(&[chassis(n), port("p0"), ttl_to_tlv(120)], &remote)
                .unwrap();
            store(&mut remote, p);
        }
        let e = parse(&[chassis(9), port("p0"), ttl_to_tlv(30)], &remote);
        assert_eq!(e.unwrap_err(), RxError::TooManyNeighbors { ttl: 30 });

        // Known peers are still accepted
        let p = parse(&[chassis(2), port("p0"), ttl_to_tlv(120)], &remote)
            .unwrap();
        assert_eq!(p.changes.kind, ChangeKind::NoChange);
    }

    #[test]
    fn test_transitions() {
        let up = RxInputs {
            link_up: true,
            rx_enabled: true,
            ..Default::default()
        };
        use RxAction::*;
        use RxState::*;

        assert_eq!(rx_next(PortDisabled, &RxInputs::default()), Wait);
        assert_eq!(rx_next(PortDisabled, &up), Enter(Initialize));
        assert_eq!(
            rx_next(PortDisabled, &RxInputs { aged: true, ..up }),
            DeleteAged
        );
        assert_eq!(rx_next(Initialize, &up), Enter(WaitForFrame));
        assert_eq!(
            rx_next(Initialize, &RxInputs { rx_enabled: false, ..up }),
            Wait
        );
        assert_eq!(rx_next(WaitForFrame, &up), Wait);
        assert_eq!(
            rx_next(WaitForFrame, &RxInputs { frame: true, ..up }),
            Enter(Frame)
        );
        assert_eq!(
            rx_next(WaitForFrame, &RxInputs { frame: true, aged: true, ..up }),
            DeleteAged
        );
        assert_eq!(
            rx_next(WaitForFrame, &RxInputs { link_up: false, ..up }),
            Enter(PortDisabled)
        );
        assert_eq!(
            rx_next(WaitForFrame, &RxInputs { rx_enabled: false, ..up }),
            Enter(Initialize)
        );
        assert_eq!(rx_next(Frame, &up), Enter(WaitForFrame));
        for s in [PortDisabled, Initialize, WaitForFrame, Frame] {
            assert_eq!(rx_next(s, &RxInputs { shutdown: true, ..up }), Exit);
        }
    }

    // Drive a receive-only agent with hand-built frames from a fake peer.
    struct Harness {
        h: TestAgent,
        peer: crate::link::SegmentPort,
    }

    const PEER_MAC: MacAddr = MacAddr::new(0xa8, 0x40, 0x25, 0xff, 0, 1);

    impl Harness {
        fn new(cfg: AgentCfg) -> Self {
            let segment = Segment::new();
            let peer = segment.attach();
            let h = TestAgent::new(
                "rx0",
                MacAddr::new(0xa8, 0x40, 0x25, 0, 0, 0xaa),
                AgentCfg {
                    admin_status: crate::types::AdminStatus::EnabledRxOnly,
                    ..cfg
                },
                segment.attach(),
            );
            h.agent.link_event(LinkEvent::Up);
            wait_for(|| h.agent.rx_state() == RxState::WaitForFrame);
            Harness { h, peer }
        }

        fn send(&self, src: MacAddr, tlvs: &[LldpTlv]) {
            self.peer.send(&lldp_frame(src, tlvs)).unwrap();
        }
    }

    fn pdu(ttl: u16, name: &str) -> Vec<LldpTlv> {
        vec![chassis(1), port("p0"), ttl_to_tlv(ttl), sysname(name), LldpTlv::end()]
    }

    #[test]
    fn test_shutdown_pdu_removes_entry() {
        let t = Harness::new(fast_cfg());
        t.send(PEER_MAC, &pdu(120, "a"));
        let ev = t.h.next_remote_event();
        assert!(matches!(ev, (RemoteChange::NewNeighbor, Some(_))));
        assert_eq!(t.h.agent.neighbors().len(), 1);
        assert_eq!(t.h.timers.pending(), 1);

        t.send(PEER_MAC, &[chassis(1), port("p0"), ttl_to_tlv(0), LldpTlv::end()]);
        let ev = t.h.next_remote_event();
        assert!(matches!(ev, (RemoteChange::Shutdown, Some(_))));
        assert!(t.h.agent.neighbors().is_empty());
        // and the aging timer went with it
        assert_eq!(t.h.timers.pending(), 0);
        assert_eq!(t.h.agent.stats().ageouts_total, 0);
    }

    #[test]
    fn test_aging_window() {
        let cfg = AgentCfg {
            tick: Duration::from_millis(20),
            ..fast_cfg()
        };
        let t = Harness::new(cfg);
        let ttl_ticks = 10;
        let expected = Duration::from_millis(20 * ttl_ticks);

        t.send(PEER_MAC, &pdu(ttl_ticks as u16, "a"));
        let _ = t.h.next_remote_event();
        let inserted = Instant::now();
        let ev = t.h.next_remote_event();
        let elapsed = inserted.elapsed();
        assert!(matches!(ev, (RemoteChange::Aged, Some(_))));
        // Inserted slightly before we noticed, so allow for that on the low
        // side.
        assert!(elapsed + Duration::from_millis(20) >= expected, "{elapsed:?}");
        assert!(elapsed < expected + Duration::from_secs(1), "{elapsed:?}");
        assert!(t.h.agent.neighbors().is_empty());
        assert_eq!(t.h.agent.stats().ageouts_total, 1);
    }

    #[test]
    fn test_refresh_reschedules_without_replacing() {
        let cfg = AgentCfg {
            tick: Duration::from_millis(20),
            ..fast_cfg()
        };
        let t = Harness::new(cfg);
        t.send(PEER_MAC, &pdu(10, "a"));
        let _ = t.h.next_remote_event();
        let before = t.h.agent.neighbors().remove(0);

        // Keep refreshing past the original expiration
        for _ in 0..6 {
            std::thread::sleep(Duration::from_millis(60));
            t.send(PEER_MAC, &pdu(10, "a"));
        }
        wait_for(|| t.h.agent.stats().frames_in_total == 7);
        let after = t.h.agent.neighbors().remove(0);
        assert_eq!(before.index, after.index);
        assert_eq!(before.last_changed, after.last_changed);
        assert!(after.last_seen > before.last_seen);
        assert_eq!(t.h.timers.pending(), 1);
        assert!(t.h.no_remote_event(Duration::from_millis(50)));

        // A changed PDU replaces the entry but keeps its index
        t.send(PEER_MAC, &pdu(10, "b"));
        let ev = t.h.next_remote_event();
        assert!(matches!(ev, (RemoteChange::Modified, Some(_))));
        let changed = t.h.agent.neighbors().remove(0);
        assert_eq!(changed.index, before.index);
        assert_eq!(t.h.timers.pending(), 1);
    }

    #[test]
    fn test_reflected_and_malformed_frames() {
        let t = Harness::new(fast_cfg());
        t.send(t.h.agent.mac, &pdu(120, "me"));
        t.send(PEER_MAC, &[port("p0"), chassis(1), ttl_to_tlv(120)]);
        wait_for(|| t.h.agent.stats().frames_in_errors_total == 1);
        let stats = t.h.agent.stats();
        // the reflection was never counted
        assert_eq!(stats.frames_in_total, 1);
        assert_eq!(stats.frames_discarded_total, 1);
        assert!(t.h.agent.neighbors().is_empty());
    }

    #[test]
    fn test_truncated_tlv_is_a_length_error() {
        let t = Harness::new(fast_cfg());
        let mut frame = lldp_frame(PEER_MAC, &pdu(120, "peer"));
        // Cut the System Name TLV short, leaving its header claiming more
        frame.truncate(frame.len() - 4);
        t.peer.send(&frame).unwrap();
        wait_for(|| t.h.agent.stats().frames_in_errors_total == 1);
        let stats = t.h.agent.stats();
        assert_eq!(stats.lldpdu_length_errors, 1);
        assert_eq!(stats.frames_discarded_total, 1);
        assert!(t.h.agent.neighbors().is_empty());

        // A misordered LLDPDU is an error, but not a length error
        t.send(PEER_MAC, &[port("p0"), chassis(1), ttl_to_tlv(120)]);
        wait_for(|| t.h.agent.stats().frames_in_errors_total == 2);
        assert_eq!(t.h.agent.stats().lldpdu_length_errors, 1);
    }

    #[test]
    fn test_too_many_neighbors_backoff() {
        let cfg = AgentCfg {
            max_neighbors: 1,
            tick: Duration::from_millis(20),
            ..fast_cfg()
        };
        let t = Harness::new(cfg);
        t.send(PEER_MAC, &pdu(100, "a"));
        let _ = t.h.next_remote_event();

        let other = |ttl| {
            vec![chassis(2), port("p0"), ttl_to_tlv(ttl), LldpTlv::end()]
        };
        t.send(PEER_MAC, &other(5));
        wait_for(|| t.h.agent.too_many_neighbors());
        // A longer TTL extends the backoff
        t.send(PEER_MAC, &other(15));
        wait_for(|| t.h.agent.stats().too_many_neighbors_total == 2);
        std::thread::sleep(Duration::from_millis(150));
        assert!(t.h.agent.too_many_neighbors());
        wait_for(|| !t.h.agent.too_many_neighbors());
        assert_eq!(t.h.agent.neighbors().len(), 1);
    }

    #[test]
    fn test_pfc_tlv_stored() {
        let t = Harness::new(fast_cfg());
        let pfc = PfcTlv {
            willing: true,
            config: PfcConfig {
                mbc: false,
                cap: 8,
                enable: 0x18,
            },
        };
        let mut tlvs = pdu(120, "a");
        tlvs.insert(3, LldpTlv::try_from(&pfc).unwrap());
        t.send(PEER_MAC, &tlvs);
        let _ = t.h.next_remote_event();
        let n = t.h.agent.neighbors().remove(0);
        assert_eq!(n.fields.get(&TlvKey::PFC), Some(&TlvData::Pfc(pfc)));
        assert_eq!(n.src_mac, PEER_MAC);
    }

    #[test]
    fn test_mode_change_flushes_table() {
        let t = Harness::new(fast_cfg());
        t.send(PEER_MAC, &pdu(120, "a"));
        let _ = t.h.next_remote_event();
        t.h.agent.set_mode(crate::types::AdminStatus::EnabledTxOnly);
        wait_for(|| t.h.agent.rx_state() == RxState::Initialize);
        t.h.agent.set_mode(crate::types::AdminStatus::EnabledRxOnly);
        wait_for(|| t.h.agent.rx_state() == RxState::WaitForFrame);
        assert!(t.h.agent.neighbors().is_empty());
        assert_eq!(t.h.timers.pending(), 0);
        let flushed = t.h.events_matching(|e| {
            matches!(
                e,
                Event::RemoteChanged {
                    change: RemoteChange::Cleared,
                    ..
                }
            )
        });
        assert_eq!(flushed, 1);
    }
}
