// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! DCBX symmetric feature negotiation (802.1Qaz section 8.5).
//!
//! Each enabled feature runs its own state machine thread.  The machine
//! tracks three versions of the feature's configuration: the local one set by
//! the administrator, the one the peer is advertising, and the operating one
//! actually in effect.  What the feature means, and how its configuration is
//! encoded, is supplied by a `FeatureOps` implementation.
//!
//! The feature thread never holds its own state lock while acquiring the
//! local MIB, the remote MIB, or the transmit state.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread::JoinHandle;

use serde::Serialize;
use slog::debug;
use slog::error;
use slog::info;
use slog::trace;
use slog::warn;

use crate::agent::Agent;
use crate::errors::LldpdError;
use crate::events::Event;
use crate::mib::LocalMib;
use crate::mib::RemoteMib;
use crate::tlv::Fields;
use crate::tlv::TlvData;
use crate::tlv::TlvKey;
use crate::types::LldpdResult;
use protocol::MacAddr;

pub mod pfc;

#[derive(
    Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize,
)]
pub enum Feature {
    Pfc,
}

impl Feature {
    /// The TLV that carries this feature
    pub fn tlv_key(self) -> TlvKey {
        match self {
            Feature::Pfc => TlvKey::PFC,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Feature::Pfc => write!(f, "pfc"),
        }
    }
}

impl FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pfc" => Ok(Feature::Pfc),
            _ => Err(format!("unknown dcbx feature: {s}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DcbxState {
    Wait,
    SetLocalParam,
    GetPeerCfg,
    UseLocalCfg,
    UsePeerCfg,
    LinkDown,
    Shutdown,
}

/// Why a feature machine is being woken
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FeatureEvent {
    /// Link state, admin mode or flow control changed
    Status,
    /// The remote MIB changed
    PeerUpdate,
}

/// The administrator's settings for a feature
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalParams<C> {
    pub willing: bool,
    pub config: C,
}

/// The per-feature half of the negotiation.
pub trait FeatureOps: Send + Sync + 'static {
    type Config: Clone + PartialEq + fmt::Display + fmt::Debug + Send + 'static;

    fn feature(&self) -> Feature;

    /// The TLV used to advertise the feature
    fn key(&self) -> TlvKey {
        self.feature().tlv_key()
    }

    fn default_config(&self) -> Self::Config;

    fn default_willing(&self) -> bool;

    /// Can we interoperate with a peer using `peer` while operating with
    /// `oper`?
    fn is_compatible(&self, oper: &Self::Config, peer: &Self::Config) -> bool;

    /// Adopt the negotiable parts of `source` into `target`
    fn set_config(
        &self,
        target: &mut Self::Config,
        source: &Self::Config,
    ) -> LldpdResult<()>;

    /// Extract the peer's willing bit and configuration from its TLVs
    fn peer_config(&self, fields: &Fields) -> Option<(bool, Self::Config)>;

    /// The value we should be advertising
    fn advertise(&self, willing: bool, config: &Self::Config) -> TlvData;

    fn set_property(
        &self,
        local: &mut LocalParams<Self::Config>,
        key: &str,
        value: &str,
    ) -> LldpdResult<()>;

    /// Push a new operating configuration down to the hardware
    fn action(&self, _link: &str, _config: &Self::Config) -> LldpdResult<()> {
        Ok(())
    }

    fn link_state(&self, _up: bool) {}

    /// The feature is being disabled
    fn fini(&self) {}
}

/// A snapshot of one feature's negotiation, for display
#[derive(Clone, Debug, Serialize)]
pub struct FeatureInfo {
    pub feature: Feature,
    pub state: DcbxState,
    /// The most recent negotiation result
    pub outcome: Option<DcbxState>,
    pub willing: bool,
    pub pending: bool,
    pub multi_peer: bool,
    pub local: String,
    pub oper: String,
    pub peer: Option<String>,
}

/// What the agent needs from a running feature, independent of its
/// configuration type
pub(crate) trait DcbxFeature: Send + Sync {
    fn feature(&self) -> Feature;

    fn info(&self) -> FeatureInfo;

    fn set_property(&self, key: &str, value: &str) -> LldpdResult<()>;

    fn poke(&self, event: FeatureEvent);

    /// Ask the feature thread to exit, returning its handle for joining.
    /// The caller must not join it while holding any agent locks.
    fn stop(&self) -> Option<JoinHandle<()>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Peer<C> {
    pub mac: MacAddr,
    pub willing: bool,
    pub config: C,
}

/// Find the peer advertising a feature.  The second return value is true if
/// more than one station is advertising it.
pub(crate) fn peer_view<O: FeatureOps>(
    ops: &O,
    remote: &RemoteMib,
) -> (Option<Peer<O::Config>>, bool) {
    let mut peer = None;
    let mut macs = BTreeSet::new();
    for (_, entry) in remote.iter() {
        let Some((willing, config)) = ops.peer_config(&entry.fields) else {
            continue;
        };
        macs.insert(entry.src_mac);
        if peer.is_none() {
            peer = Some(Peer {
                mac: entry.src_mac,
                willing,
                config,
            });
        }
    }
    (peer, macs.len() > 1)
}

/// The inputs to the GetPeerCfg decision
#[derive(Clone, Copy, Debug)]
pub(crate) struct Negotiation {
    pub multi_peer: bool,
    pub pending: bool,
    pub compatible: bool,
    pub local_willing: bool,
    pub peer_willing: bool,
    pub local_mac: MacAddr,
    pub peer_mac: MacAddr,
}

pub(crate) fn negotiate(n: &Negotiation) -> DcbxState {
    if n.multi_peer {
        DcbxState::UseLocalCfg
    } else if n.compatible && !n.pending {
        DcbxState::Wait
    } else if !n.local_willing {
        DcbxState::UseLocalCfg
    } else if !n.peer_willing {
        DcbxState::UsePeerCfg
    } else if n.local_mac <= n.peer_mac {
        DcbxState::UseLocalCfg
    } else {
        DcbxState::UsePeerCfg
    }
}

struct Machine<C> {
    state: DcbxState,
    outcome: Option<DcbxState>,
    local: LocalParams<C>,
    oper: C,
    peer: Option<Peer<C>>,
    multi_peer: bool,
    /// A negotiation has been started that hasn't yet converged
    pending: bool,
    local_change: bool,
    peer_update: bool,
    stop: bool,
}

pub(crate) struct FeatureMachine<O: FeatureOps> {
    ops: O,
    mac: MacAddr,
    link: String,
    inner: Mutex<Machine<O::Config>>,
    cv: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<O: FeatureOps> FeatureMachine<O> {
    /// Launch the feature's thread, and seed the local MIB with its initial
    /// advertisement.
    fn start(
        agent: &Arc<Agent>,
        local: &mut LocalMib,
        ops: O,
    ) -> LldpdResult<Arc<Self>> {
        let params = LocalParams {
            willing: ops.default_willing(),
            config: ops.default_config(),
        };
        local
            .fields
            .insert(ops.key(), ops.advertise(params.willing, &params.config));

        let feature = ops.feature();
        let machine = Arc::new(FeatureMachine {
            mac: agent.mac,
            link: agent.name.clone(),
            inner: Mutex::new(Machine {
                state: DcbxState::LinkDown,
                outcome: None,
                oper: params.config.clone(),
                local: params,
                peer: None,
                multi_peer: false,
                pending: false,
                local_change: false,
                peer_update: false,
                stop: false,
            }),
            cv: Condvar::new(),
            thread: Mutex::new(None),
            ops,
        });

        let m = machine.clone();
        let a = agent.clone();
        let handle = std::thread::Builder::new()
            .name(format!("dcbx-{feature}-{}", agent.name))
            .spawn(move || m.run(a))
            .map_err(|e| {
                local.fields.remove(&feature.tlv_key());
                LldpdError::from(e)
            })?;
        *machine.thread.lock().unwrap() = Some(handle);
        Ok(machine)
    }

    fn run(self: Arc<Self>, agent: Arc<Agent>) {
        let log = agent
            .log
            .new(slog::o!("unit" => format!("dcbx-{}", self.ops.feature())));
        debug!(log, "feature started");

        let mut state = DcbxState::LinkDown;
        while state != DcbxState::Shutdown {
            let next = match state {
                DcbxState::LinkDown => self.link_down(&agent),
                DcbxState::Wait => self.wait(&agent),
                DcbxState::SetLocalParam => self.set_local_param(&agent, &log),
                DcbxState::GetPeerCfg => self.get_peer_cfg(),
                DcbxState::UseLocalCfg => self.use_local_cfg(&agent, &log),
                DcbxState::UsePeerCfg => self.use_peer_cfg(&agent, &log),
                DcbxState::Shutdown => DcbxState::Shutdown,
            };
            if next != state {
                trace!(log, "{state:?} -> {next:?}");
                state = next;
                self.inner.lock().unwrap().state = state;
            }
        }

        self.ops.fini();
        debug!(log, "feature stopped");
    }

    fn link_down(&self, agent: &Agent) -> DcbxState {
        {
            let mut m = self.inner.lock().unwrap();
            loop {
                let status = agent.status();
                if m.stop || status.shutdown {
                    return DcbxState::Shutdown;
                }
                if status.link_up {
                    break;
                }
                m = self.cv.wait(m).unwrap();
            }
            m.oper = m.local.config.clone();
            m.pending = true;
            m.local_change = false;
            m.peer_update = false;
        }
        self.ops.link_state(true);
        self.refresh_peer(agent);
        DcbxState::SetLocalParam
    }

    fn wait(&self, agent: &Agent) -> DcbxState {
        let mut m = self.inner.lock().unwrap();
        loop {
            let status = agent.status();
            if m.stop || status.shutdown {
                return DcbxState::Shutdown;
            }
            if !status.link_up {
                drop(m);
                self.ops.link_state(false);
                return DcbxState::LinkDown;
            }
            if m.local_change {
                m.local_change = false;
                return DcbxState::SetLocalParam;
            }
            if m.peer_update {
                m.peer_update = false;
                drop(m);
                self.refresh_peer(agent);
                let m = self.inner.lock().unwrap();
                return match &m.peer {
                    Some(_) => DcbxState::GetPeerCfg,
                    // The peer stopped advertising.  Fall back to our own
                    // settings unless we are already waiting to hear from it.
                    None if !m.pending && m.oper != m.local.config => {
                        DcbxState::UseLocalCfg
                    }
                    None => DcbxState::Wait,
                };
            }
            m = self.cv.wait(m).unwrap();
        }
    }

    fn set_local_param(&self, agent: &Agent, log: &slog::Logger) -> DcbxState {
        let mut m = self.inner.lock().unwrap();
        if m.peer.is_some() {
            m.pending = true;
            return DcbxState::GetPeerCfg;
        }
        m.oper = m.local.config.clone();
        let (willing, oper) = (m.local.willing, m.oper.clone());
        drop(m);

        if let Err(e) = self.ops.action(&self.link, &oper) {
            error!(log, "failed to apply local config: {e}"; "config" => %oper);
        }
        // New local parameters are always announced, even when the
        // advertised TLV comes out the same
        if !self.advertise(agent, willing, &oper) {
            agent.local_changed();
        }
        DcbxState::Wait
    }

    fn get_peer_cfg(&self) -> DcbxState {
        let m = self.inner.lock().unwrap();
        let Some(peer) = &m.peer else {
            return DcbxState::UseLocalCfg;
        };
        negotiate(&Negotiation {
            multi_peer: m.multi_peer,
            pending: m.pending,
            compatible: self.ops.is_compatible(&m.oper, &peer.config),
            local_willing: m.local.willing,
            peer_willing: peer.willing,
            local_mac: self.mac,
            peer_mac: peer.mac,
        })
    }

    fn use_local_cfg(&self, agent: &Agent, log: &slog::Logger) -> DcbxState {
        let (willing, oper) = {
            let m = self.inner.lock().unwrap();
            (m.local.willing, m.local.config.clone())
        };
        if let Err(e) = self.ops.action(&self.link, &oper) {
            error!(log, "failed to apply local config: {e}"; "config" => %oper);
        }

        let converged = {
            let mut m = self.inner.lock().unwrap();
            m.oper = oper.clone();
            m.outcome = Some(DcbxState::UseLocalCfg);
            let converged = match &m.peer {
                Some(p) => self.ops.is_compatible(&oper, &p.config),
                None => true,
            };
            if converged {
                m.pending = false;
            }
            converged
        };

        self.advertise(agent, willing, &oper);
        if converged {
            self.oper_changed(agent, log, &oper);
        } else {
            debug!(log, "using local config, waiting for peer to follow");
        }
        DcbxState::Wait
    }

    fn use_peer_cfg(&self, agent: &Agent, log: &slog::Logger) -> DcbxState {
        let (willing, local, peer) = {
            let m = self.inner.lock().unwrap();
            match &m.peer {
                Some(p) => (m.local.willing, m.local.config.clone(), p.clone()),
                None => return DcbxState::UseLocalCfg,
            }
        };

        let mut oper = local.clone();
        let applied = self
            .ops
            .set_config(&mut oper, &peer.config)
            .and_then(|_| self.ops.action(&self.link, &oper));
        if let Err(e) = applied {
            error!(log, "failed to adopt peer config: {e}";
                "peer" => %peer.config);
            oper = local;
            if let Err(e) = self.ops.action(&self.link, &oper) {
                error!(log, "failed to restore local config: {e}");
            }
        }

        {
            let mut m = self.inner.lock().unwrap();
            m.oper = oper.clone();
            m.outcome = Some(DcbxState::UsePeerCfg);
            m.pending = false;
        }
        self.advertise(agent, willing, &oper);
        self.oper_changed(agent, log, &oper);
        DcbxState::Wait
    }

    fn oper_changed(&self, agent: &Agent, log: &slog::Logger, oper: &O::Config) {
        info!(log, "operating config {oper}");
        agent.publish(Event::FeatureOperChanged {
            link: self.link.clone(),
            feature: self.ops.feature(),
            config: oper.to_string(),
        });
    }

    fn refresh_peer(&self, agent: &Agent) {
        let (peer, multi_peer) = {
            let remote = agent.remote.lock().unwrap();
            peer_view(&self.ops, &remote)
        };
        let mut m = self.inner.lock().unwrap();
        if multi_peer != m.multi_peer {
            if multi_peer {
                warn!(agent.log, "multiple {} peers", self.ops.feature());
            } else {
                info!(agent.log, "single {} peer restored", self.ops.feature());
            }
        }
        m.peer = peer;
        m.multi_peer = multi_peer;
    }

    /// Update the TLV we advertise.  Nothing is written if the TLV has been
    /// removed from the write list.  Returns true if the local MIB changed
    /// and the agent was told.
    fn advertise(&self, agent: &Agent, willing: bool, oper: &O::Config) -> bool {
        let key = self.ops.key();
        let data = self.ops.advertise(willing, oper);
        let changed = {
            let mut local = agent.local.write().unwrap();
            if !local.write_list.contains(&key)
                || local.fields.get(&key) == Some(&data)
            {
                false
            } else {
                local.fields.insert(key, data);
                true
            }
        };
        if changed {
            agent.local_changed();
        }
        changed
    }
}

impl<O: FeatureOps> DcbxFeature for FeatureMachine<O> {
    fn feature(&self) -> Feature {
        self.ops.feature()
    }

    fn info(&self) -> FeatureInfo {
        let m = self.inner.lock().unwrap();
        FeatureInfo {
            feature: self.ops.feature(),
            state: m.state,
            outcome: m.outcome,
            willing: m.local.willing,
            pending: m.pending,
            multi_peer: m.multi_peer,
            local: m.local.config.to_string(),
            oper: m.oper.to_string(),
            peer: m.peer.as_ref().map(|p| p.config.to_string()),
        }
    }

    fn set_property(&self, key: &str, value: &str) -> LldpdResult<()> {
        let mut m = self.inner.lock().unwrap();
        let mut params = m.local.clone();
        self.ops.set_property(&mut params, key, value)?;
        if params != m.local {
            m.local = params;
            m.local_change = true;
            self.cv.notify_all();
        }
        Ok(())
    }

    fn poke(&self, event: FeatureEvent) {
        let mut m = self.inner.lock().unwrap();
        if event == FeatureEvent::PeerUpdate {
            m.peer_update = true;
        }
        self.cv.notify_all();
    }

    fn stop(&self) -> Option<JoinHandle<()>> {
        self.inner.lock().unwrap().stop = true;
        self.cv.notify_all();
        self.thread.lock().unwrap().take()
    }
}

/// Enable a feature on an agent.  Called with the local MIB write-locked,
/// when the feature's TLV is added to the write list.
pub(crate) fn start_feature(
    agent: &Arc<Agent>,
    local: &mut LocalMib,
    feature: Feature,
) -> LldpdResult<()> {
    if agent.status().shutdown {
        return Err(LldpdError::Invalid(format!(
            "{} is shutting down",
            agent.name
        )));
    }
    let mut features = agent.features.lock().unwrap();
    if features.contains_key(&feature) {
        return Err(LldpdError::Exists(format!(
            "{feature} is already enabled on {}",
            agent.name
        )));
    }
    let f: Arc<dyn DcbxFeature> = match feature {
        Feature::Pfc => FeatureMachine::start(
            agent,
            local,
            pfc::PfcOps::new(agent.services.pfc_action.clone()),
        )?,
    };
    features.insert(feature, f);
    debug!(agent.log, "started dcbx feature {feature}");
    Ok(())
}

/// Disable a feature.  Its thread is handed to the agent to be joined once
/// the local MIB lock has been dropped.
pub(crate) fn stop_feature(
    agent: &Arc<Agent>,
    local: &mut LocalMib,
    feature: Feature,
) {
    let f = agent.features.lock().unwrap().remove(&feature);
    local.fields.remove(&feature.tlv_key());
    if let Some(f) = f {
        if let Some(handle) = f.stop() {
            agent.retire(handle);
        }
        debug!(agent.log, "stopped dcbx feature {feature}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mib::Msap;
    use crate::mib::RemoteEntry;
    use protocol::dcbx::PfcConfig;
    use protocol::dcbx::PfcTlv;
    use protocol::types::ChassisId;
    use protocol::types::PortId;

    const A: MacAddr = MacAddr::new(0, 0, 0, 0, 0, 1);
    const B: MacAddr = MacAddr::new(0, 0, 0, 0, 0, 2);

    fn both_willing(local_mac: MacAddr, peer_mac: MacAddr) -> Negotiation {
        Negotiation {
            multi_peer: false,
            pending: true,
            compatible: true,
            local_willing: true,
            peer_willing: true,
            local_mac,
            peer_mac,
        }
    }

    #[test]
    fn test_tie_break() {
        assert_eq!(negotiate(&both_willing(A, B)), DcbxState::UseLocalCfg);
        assert_eq!(negotiate(&both_willing(B, A)), DcbxState::UsePeerCfg);
    }

    #[test]
    fn test_willingness() {
        let n = Negotiation {
            local_willing: false,
            ..both_willing(B, A)
        };
        assert_eq!(negotiate(&n), DcbxState::UseLocalCfg);
        let n = Negotiation {
            peer_willing: false,
            ..both_willing(A, B)
        };
        assert_eq!(negotiate(&n), DcbxState::UsePeerCfg);
    }

    #[test]
    fn test_settled_negotiation_waits() {
        let n = Negotiation {
            pending: false,
            ..both_willing(B, A)
        };
        assert_eq!(negotiate(&n), DcbxState::Wait);
        let n = Negotiation {
            compatible: false,
            ..n
        };
        assert_eq!(negotiate(&n), DcbxState::UsePeerCfg);
    }

    #[test]
    fn test_multi_peer_forces_local() {
        for local_willing in [true, false] {
            for pending in [true, false] {
                let n = Negotiation {
                    multi_peer: true,
                    local_willing,
                    pending,
                    ..both_willing(B, A)
                };
                assert_eq!(negotiate(&n), DcbxState::UseLocalCfg);
            }
        }
    }

    fn entry(remote: &mut RemoteMib, chassis: u8, src_mac: MacAddr, pfc: bool) {
        let mut fields = Fields::new();
        if pfc {
            fields.insert(
                TlvKey::PFC,
                TlvData::Pfc(PfcTlv {
                    willing: chassis % 2 == 0,
                    config: PfcConfig {
                        mbc: false,
                        cap: 8,
                        enable: chassis,
                    },
                }),
            );
        }
        let index = remote.alloc_index();
        let now = chrono::Utc::now();
        remote.insert(
            Msap {
                chassis_id: ChassisId::LocallyAssigned(format!("c{chassis}")),
                port_id: PortId::InterfaceName("p0".to_string()),
            },
            RemoteEntry {
                index,
                src_mac,
                ttl: 120,
                fields,
                rx_info_ttl: std::time::Instant::now(),
                timer: None,
                first_seen: now,
                last_changed: now,
                last_seen: now,
            },
        );
    }

    #[test]
    fn test_peer_view() {
        let ops = pfc::PfcOps::new(None);
        let mut remote = RemoteMib::new();
        assert_eq!(peer_view(&ops, &remote), (None, false));

        // A peer without the TLV doesn't count
        entry(&mut remote, 1, A, false);
        assert_eq!(peer_view(&ops, &remote), (None, false));

        entry(&mut remote, 2, B, true);
        let (peer, multi) = peer_view(&ops, &remote);
        let peer = peer.unwrap();
        assert!(!multi);
        assert_eq!(peer.mac, B);
        assert!(peer.willing);
        assert_eq!(peer.config.enable, 2);

        // Two MSAPs behind one MAC are still one peer
        entry(&mut remote, 4, B, true);
        assert!(!peer_view(&ops, &remote).1);
        entry(&mut remote, 6, A, true);
        assert!(peer_view(&ops, &remote).1);
    }

    #[test]
    fn test_feature_names() {
        assert_eq!("PFC".parse::<Feature>(), Ok(Feature::Pfc));
        assert_eq!(Feature::Pfc.to_string(), "pfc");
        assert!("ets".parse::<Feature>().is_err());
        assert_eq!(Feature::Pfc.tlv_key(), TlvKey::PFC);
    }
}
