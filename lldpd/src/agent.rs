// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The per-link LLDP agent.
//!
//! An agent owns a local MIB (what we advertise), a remote MIB (what our
//! peers advertise), and the threads that run the receive, transmit, and
//! transmit-timer state machines, plus one thread per enabled DCBX feature.
//! Each state machine sleeps on its own condition variable.  Anything that
//! changes the conditions a state machine waits on takes that machine's
//! mutex before signalling it.
//!
//! Locks are always acquired in this order, and `status` and `stats` are
//! never held while acquiring anything else:
//!
//!   rx -> reader
//!   rx -> remote
//!   local -> features -> feature state
//!   tx

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::RwLock;
use std::thread::JoinHandle;

use serde::Serialize;
use slog::debug;
use slog::error;
use slog::info;

use crate::dcbx::DcbxFeature;
use crate::dcbx::DcbxState;
use crate::dcbx::Feature;
use crate::dcbx::FeatureEvent;
use crate::dcbx::FeatureInfo;
use crate::errors::LldpdError;
use crate::events::Event;
use crate::link::LinkEvent;
use crate::link::Transport;
use crate::mib::LocalMib;
use crate::mib::Msap;
use crate::mib::NeighborInfo;
use crate::mib::RemoteMib;
use crate::rx;
use crate::rx::ReaderSlot;
use crate::rx::RxShared;
use crate::rx::RxState;
use crate::tlv::MaskOp;
use crate::tlv::OptionalTlv;
use crate::tlv::TlvCategory;
use crate::tlv::TlvData;
use crate::tlv::TlvKey;
use crate::tx;
use crate::tx::TxShared;
use crate::tx::TxState;
use crate::txtimer;
use crate::txtimer::TxTimerState;
use crate::types::AdminStatus;
use crate::types::AgentCfg;
use crate::types::LldpdResult;
use crate::types::Stats;
use crate::types::SystemInfo;
use crate::Services;
use protocol::types::PortId;
use protocol::MacAddr;

/// Default link MTU, until told otherwise
pub const DEFAULT_MTU: usize = 1500;

/// The externally driven conditions every state machine consults
#[derive(Clone, Copy, Debug, Serialize)]
pub struct PortStatus {
    pub admin: AdminStatus,
    pub link_up: bool,
    pub mtu: usize,
    /// The agent is being torn down
    pub shutdown: bool,
}

impl PortStatus {
    pub fn rx_enabled(&self) -> bool {
        self.admin.has_rx()
    }

    pub fn tx_enabled(&self) -> bool {
        self.link_up && self.admin.has_tx()
    }
}

pub struct Agent {
    pub(crate) log: slog::Logger,
    pub name: String,
    pub mac: MacAddr,
    pub(crate) cfg: AgentCfg,
    pub(crate) services: Services,
    pub(crate) transport: Arc<dyn Transport>,

    pub(crate) status: Mutex<PortStatus>,
    pub(crate) stats: Mutex<Stats>,

    pub(crate) local: RwLock<LocalMib>,
    pub(crate) remote: Mutex<RemoteMib>,

    pub(crate) rx: Mutex<RxShared>,
    pub(crate) rx_cv: Condvar,
    pub(crate) reader: Mutex<ReaderSlot>,
    pub(crate) reader_cv: Condvar,

    pub(crate) tx: Mutex<TxShared>,
    pub(crate) tx_cv: Condvar,
    pub(crate) txtimer_cv: Condvar,

    pub(crate) features: Mutex<BTreeMap<Feature, Arc<dyn DcbxFeature>>>,
    /// Threads of stopped features, waiting to be joined once no locks are
    /// held
    retired: Mutex<Vec<JoinHandle<()>>>,
    threads: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Agent {
    pub(crate) fn new(
        log: &slog::Logger,
        name: &str,
        mac: MacAddr,
        cfg: AgentCfg,
        sys: &SystemInfo,
        services: Services,
        transport: Arc<dyn Transport>,
    ) -> Arc<Agent> {
        let msap = Msap {
            chassis_id: sys.chassis_id.clone(),
            port_id: PortId::InterfaceName(name.to_string()),
        };
        let mut local = LocalMib::new(msap, cfg.tx_ttl());
        if let Some(s) = &sys.system_name {
            local
                .fields
                .insert(TlvKey::SYS_NAME, TlvData::SystemName(s.clone()));
        }
        if let Some(s) = &sys.system_description {
            local.fields.insert(
                TlvKey::SYS_DESC,
                TlvData::SystemDescription(s.clone()),
            );
        }

        Arc::new(Agent {
            log: log.new(slog::o!("link" => name.to_string())),
            name: name.to_string(),
            mac,
            services,
            transport,
            status: Mutex::new(PortStatus {
                admin: cfg.admin_status,
                link_up: false,
                mtu: DEFAULT_MTU,
                shutdown: false,
            }),
            stats: Mutex::new(Stats::default()),
            local: RwLock::new(local),
            remote: Mutex::new(RemoteMib::new()),
            rx: Mutex::new(RxShared::new()),
            rx_cv: Condvar::new(),
            reader: Mutex::new(ReaderSlot::default()),
            reader_cv: Condvar::new(),
            tx: Mutex::new(TxShared::new(&cfg)),
            tx_cv: Condvar::new(),
            txtimer_cv: Condvar::new(),
            features: Mutex::new(BTreeMap::new()),
            retired: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            cfg,
        })
    }

    /// Launch the state machines and enable the basic optional TLVs.
    pub(crate) fn start(self: &Arc<Self>) -> LldpdResult<()> {
        self.set_tlv_mask(
            TlvCategory::Basic,
            &[OptionalTlv::PortDesc, OptionalTlv::SysName, OptionalTlv::SysDesc],
            MaskOp::Set,
        )?;
        self.spawn("rx", rx::rx_loop)?;
        self.spawn("tx", tx::tx_loop)?;
        self.spawn("txtimer", txtimer::txtimer_loop)?;
        Ok(())
    }

    pub(crate) fn spawn(
        self: &Arc<Self>,
        unit: &str,
        body: fn(Arc<Agent>),
    ) -> LldpdResult<()> {
        let agent = self.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{unit}-{}", self.name))
            .spawn(move || body(agent))?;
        self.threads.lock().unwrap().push((unit.to_string(), handle));
        Ok(())
    }

    /// Stop every thread belonging to this agent and release the link.  A
    /// shutdown LLDPDU is sent first if we were transmitting.
    pub(crate) fn shutdown(&self) {
        debug!(self.log, "shutting down agent");
        self.status.lock().unwrap().shutdown = true;
        self.poke_all();

        let features: Vec<Arc<dyn DcbxFeature>> = std::mem::take(
            &mut *self.features.lock().unwrap(),
        )
        .into_values()
        .collect();
        for f in features {
            if let Some(handle) = f.stop() {
                self.retire(handle);
            }
        }
        self.reap();

        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        let (tx_threads, others): (Vec<_>, Vec<_>) =
            threads.into_iter().partition(|(unit, _)| unit.starts_with("tx"));
        let join = |(unit, handle): (String, JoinHandle<()>)| {
            if handle.join().is_err() {
                error!(self.log, "{unit} thread panicked");
            }
        };
        // Let the transmitter get its shutdown LLDPDU out before the link
        // goes away.
        tx_threads.into_iter().for_each(&join);
        self.transport.close();
        others.into_iter().for_each(&join);
        // The receiver may have started its reader after we took the list
        loop {
            let late = std::mem::take(&mut *self.threads.lock().unwrap());
            if late.is_empty() {
                break;
            }
            late.into_iter().for_each(&join);
        }
        info!(self.log, "agent stopped");
    }

    pub fn status(&self) -> PortStatus {
        *self.status.lock().unwrap()
    }

    /// Wake every state machine so it re-evaluates its conditions
    pub(crate) fn poke_all(&self) {
        {
            let _rx = self.rx.lock().unwrap();
            self.rx_cv.notify_all();
        }
        {
            let _reader = self.reader.lock().unwrap();
            self.reader_cv.notify_all();
        }
        {
            let _tx = self.tx.lock().unwrap();
            self.tx_cv.notify_all();
            self.txtimer_cv.notify_all();
        }
        self.poke_features(FeatureEvent::Status);
    }

    pub(crate) fn poke_features(&self, event: FeatureEvent) {
        let features: Vec<Arc<dyn DcbxFeature>> =
            self.features.lock().unwrap().values().cloned().collect();
        for f in features {
            f.poke(event);
        }
    }

    pub(crate) fn publish(&self, event: Event) {
        self.services.events.publish(event);
    }

    pub(crate) fn bump(&self, f: impl FnOnce(&mut Stats)) {
        f(&mut self.stats.lock().unwrap());
    }

    /// Something we advertise has changed.  Ask the transmit-timer for a new
    /// LLDPDU.
    pub(crate) fn local_changed(&self) {
        {
            let mut tx = self.tx.lock().unwrap();
            tx.pacer.local_change = true;
            self.txtimer_cv.notify_all();
        }
        self.publish(Event::LocalChanged {
            link: self.name.clone(),
        });
    }

    /// A new peer has appeared.  Start a fast transmission burst.
    pub(crate) fn new_neighbor(&self) {
        let mut tx = self.tx.lock().unwrap();
        tx.pacer.new_neighbor = true;
        self.txtimer_cv.notify_all();
    }

    pub(crate) fn retire(&self, handle: JoinHandle<()>) {
        self.retired.lock().unwrap().push(handle);
    }

    /// Join the threads of any stopped features.  Must be called with no
    /// agent locks held.
    pub(crate) fn reap(&self) {
        let retired = std::mem::take(&mut *self.retired.lock().unwrap());
        for handle in retired {
            if handle.join().is_err() {
                error!(self.log, "dcbx feature thread panicked");
            }
        }
    }

    /// Change the administrative mode of the agent
    pub fn set_mode(&self, mode: AdminStatus) {
        let old = std::mem::replace(&mut self.status.lock().unwrap().admin, mode);
        if old == mode {
            return;
        }
        info!(self.log, "admin mode {old} -> {mode}");
        self.publish(Event::ModeChanged {
            link: self.name.clone(),
            mode,
        });
        self.poke_all();
    }

    /// Choose which optional TLVs in `category` are advertised.  Newly
    /// enabled TLVs have their codec initialized, and disabled ones are
    /// finalized, all while holding the local MIB write lock.
    pub fn set_tlv_mask(
        self: &Arc<Self>,
        category: TlvCategory,
        tlvs: &[OptionalTlv],
        op: MaskOp,
    ) -> LldpdResult<()> {
        if let Some(t) = tlvs.iter().find(|t| t.category() != category) {
            return Err(LldpdError::Invalid(format!(
                "{t:?} is not a {category:?} tlv"
            )));
        }
        let requested: BTreeSet<OptionalTlv> = tlvs.iter().copied().collect();

        let mut local = self.local.write().unwrap();
        let current: BTreeSet<OptionalTlv> = OptionalTlv::ALL
            .into_iter()
            .filter(|t| {
                t.category() == category && local.write_list.contains(&t.key())
            })
            .collect();
        let target: BTreeSet<OptionalTlv> = match op {
            MaskOp::Set => requested,
            MaskOp::Add => current.union(&requested).copied().collect(),
            MaskOp::Remove => current.difference(&requested).copied().collect(),
        };

        let mut changed = false;
        let mut result = Ok(());
        for t in current.difference(&target) {
            if let Some(codec) = local.write_list.remove(&t.key()) {
                codec.fini(self, &mut local);
                debug!(self.log, "disabled {} tlv", codec.name());
                changed = true;
            }
        }
        for t in target.difference(&current) {
            let Some(codec) = self.services.tlvs.lookup(&t.key()) else {
                result = Err(LldpdError::Missing(format!("codec for {t:?}")));
                continue;
            };
            match codec.init(self, &mut local) {
                Ok(()) => {
                    local.write_list.add(codec.clone());
                    debug!(self.log, "enabled {} tlv", codec.name());
                    changed = true;
                }
                Err(e) => {
                    error!(self.log, "failed to enable {} tlv: {e}", codec.name());
                    result = Err(e);
                }
            }
        }
        drop(local);

        self.reap();
        if changed {
            self.local_changed();
        }
        result
    }

    /// The TLVs currently being advertised, in transmission order
    pub fn tlv_mask(&self) -> Vec<TlvKey> {
        self.local.read().unwrap().write_list.keys()
    }

    /// Set or clear the string carried in our Port Description TLV
    pub fn set_port_description(&self, desc: Option<String>) {
        {
            let mut local = self.local.write().unwrap();
            match desc {
                Some(d) => local
                    .fields
                    .insert(TlvKey::PORT_DESC, TlvData::PortDescription(d)),
                None => local.fields.remove(&TlvKey::PORT_DESC),
            };
        }
        self.local_changed();
    }

    /// Update one of a DCBX feature's local parameters
    pub fn set_feature_property(
        &self,
        feature: Feature,
        key: &str,
        value: &str,
    ) -> LldpdResult<()> {
        self.feature(feature)?.set_property(key, value)
    }

    /// Entry point for whoever monitors the underlying link
    pub fn link_event(&self, event: LinkEvent) {
        let mut status = self.status.lock().unwrap();
        match event {
            LinkEvent::Up | LinkEvent::Down => {
                let up = event == LinkEvent::Up;
                if status.link_up == up {
                    return;
                }
                status.link_up = up;
                drop(status);
                info!(self.log, "link {}", if up { "up" } else { "down" });
                self.poke_all();
            }
            LinkEvent::MtuChanged(mtu) => {
                status.mtu = mtu;
                drop(status);
                info!(self.log, "mtu changed to {mtu}");
                self.local_changed();
            }
            LinkEvent::FlowControlChanged => {
                drop(status);
                debug!(self.log, "flow control mode changed");
                self.poke_features(FeatureEvent::Status);
            }
        }
    }

    pub fn neighbors(&self) -> Vec<NeighborInfo> {
        self.remote.lock().unwrap().neighbors()
    }

    pub fn stats(&self) -> Stats {
        self.stats.lock().unwrap().clone()
    }

    pub fn rx_state(&self) -> RxState {
        self.rx.lock().unwrap().state
    }

    pub fn too_many_neighbors(&self) -> bool {
        self.rx.lock().unwrap().too_many.is_some()
    }

    pub fn tx_state(&self) -> TxState {
        self.tx.lock().unwrap().state
    }

    pub fn txtimer_state(&self) -> TxTimerState {
        self.tx.lock().unwrap().timer_state
    }

    fn feature(&self, feature: Feature) -> LldpdResult<Arc<dyn DcbxFeature>> {
        self.features
            .lock()
            .unwrap()
            .get(&feature)
            .cloned()
            .ok_or_else(|| {
                LldpdError::Missing(format!(
                    "{feature} is not enabled on {}",
                    self.name
                ))
            })
    }

    pub fn feature_state(&self, feature: Feature) -> LldpdResult<DcbxState> {
        Ok(self.feature(feature)?.info().state)
    }

    pub fn feature_info(&self, feature: Feature) -> LldpdResult<FeatureInfo> {
        Ok(self.feature(feature)?.info())
    }

    /// The configuration the feature is currently operating with
    pub fn feature_oper_config(&self, feature: Feature) -> LldpdResult<String> {
        Ok(self.feature(feature)?.info().oper)
    }
}
