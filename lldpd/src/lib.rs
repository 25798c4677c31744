// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! An LLDP agent with DCBX feature negotiation.
//!
//! A [`Global`] holds the services shared by every agent (the timer service,
//! the TLV codec registry, and the event sink) along with the set of
//! running agents, one per link.  Links are supplied by the embedder as
//! [`link::Transport`] implementations.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use slog::info;

pub use agent::Agent;
pub use errors::LldpdError;
pub use types::LldpdResult;

pub mod agent;
pub mod dcbx;
pub mod errors;
pub mod events;
pub mod link;
pub mod logging;
pub mod mib;
pub mod rx;
pub mod timer;
pub mod tlv;
pub mod tx;
pub mod txtimer;
pub mod types;

#[cfg(target_os = "linux")]
pub mod plat_linux;

use dcbx::pfc::PfcAction;
use events::EventSink;
use link::Transport;
use timer::TimerService;
use tlv::TlvRegistry;
use types::AgentCfg;
use types::SystemInfo;
use protocol::MacAddr;

/// Facilities shared by every agent
#[derive(Clone)]
pub struct Services {
    pub timers: Arc<TimerService>,
    pub tlvs: Arc<TlvRegistry>,
    pub events: Arc<dyn EventSink>,
    /// Applies a negotiated PFC configuration to the hardware
    pub pfc_action: Option<PfcAction>,
}

impl Services {
    pub fn new(
        log: &slog::Logger,
        events: Arc<dyn EventSink>,
    ) -> LldpdResult<Self> {
        Ok(Services {
            timers: Arc::new(TimerService::new(log)?),
            tlvs: Arc::new(TlvRegistry::with_defaults()),
            events,
            pfc_action: None,
        })
    }

    pub fn with_pfc_action(mut self, action: PfcAction) -> Self {
        self.pfc_action = Some(action);
        self
    }
}

/// All global state for the lldpd daemon
pub struct Global {
    /// Root of the tree of loggers
    pub log: slog::Logger,
    /// Information about this system
    pub sys: SystemInfo,
    pub services: Services,
    /// Agents we are managing, keyed by link name
    agents: Mutex<BTreeMap<String, Arc<Agent>>>,
}

impl Global {
    pub fn new(log: &slog::Logger, sys: SystemInfo, services: Services) -> Self {
        Global {
            log: log.clone(),
            sys,
            services,
            agents: Mutex::new(BTreeMap::new()),
        }
    }

    /// Start an LLDP agent on a link
    pub fn agent_enable(
        &self,
        name: &str,
        transport: Arc<dyn Transport>,
        mac: MacAddr,
        cfg: AgentCfg,
    ) -> LldpdResult<Arc<Agent>> {
        cfg.validate()?;
        let mut agents = self.agents.lock().unwrap();
        if agents.contains_key(name) {
            return Err(LldpdError::Exists(format!(
                "already have an agent on {name}"
            )));
        }

        let agent = Agent::new(
            &self.log,
            name,
            mac,
            cfg,
            &self.sys,
            self.services.clone(),
            transport,
        );
        if let Err(e) = agent.start() {
            agent.shutdown();
            return Err(e);
        }
        info!(self.log, "enabled lldp on {name}"; "mac" => %mac);
        agents.insert(name.to_string(), agent.clone());
        Ok(agent)
    }

    /// Stop the agent on a link.  Waits for all of its threads to exit.
    pub fn agent_disable(&self, name: &str) -> LldpdResult<()> {
        let agent = self
            .agents
            .lock()
            .unwrap()
            .remove(name)
            .ok_or_else(|| LldpdError::Missing(format!("no agent on {name}")))?;
        agent.shutdown();
        info!(self.log, "disabled lldp on {name}");
        Ok(())
    }

    pub fn agent_get(&self, name: &str) -> LldpdResult<Arc<Agent>> {
        self.agents
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| LldpdError::Missing(format!("no agent on {name}")))
    }

    pub fn agents(&self) -> Vec<String> {
        self.agents.lock().unwrap().keys().cloned().collect()
    }

    pub fn shutdown_all(&self) {
        let agents = std::mem::take(&mut *self.agents.lock().unwrap());
        for (name, agent) in agents {
            info!(self.log, "shutting down {name}");
            agent.shutdown();
        }
        self.services.timers.shutdown();
    }
}
