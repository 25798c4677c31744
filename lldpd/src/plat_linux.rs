// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Raw Ethernet access and link monitoring on Linux

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use pnet::datalink;
use pnet::datalink::Channel;
use pnet::datalink::DataLinkReceiver;
use pnet::datalink::DataLinkSender;
use pnet::datalink::NetworkInterface;
use slog::debug;
use slog::info;

use crate::errors::LldpdError;
use crate::link::LinkEvent;
use crate::link::Transport;
use crate::types::LldpdResult;
use crate::Global;
use protocol::MacAddr;

/// How long a read blocks before the reader rechecks for shutdown
const READ_TIMEOUT: Duration = Duration::from_millis(250);
/// How often the link monitor samples interface state
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A pnet datalink channel bound to one interface
pub struct PnetTransport {
    name: String,
    tx: Mutex<Box<dyn DataLinkSender>>,
    rx: Mutex<Box<dyn DataLinkReceiver>>,
    closed: AtomicBool,
}

fn find_iface(name: &str) -> LldpdResult<NetworkInterface> {
    datalink::interfaces()
        .into_iter()
        .find(|i| i.name == name)
        .ok_or_else(|| LldpdError::Missing(format!("no such link: {name}")))
}

impl PnetTransport {
    pub fn open(name: &str) -> LldpdResult<PnetTransport> {
        let iface = find_iface(name)?;
        let config = datalink::Config {
            read_timeout: Some(READ_TIMEOUT),
            ..Default::default()
        };
        match datalink::channel(&iface, config) {
            Ok(Channel::Ethernet(tx, rx)) => Ok(PnetTransport {
                name: name.to_string(),
                tx: Mutex::new(tx),
                rx: Mutex::new(rx),
                closed: AtomicBool::new(false),
            }),
            Ok(_) => Err(LldpdError::Transport(format!(
                "{name}: unsupported channel type"
            ))),
            Err(e) => Err(LldpdError::Transport(format!(
                "failed to open {name}: {e}"
            ))),
        }
    }

    fn check_open(&self) -> LldpdResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(LldpdError::Transport(format!("{} is closed", self.name)))
        } else {
            Ok(())
        }
    }
}

impl Transport for PnetTransport {
    fn send(&self, frame: &[u8]) -> LldpdResult<()> {
        self.check_open()?;
        match self.tx.lock().unwrap().send_to(frame, None) {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(LldpdError::Transport(format!(
                "send on {}: {e}",
                self.name
            ))),
            None => Err(LldpdError::Transport(format!(
                "send on {}: no buffer space",
                self.name
            ))),
        }
    }

    // The channel's read timeout is fixed when it is opened, so that is
    // the longest a call will block regardless of `timeout`.
    fn recv(&self, _timeout: Duration) -> LldpdResult<Option<Vec<u8>>> {
        self.check_open()?;
        match self.rx.lock().unwrap().next() {
            Ok(frame) => Ok(Some(frame.to_vec())),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(LldpdError::Transport(format!(
                "recv on {}: {e}",
                self.name
            ))),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Return the interface's MAC address
pub fn get_mac(name: &str) -> LldpdResult<MacAddr> {
    let addr_file = format!("/sys/class/net/{name}/address");
    let mac = std::fs::read_to_string(addr_file)?;
    mac.trim().parse().map_err(|e| {
        LldpdError::Other(format!("failed to parse mac address {mac}: {e:?}"))
    })
}

fn get_mtu(name: &str) -> Option<usize> {
    std::fs::read_to_string(format!("/sys/class/net/{name}/mtu"))
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LinkSample {
    up: bool,
    mtu: Option<usize>,
}

/// The events needed to move an agent from one observed state to the next
fn link_events(old: Option<LinkSample>, new: LinkSample) -> Vec<LinkEvent> {
    let mut events = Vec::new();
    if let Some(mtu) = new.mtu {
        if old.and_then(|o| o.mtu) != Some(mtu) {
            events.push(LinkEvent::MtuChanged(mtu));
        }
    }
    if old.map(|o| o.up) != Some(new.up) {
        events.push(if new.up { LinkEvent::Up } else { LinkEvent::Down });
    }
    events
}

/// Poll the state of every link with an agent, and report changes to the
/// agents.  Runs until `stop` is set.
pub fn link_monitor(
    g: Arc<Global>,
    stop: Arc<AtomicBool>,
) -> LldpdResult<JoinHandle<()>> {
    let log = g.log.new(slog::o!("unit" => "link-monitor"));
    let handle = std::thread::Builder::new()
        .name("link-monitor".to_string())
        .spawn(move || {
            let mut last: BTreeMap<String, LinkSample> = BTreeMap::new();
            debug!(log, "link monitor started");
            while !stop.load(Ordering::Acquire) {
                let ifaces: BTreeMap<String, NetworkInterface> =
                    datalink::interfaces()
                        .into_iter()
                        .map(|i| (i.name.clone(), i))
                        .collect();
                let names = g.agents();
                last.retain(|name, _| names.contains(name));
                for name in names {
                    let Ok(agent) = g.agent_get(&name) else {
                        continue;
                    };
                    let sample = LinkSample {
                        up: ifaces.get(&name).is_some_and(|i| i.is_up()),
                        mtu: get_mtu(&name),
                    };
                    for event in link_events(last.get(&name).copied(), sample) {
                        info!(log, "{name}: {event:?}");
                        agent.link_event(event);
                    }
                    last.insert(name, sample);
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            debug!(log, "link monitor exiting");
        })?;
    Ok(handle)
}
