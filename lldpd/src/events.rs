// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::sync::mpsc;
use std::sync::Mutex;

use serde::Serialize;
use slog::debug;
use slog::info;

use crate::dcbx::Feature;
use crate::mib::Msap;
use crate::types::AdminStatus;

/// How a remote MIB entry came to change
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RemoteChange {
    NewNeighbor,
    Modified,
    /// The peer sent an LLDPDU with a TTL of 0
    Shutdown,
    /// The peer's TTL expired
    Aged,
    /// The whole table was flushed when the receiver reinitialized
    Cleared,
}

/// Notifications emitted by the protocol engine
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Event {
    LocalChanged {
        link: String,
    },
    RemoteChanged {
        link: String,
        msap: Option<Msap>,
        change: RemoteChange,
    },
    ModeChanged {
        link: String,
        mode: AdminStatus,
    },
    FeatureOperChanged {
        link: String,
        feature: Feature,
        config: String,
    },
}

/// Whoever is interested in engine events.  `publish` is called from the
/// engine threads with no agent locks held.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

/// Drops every event on the floor, after logging it
pub struct LogSink {
    log: slog::Logger,
}

impl LogSink {
    pub fn new(log: &slog::Logger) -> Self {
        LogSink {
            log: log.new(slog::o!("unit" => "events")),
        }
    }
}

impl EventSink for LogSink {
    fn publish(&self, event: Event) {
        match &event {
            Event::RemoteChanged { .. } | Event::FeatureOperChanged { .. } => {
                info!(self.log, "{event:?}")
            }
            _ => debug!(self.log, "{event:?}"),
        }
    }
}

/// Forwards events over a channel.  Events published after the receiver
/// has been dropped are discarded.
pub struct ChannelSink {
    tx: Mutex<mpsc::Sender<Event>>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (ChannelSink { tx: Mutex::new(tx) }, rx)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: Event) {
        let _ = self.tx.lock().unwrap().send(event);
    }
}

#[test]
fn test_channel_sink() {
    let (sink, rx) = ChannelSink::new();
    sink.publish(Event::LocalChanged {
        link: "eth0".to_string(),
    });
    assert_eq!(
        rx.try_recv().unwrap(),
        Event::LocalChanged {
            link: "eth0".to_string()
        }
    );
    drop(rx);
    sink.publish(Event::LocalChanged {
        link: "eth0".to_string(),
    });
}
