// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;

use crate::timer::TimerId;
use crate::tlv::Fields;
use crate::tlv::TlvKey;
use crate::tlv::TlvRegistry;
use crate::tlv::WriteList;
use protocol::types::ChassisId;
use protocol::types::PortId;
use protocol::MacAddr;

/// MAC Service Access Point: the identity of one end of an LLDP exchange
#[derive(
    Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize,
)]
pub struct Msap {
    pub chassis_id: ChassisId,
    pub port_id: PortId,
}

impl fmt::Display for Msap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.chassis_id, self.port_id)
    }
}

/// What this agent advertises
pub struct LocalMib {
    pub msap: Msap,
    /// TTL carried in our LLDPDUs, set by the transmitter
    pub ttl: u16,
    /// Values for every optional TLV we could advertise
    pub fields: Fields,
    /// The optional TLVs we actually advertise, in order
    pub write_list: WriteList,
}

impl LocalMib {
    pub fn new(msap: Msap, ttl: u16) -> Self {
        LocalMib {
            msap,
            ttl,
            fields: Fields::new(),
            write_list: WriteList::default(),
        }
    }
}

/// Everything we know about one peer
#[derive(Clone, Debug)]
pub struct RemoteEntry {
    /// Unique, increasing, never reused within an agent
    pub index: u64,
    /// Ethernet source of the most recent LLDPDU
    pub src_mac: MacAddr,
    pub ttl: u16,
    pub fields: Fields,
    /// When this information expires
    pub rx_info_ttl: Instant,
    /// The timer that will report the expiration
    pub timer: Option<TimerId>,
    pub first_seen: DateTime<Utc>,
    pub last_changed: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Snapshot of a remote MIB entry, suitable for display
#[derive(Clone, Debug, Serialize)]
pub struct NeighborInfo {
    pub index: u64,
    pub msap: Msap,
    pub src_mac: MacAddr,
    pub ttl: u16,
    pub first_seen: DateTime<Utc>,
    pub last_changed: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub fields: Fields,
}

/// The peers currently known to an agent, keyed by their MSAP
#[derive(Default)]
pub struct RemoteMib {
    entries: BTreeMap<Msap, RemoteEntry>,
    next_index: u64,
}

impl RemoteMib {
    pub fn new() -> Self {
        RemoteMib::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, msap: &Msap) -> Option<&RemoteEntry> {
        self.entries.get(msap)
    }

    pub fn get_mut(&mut self, msap: &Msap) -> Option<&mut RemoteEntry> {
        self.entries.get_mut(msap)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, Msap, RemoteEntry> {
        self.entries.iter()
    }

    /// Claim the index for a newly discovered peer
    pub fn alloc_index(&mut self) -> u64 {
        self.next_index += 1;
        self.next_index
    }

    pub fn insert(&mut self, msap: Msap, entry: RemoteEntry) -> Option<RemoteEntry> {
        self.entries.insert(msap, entry)
    }

    pub fn remove(&mut self, msap: &Msap) -> Option<RemoteEntry> {
        self.entries.remove(msap)
    }

    /// Empty the table, returning the aging timers that need cancelling
    pub fn clear(&mut self) -> Vec<TimerId> {
        let timers = self.entries.values().filter_map(|e| e.timer).collect();
        self.entries.clear();
        timers
    }

    pub fn neighbors(&self) -> Vec<NeighborInfo> {
        self.entries
            .iter()
            .map(|(msap, e)| NeighborInfo {
                index: e.index,
                msap: msap.clone(),
                src_mac: e.src_mac,
                ttl: e.ttl,
                first_seen: e.first_seen,
                last_changed: e.last_changed,
                last_seen: e.last_seen,
                fields: e.fields.clone(),
            })
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ChangeKind {
    NewNeighbor,
    Modified,
    NoChange,
    Shutdown,
}

/// How an incoming LLDPDU differs from what we already hold for its MSAP
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeSet {
    pub kind: ChangeKind,
    pub added: Vec<TlvKey>,
    pub deleted: Vec<TlvKey>,
    pub modified: Vec<TlvKey>,
}

impl ChangeSet {
    pub fn shutdown(old: Option<&Fields>) -> Self {
        ChangeSet {
            kind: ChangeKind::Shutdown,
            added: Vec::new(),
            deleted: old.map(|f| f.keys().copied().collect()).unwrap_or_default(),
            modified: Vec::new(),
        }
    }
}

/// Classify `new` against the fields stored for the same peer.  With no
/// stored fields every incoming TLV is new.
pub fn diff(registry: &TlvRegistry, old: Option<&Fields>, new: &Fields) -> ChangeSet {
    let Some(old) = old else {
        return ChangeSet {
            kind: ChangeKind::NewNeighbor,
            added: new.keys().copied().collect(),
            deleted: Vec::new(),
            modified: Vec::new(),
        };
    };

    let mut added = Vec::new();
    let mut modified = Vec::new();
    for (key, value) in new {
        match old.get(key) {
            None => added.push(*key),
            Some(prev) if !registry.same(key, prev, value) => modified.push(*key),
            Some(_) => {}
        }
    }
    let deleted: Vec<TlvKey> =
        old.keys().filter(|k| !new.contains_key(k)).copied().collect();

    let kind = if added.is_empty() && deleted.is_empty() && modified.is_empty()
    {
        ChangeKind::NoChange
    } else {
        ChangeKind::Modified
    };
    ChangeSet {
        kind,
        added,
        deleted,
        modified,
    }
}
