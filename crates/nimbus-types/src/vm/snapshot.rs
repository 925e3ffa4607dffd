// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::Timestamp;

/// The hypervisor operation pending on a VM (memory) snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotOp {
    Create,
    Revert,
    Delete,
}

/// A hypervisor-level snapshot of a running VM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSnapshot {
    pub snapshot_id: u32,
    pub name: String,
    pub hypervisor_id: String,
    pub time: Timestamp,
    /// Set while a driver operation on this snapshot is in flight.
    pub pending: Option<SnapshotOp>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSnapshot {
    pub id: i64,
    pub name: String,
    pub date: Timestamp,
    pub parent: i64,
    pub children: Vec<i64>,
    pub active: bool,
    /// Size in MiB.
    pub size: u64,
}

/// The snapshot tree of a single disk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSnapshots {
    pub snapshots: BTreeMap<i64, DiskSnapshot>,
    pub next_id: i64,
}

impl DiskSnapshots {
    pub fn active_id(&self) -> Option<i64> {
        self.snapshots.values().find(|s| s.active).map(|s| s.id)
    }

    /// Adds a snapshot as a child of the active one, returning its id.
    pub fn create(&mut self, name: &str, size: u64, date: Timestamp) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        let parent = self.active_id().unwrap_or(-1);
        if let Some(p) = self.snapshots.get_mut(&parent) {
            p.children.push(id);
        }
        let name = if name.is_empty() { format!("snapshot-{id}") } else { name.to_string() };
        self.snapshots.insert(
            id,
            DiskSnapshot { id, name, date, parent, children: Vec::new(), active: false, size },
        );
        id
    }

    /// Checks that `id` can be removed: it must exist, not be active and
    /// have no children.
    pub fn test_delete(&self, id: i64) -> Result<(), String> {
        let snap = self
            .snapshots
            .get(&id)
            .ok_or_else(|| format!("Snapshot {id} does not exist"))?;
        if snap.active {
            return Err(format!("Cannot delete the active snapshot {id}"));
        }
        if !snap.children.is_empty() {
            return Err(format!("Snapshot {id} has children"));
        }
        Ok(())
    }

    /// Removes a snapshot and returns its size.
    pub fn delete(&mut self, id: i64) -> Option<u64> {
        let snap = self.snapshots.remove(&id)?;
        if let Some(p) = self.snapshots.get_mut(&snap.parent) {
            p.children.retain(|c| *c != id);
        }
        Some(snap.size)
    }

    pub fn revert(&mut self, id: i64) -> bool {
        if !self.snapshots.contains_key(&id) {
            return false;
        }
        for snap in self.snapshots.values_mut() {
            snap.active = snap.id == id;
        }
        true
    }

    pub fn total_size(&self) -> u64 {
        self.snapshots.values().map(|s| s.size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
