// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};

use crate::ObjectId;

/// Backup configuration and progress of a VM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backups {
    /// Incremental mode keeps adding increments to one backup image.
    pub incremental: bool,
    /// Datastore of the backup in progress.
    pub backup_ds_id: Option<ObjectId>,
    /// Increments kept in a chain before the oldest ones are merged.
    pub keep_last: Option<u32>,
    /// Backup image holding the current increment chain, -1 if none.
    pub incremental_backup_id: i64,
    /// Last increment written to that image, -1 if none.
    pub last_increment_id: i64,
    pub last_backup_id: Option<ObjectId>,
    pub last_backup_size: u64,
    /// Set while the backup datastore flattens or consolidates the chain.
    pub active_flatten: bool,
    /// Restore operation in flight.
    pub pending_restore: Option<RestoreRequest>,
}

/// Restores disk(s) of a VM from a backup image increment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub image_id: ObjectId,
    /// -1 restores the latest increment.
    pub increment_id: i64,
    /// -1 restores every disk.
    pub disk_id: i64,
}

impl Default for Backups {
    fn default() -> Self {
        Self {
            incremental: false,
            keep_last: None,
            backup_ds_id: None,
            incremental_backup_id: -1,
            last_increment_id: -1,
            last_backup_id: None,
            last_backup_size: 0,
            active_flatten: false,
            pending_restore: None,
        }
    }
}

impl Backups {
    /// Starts a fresh chain on the next backup.
    pub fn reset_chain(&mut self) {
        self.incremental_backup_id = -1;
        self.last_increment_id = -1;
    }

    /// Number of increments to merge for a chain of `len` increments.
    pub fn excess(&self, len: usize) -> usize {
        match self.keep_last {
            Some(keep) if self.incremental => len.saturating_sub(keep.max(1) as usize),
            _ => 0,
        }
    }
}

/// CPU/memory values requested by an in-flight live resize.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingResize {
    pub cpu: f64,
    pub vcpu: u32,
    pub memory: u64,
}
