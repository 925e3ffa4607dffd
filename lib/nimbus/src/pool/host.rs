// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::ops::Deref;
use std::sync::Arc;

use nimbus_types::{Host, HostCapacity, ObjectId};
use slog::{warn, Logger};

use super::{ObjectStore, Pool, PoolError};

/// The host pool, with capacity bookkeeping.
pub struct HostPool {
    pool: Pool<Host>,
    log: Logger,
}

impl Deref for HostPool {
    type Target = Pool<Host>;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl HostPool {
    pub fn new(store: Arc<dyn ObjectStore>, log: &Logger) -> Self {
        Self { pool: Pool::new(store, log), log: log.clone() }
    }

    /// Reserves `cap` on host `hid`. Fails if the host no longer exists.
    pub fn add_capacity(
        &self,
        hid: ObjectId,
        cap: &HostCapacity,
    ) -> Result<(), PoolError> {
        let mut host = self.get(hid).ok_or(PoolError::NotFound("host", hid))?;
        host.share.add(cap);
        self.update(&host)
    }

    /// Releases the capacity VM `vid` reserved on host `hid`. A missing
    /// host is only logged.
    pub fn del_capacity(&self, hid: ObjectId, vid: ObjectId) {
        let Some(mut host) = self.get(hid) else {
            warn!(self.log, "could not release capacity, host is gone";
                "host_id" => hid, "vm_id" => vid);
            return;
        };
        if !host.share.del(vid) {
            return;
        }
        if let Err(e) = self.update(&host) {
            warn!(self.log, "failed to persist host"; "host_id" => hid,
                "error" => %e);
        }
    }

    /// Adjusts the CPU (hundredths) and memory (KiB) reserved by VM `vid`,
    /// which stays on the host.
    pub fn update_capacity(
        &self,
        hid: ObjectId,
        vid: ObjectId,
        cpu_delta: i64,
        mem_delta: i64,
    ) -> Result<(), PoolError> {
        let mut host = self.get(hid).ok_or(PoolError::NotFound("host", hid))?;
        host.share.update(vid, cpu_delta, mem_delta);
        self.update(&host)
    }
}
