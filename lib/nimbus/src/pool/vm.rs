// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use nimbus_types::{History, ObjectId, VirtualMachine, VmState};
use slog::Logger;

use super::{ObjectStore, Pool, PoolError};

const HISTORY_TABLE: &str = "history";

/// The VM pool: plain pool operations plus history rows and the deploy-id
/// index of imported VMs.
pub struct VmPool {
    pool: Pool<VirtualMachine>,
    deploy_index: Mutex<BTreeMap<String, ObjectId>>,
}

impl Deref for VmPool {
    type Target = Pool<VirtualMachine>;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl VmPool {
    pub fn new(store: Arc<dyn ObjectStore>, log: &Logger) -> Self {
        Self { pool: Pool::new(store, log), deploy_index: Mutex::default() }
    }

    /// Adds a new VM in PENDING (or HOLD) state.
    pub fn allocate_vm(
        &self,
        mut vm: VirtualMachine,
        on_hold: bool,
    ) -> Result<ObjectId, PoolError> {
        vm.set_state(if on_hold { VmState::Hold } else { VmState::Pending });
        vm.stime = crate::now();
        self.pool.allocate(vm)
    }

    fn put_history(&self, vid: ObjectId, h: &History) -> Result<(), PoolError> {
        let body = serde_json::to_string(h)
            .map_err(|e| PoolError::Encode(HISTORY_TABLE, vid, e))?;
        self.store().put(HISTORY_TABLE, &format!("{vid}.{}", h.seq), &body)
    }

    /// Persists the current history record.
    pub fn update_history(&self, vm: &VirtualMachine) -> Result<(), PoolError> {
        match vm.history() {
            Some(h) => self.put_history(vm.oid, h),
            None => Ok(()),
        }
    }

    pub fn update_previous_history(
        &self,
        vm: &VirtualMachine,
    ) -> Result<(), PoolError> {
        match vm.previous_history() {
            Some(h) => self.put_history(vm.oid, h),
            None => Ok(()),
        }
    }

    /// Reads a persisted history row.
    pub fn history_record(&self, vid: ObjectId, seq: u32) -> Option<History> {
        let body = self.store().get(HISTORY_TABLE, &format!("{vid}.{seq}"))?;
        serde_json::from_str(&body).ok()
    }

    pub fn insert_index(&self, deploy_id: &str, vid: ObjectId) {
        self.deploy_index.lock().unwrap().insert(deploy_id.to_string(), vid);
    }

    pub fn drop_index(&self, deploy_id: &str) {
        self.deploy_index.lock().unwrap().remove(deploy_id);
    }

    pub fn get_by_deploy_id(&self, deploy_id: &str) -> Option<ObjectId> {
        self.deploy_index.lock().unwrap().get(deploy_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MemoryStore;
    use crate::test_util::test_logger;

    #[test]
    fn history_rows_are_keyed_by_sequence() {
        let pool = VmPool::new(Arc::new(MemoryStore::new()), &test_logger());
        let vid = pool
            .allocate_vm(VirtualMachine::new(0, 0, 0, "vm"), true)
            .unwrap();
        let mut vm = pool.get(vid).unwrap();
        assert_eq!(vm.state(), VmState::Hold);
        vm.add_history(History { hid: 4, ..Default::default() });
        vm.add_history(History { hid: 5, ..Default::default() });
        pool.update_history(&vm).unwrap();
        pool.update_previous_history(&vm).unwrap();
        assert_eq!(pool.history_record(vid, 0).unwrap().hid, 4);
        assert_eq!(pool.history_record(vid, 1).unwrap().hid, 5);
    }

    #[test]
    fn deploy_index() {
        let pool = VmPool::new(Arc::new(MemoryStore::new()), &test_logger());
        pool.insert_index("one-7", 7);
        assert_eq!(pool.get_by_deploy_id("one-7"), Some(7));
        pool.drop_index("one-7");
        assert_eq!(pool.get_by_deploy_id("one-7"), None);
    }
}
