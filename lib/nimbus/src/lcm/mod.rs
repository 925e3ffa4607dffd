// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The life-cycle manager owns the VM state machine.
//!
//! Every trigger follows the same pattern: lock the VM, check that the
//! current state admits the event, mutate state, capacity and history,
//! persist, then issue exactly one next command to the transfer manager,
//! the VM manager or the dispatch manager. A trigger that finds the VM in a
//! state it does not handle logs the event and drops it. Since driver
//! completions check the state they expect, this is also how stale
//! callbacks from superseded operations are discarded.

use std::sync::Arc;

use nimbus_config::Config;
use nimbus_types::{ObjectId, VirtualMachine, VmAction};
use slog::{error, o, warn, Logger};
use strum::Display;

use crate::dm::DmHandle;
use crate::listener::{ActionHandler, ActionQueue};
use crate::pool::{PoolGuard, Pools};
use crate::quota::{Quotas, VmUsage};
use crate::tm::TmHandle;
use crate::vmm::VmmHandle;
use crate::RequestAttributes;

mod actions;
mod cleanup;
mod recover;
mod states;
mod updates;

/// A driver operation whose completion re-enters the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum DriverStep {
    Prolog,
    Epilog,
    Deploy,
    Shutdown,
    Save,
    Saveas,
    Attach,
    Detach,
    AttachNic,
    DetachNic,
    SnapshotCreate,
    SnapshotRevert,
    SnapshotDelete,
    DiskSnapshot,
    DiskResize,
    DiskRestore,
    Backup,
    Resize,
    UpdateConf,
    Cleanup,
}

#[derive(Debug)]
pub enum LcmAction {
    Deploy { vid: ObjectId, ra: RequestAttributes },
    Suspend { vid: ObjectId, ra: RequestAttributes },
    Stop { vid: ObjectId, ra: RequestAttributes },
    /// Cold migration. `action` is `Migrate`, `PoffMigrate` or
    /// `PoffHardMigrate`.
    Migrate { vid: ObjectId, ra: RequestAttributes, action: VmAction },
    LiveMigrate { vid: ObjectId, ra: RequestAttributes },
    Shutdown { vid: ObjectId, hard: bool, ra: RequestAttributes },
    Undeploy { vid: ObjectId, hard: bool, ra: RequestAttributes },
    Poweroff { vid: ObjectId, hard: bool, ra: RequestAttributes },
    Restore { vid: ObjectId, ra: RequestAttributes },
    Restart { vid: ObjectId, ra: RequestAttributes },
    Delete { vid: ObjectId, ra: RequestAttributes },
    DeleteRecreate { vid: ObjectId, ra: RequestAttributes },
    Updatesg(ObjectId),
    Updatevnet(ObjectId),
    Recover { vid: ObjectId, success: bool, ra: RequestAttributes },
    Retry { vid: ObjectId, ra: RequestAttributes },
    /// Completion of a driver operation. `payload` carries step specific
    /// results (deploy id, snapshot id, backup source and size).
    Driver { vid: ObjectId, step: DriverStep, success: bool, payload: String },
    /// Consolidates the increment chain of backup image `image_id`.
    FlattenBackup { vid: ObjectId, image_id: ObjectId },
    MonitorUnknown(ObjectId),
    MonitorPoweroff(ObjectId),
    MonitorRunning(ObjectId),
}

/// Enqueues events for the life-cycle manager.
#[derive(Clone)]
pub struct LcmHandle {
    queue: Arc<ActionQueue<LcmAction>>,
}

impl LcmHandle {
    pub fn new(queue: Arc<ActionQueue<LcmAction>>) -> Self {
        Self { queue }
    }

    pub fn trigger(&self, action: LcmAction) {
        self.queue.push(action);
    }

    pub fn success(&self, step: DriverStep, vid: ObjectId) {
        self.success_with(step, vid, String::new());
    }

    pub fn success_with(&self, step: DriverStep, vid: ObjectId, payload: String) {
        self.queue.push(LcmAction::Driver { vid, step, success: true, payload });
    }

    pub fn failure(&self, step: DriverStep, vid: ObjectId) {
        self.queue.push(LcmAction::Driver {
            vid,
            step,
            success: false,
            payload: String::new(),
        });
    }

    pub fn updatesg(&self, sgid: ObjectId) {
        self.queue.push(LcmAction::Updatesg(sgid));
    }

    pub fn updatevnet(&self, vnid: ObjectId) {
        self.queue.push(LcmAction::Updatevnet(vnid));
    }
}

pub struct LifeCycleManager {
    queue: Arc<ActionQueue<LcmAction>>,
    pools: Arc<Pools>,
    tm: TmHandle,
    vmm: VmmHandle,
    dm: DmHandle,
    quotas: Arc<dyn Quotas>,
    config: Arc<Config>,
    log: Logger,
}

impl LifeCycleManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<ActionQueue<LcmAction>>,
        pools: Arc<Pools>,
        tm: TmHandle,
        vmm: VmmHandle,
        dm: DmHandle,
        quotas: Arc<dyn Quotas>,
        config: Arc<Config>,
        log: &Logger,
    ) -> Self {
        Self {
            queue,
            pools,
            tm,
            vmm,
            dm,
            quotas,
            config,
            log: log.new(o!("component" => "lcm")),
        }
    }

    fn handle_self(&self) -> LcmHandle {
        LcmHandle::new(Arc::clone(&self.queue))
    }

    fn get_vm(&self, vid: ObjectId) -> Option<PoolGuard<VirtualMachine>> {
        let vm = self.pools.vms.get(vid);
        if vm.is_none() {
            warn!(self.log, "VM does not exist"; "vm_id" => vid);
        }
        vm
    }

    fn update(&self, vm: &VirtualMachine) {
        if let Err(e) = self.pools.vms.update(vm) {
            error!(self.log, "failed to persist VM"; "vm_id" => vm.oid,
                "error" => %e);
        }
    }

    fn update_history(&self, vm: &VirtualMachine) {
        if let Err(e) = self.pools.vms.update_history(vm) {
            error!(self.log, "failed to persist history"; "vm_id" => vm.oid,
                "error" => %e);
        }
    }

    fn update_previous_history(&self, vm: &VirtualMachine) {
        if let Err(e) = self.pools.vms.update_previous_history(vm) {
            error!(self.log, "failed to persist history"; "vm_id" => vm.oid,
                "error" => %e);
        }
    }

    /// Records the action that closes the current history record.
    fn set_action(vm: &mut VirtualMachine, action: VmAction, ra: &RequestAttributes) {
        if let Some(h) = vm.history_mut() {
            h.action = action;
            h.uid = ra.uid;
            h.gid = ra.gid;
            h.req_id = ra.req_id;
        }
    }

    /// Reserves the VM's capacity on its current host.
    fn add_capacity(&self, vm: &VirtualMachine) -> bool {
        let Some(hid) = vm.hid() else {
            return false;
        };
        match self.pools.hosts.add_capacity(hid, &vm.capacity()) {
            Ok(()) => true,
            Err(e) => {
                error!(self.log, "could not add host capacity"; "vm_id" => vm.oid,
                    "host_id" => hid, "error" => %e);
                false
            }
        }
    }

    fn del_capacity(&self, hid: Option<ObjectId>, vid: ObjectId) {
        if let Some(hid) = hid {
            self.pools.hosts.del_capacity(hid, vid);
        }
    }

    /// Counts the VM as running again. Call without holding the VM guard.
    fn restore_running_quota(&self, uid: ObjectId, gid: ObjectId, cpu: f64, memory: u64) {
        self.quotas.vm_add(uid, gid, &VmUsage::running(cpu, memory));
    }

    fn wrong_state(&self, event: &str, vm: &VirtualMachine) {
        error!(self.log, "{} action received but VM is in wrong state", event;
            "vm_id" => vm.oid, "state" => vm.state_str());
    }
}

impl ActionHandler for LifeCycleManager {
    type Action = LcmAction;

    fn queue(&self) -> &ActionQueue<LcmAction> {
        &self.queue
    }

    fn handle(&self, action: LcmAction) {
        match action {
            LcmAction::Deploy { vid, ra } => self.deploy_action(vid, &ra),
            LcmAction::Suspend { vid, ra } => self.suspend_action(vid, &ra),
            LcmAction::Stop { vid, ra } => self.stop_action(vid, &ra),
            LcmAction::Migrate { vid, ra, action } => {
                self.migrate_action(vid, &ra, action)
            }
            LcmAction::LiveMigrate { vid, ra } => self.live_migrate_action(vid, &ra),
            LcmAction::Shutdown { vid, hard, ra } => {
                self.shutdown_action(vid, hard, &ra)
            }
            LcmAction::Undeploy { vid, hard, ra } => {
                self.undeploy_action(vid, hard, &ra)
            }
            LcmAction::Poweroff { vid, hard, ra } => {
                self.poweroff_action(vid, hard, &ra)
            }
            LcmAction::Restore { vid, ra } => self.restore_action(vid, &ra),
            LcmAction::Restart { vid, ra } => self.restart_action(vid, &ra),
            LcmAction::Delete { vid, ra } => self.delete_action(vid, &ra),
            LcmAction::DeleteRecreate { vid, ra } => {
                self.delete_recreate_action(vid, &ra)
            }
            LcmAction::Updatesg(sgid) => self.updatesg_action(sgid),
            LcmAction::Updatevnet(vnid) => self.updatevnet_action(vnid),
            LcmAction::Recover { vid, success, ra } => {
                self.recover(vid, success, &ra)
            }
            LcmAction::Retry { vid, ra } => self.retry(vid, &ra),
            LcmAction::Driver { vid, step, success, payload } => {
                self.driver_callback(vid, step, success, &payload)
            }
            LcmAction::FlattenBackup { vid, image_id } => {
                self.flatten_backup(vid, image_id)
            }
            LcmAction::MonitorUnknown(vid) => self.monitor_unknown(vid),
            LcmAction::MonitorPoweroff(vid) => self.monitor_poweroff(vid),
            LcmAction::MonitorRunning(vid) => self.monitor_running(vid),
        }
    }
}
