// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The dispatch manager: the entry point for every user action on a VM.
//!
//! Each operation loads the VM, checks its state against the allow-list of
//! the action and either changes state directly or starts an asynchronous
//! sequence in the life-cycle manager. A rejected request returns a
//! [`DispatchError`] and leaves the VM exactly as it was.
//!
//! Operations run on the caller's thread. The terminal notifications the
//! life-cycle manager sends back (`done`, `stop_success`, ...) arrive
//! through [`DmHandle`] and are consumed by the dispatch manager's own
//! queue.

use std::sync::Arc;

use nimbus_config::Config;
use nimbus_types::{LcmState, ObjectId, VirtualMachine, VmState};
use slog::{error, o, warn, Logger};
use thiserror::Error;

use crate::lcm::LcmHandle;
use crate::listener::{ActionHandler, ActionQueue};
use crate::pool::{PoolError, PoolGuard, Pools};
use crate::quota::Quotas;
use crate::tm::TmHandle;
use crate::vmm::VmmHandle;

mod actions;
mod hotplug;
mod reconfigure;
pub(crate) mod resources;
mod snapshots;
mod states;

pub use reconfigure::{BackupConfig, ConfUpdate};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("VM {0} does not exist")]
    NotFound(ObjectId),

    #[error("{action} is not allowed for VM {vid} in state {state}")]
    InvalidState { action: &'static str, vid: ObjectId, state: String },

    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl DispatchError {
    /// Numeric code reported to API callers.
    pub fn code(&self) -> i32 {
        match self {
            DispatchError::InvalidState { .. } => -2,
            _ => -1,
        }
    }
}

/// Notifications from the life-cycle manager once a sequence has settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmAction {
    Done(ObjectId),
    Resubmit(ObjectId),
    StopSuccess(ObjectId),
    SuspendSuccess(ObjectId),
    PoweroffSuccess(ObjectId),
    UndeploySuccess(ObjectId),
}

#[derive(Clone)]
pub struct DmHandle {
    queue: Arc<ActionQueue<DmAction>>,
}

impl DmHandle {
    pub fn new(queue: Arc<ActionQueue<DmAction>>) -> Self {
        Self { queue }
    }

    pub fn done(&self, vid: ObjectId) {
        self.queue.push(DmAction::Done(vid));
    }

    pub fn resubmit(&self, vid: ObjectId) {
        self.queue.push(DmAction::Resubmit(vid));
    }

    pub fn stop_success(&self, vid: ObjectId) {
        self.queue.push(DmAction::StopSuccess(vid));
    }

    pub fn suspend_success(&self, vid: ObjectId) {
        self.queue.push(DmAction::SuspendSuccess(vid));
    }

    pub fn poweroff_success(&self, vid: ObjectId) {
        self.queue.push(DmAction::PoweroffSuccess(vid));
    }

    pub fn undeploy_success(&self, vid: ObjectId) {
        self.queue.push(DmAction::UndeploySuccess(vid));
    }
}

pub struct DispatchManager {
    queue: Arc<ActionQueue<DmAction>>,
    pools: Arc<Pools>,
    lcm: LcmHandle,
    tm: TmHandle,
    vmm: VmmHandle,
    quotas: Arc<dyn Quotas>,
    config: Arc<Config>,
    log: Logger,
}

impl DispatchManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<ActionQueue<DmAction>>,
        pools: Arc<Pools>,
        lcm: LcmHandle,
        tm: TmHandle,
        vmm: VmmHandle,
        quotas: Arc<dyn Quotas>,
        config: Arc<Config>,
        log: &Logger,
    ) -> Self {
        Self {
            queue,
            pools,
            lcm,
            tm,
            vmm,
            quotas,
            config,
            log: log.new(o!("component" => "dm")),
        }
    }

    pub fn pools(&self) -> &Arc<Pools> {
        &self.pools
    }

    fn get_vm(&self, vid: ObjectId) -> Result<PoolGuard<VirtualMachine>, DispatchError> {
        self.pools.vms.get(vid).ok_or(DispatchError::NotFound(vid))
    }

    /// Logs and builds the error for an action the VM's state does not
    /// admit.
    fn reject(&self, action: &'static str, vm: &VirtualMachine) -> DispatchError {
        warn!(self.log, "{} action not allowed", action; "vm_id" => vm.oid,
            "state" => vm.state_str());
        DispatchError::InvalidState { action, vid: vm.oid, state: vm.state_str() }
    }

    /// Locks the VM if `allowed` admits its current state.
    fn check(
        &self,
        action: &'static str,
        vid: ObjectId,
        allowed: impl Fn(VmState, LcmState) -> bool,
    ) -> Result<PoolGuard<VirtualMachine>, DispatchError> {
        let vm = self.get_vm(vid)?;
        if allowed(vm.state(), vm.lcm_state()) {
            Ok(vm)
        } else {
            Err(self.reject(action, &vm))
        }
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
}

impl ActionHandler for DispatchManager {
    type Action = DmAction;

    fn queue(&self) -> &ActionQueue<DmAction> {
        &self.queue
    }

    fn handle(&self, action: DmAction) {
        match action {
            DmAction::Done(vid) => self.done(vid),
            DmAction::Resubmit(vid) => self.resubmit(vid),
            DmAction::StopSuccess(vid) => self.stop_success(vid),
            DmAction::SuspendSuccess(vid) => self.suspend_success(vid),
            DmAction::PoweroffSuccess(vid) => self.poweroff_success(vid),
            DmAction::UndeploySuccess(vid) => self.undeploy_success(vid),
        }
    }
}
