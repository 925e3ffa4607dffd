// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The virtual machine manager: hypervisor-level operations sent to the
//! driver named by the VM's current history record.
//!
//! Submission follows the transfer manager: a VM without history, a driver
//! that is not loaded, or a request that cannot be built fails the step
//! without contacting any driver.

use std::collections::BTreeMap;
use std::sync::Arc;

use nimbus_config::Config;
use nimbus_types::{ObjectId, VirtualMachine};
use slog::{error, info, o, Logger};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::driver::{DriverChannel, DriverError, Message};
use crate::lcm::{DriverStep, LcmHandle};
use crate::listener::{ActionHandler, ActionQueue};
use crate::pool::Pools;
use crate::tm::TransferError;

mod protocol;
mod request;

pub use request::VmmRequest;

#[derive(Debug, Error)]
pub enum VmmError {
    #[error("VM has no history")]
    NoHistory,

    #[error("hypervisor driver {0:?} is not loaded")]
    NoDriver(String),

    #[error("no {0} operation in progress")]
    NothingPending(&'static str),

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("request is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Hypervisor operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmmOp {
    Deploy,
    Save,
    Shutdown,
    Cancel,
    /// Tears the VM down on its host, or on both hosts of an interrupted
    /// migration with `previous`.
    Cleanup { previous: bool },
    Migrate,
    Restore,
    Reboot,
    Reset,
    AttachDisk,
    DetachDisk,
    AttachNic,
    DetachNic,
    SnapshotCreate,
    SnapshotRevert,
    SnapshotDelete,
    DiskSnapshotCreate,
    DiskResize,
    UpdateConf,
    UpdateSg { sgid: ObjectId },
    UpdateNic { vnid: ObjectId },
    Resize,
    Backup,
    BackupCancel,
    DriverCancel,
}

impl VmmOp {
    pub fn message(self) -> VmmMessage {
        match self {
            VmmOp::Deploy => VmmMessage::Deploy,
            VmmOp::Save => VmmMessage::Save,
            VmmOp::Shutdown => VmmMessage::Shutdown,
            VmmOp::Cancel => VmmMessage::Cancel,
            VmmOp::Cleanup { .. } => VmmMessage::Cleanup,
            VmmOp::Migrate => VmmMessage::Migrate,
            VmmOp::Restore => VmmMessage::Restore,
            VmmOp::Reboot => VmmMessage::Reboot,
            VmmOp::Reset => VmmMessage::Reset,
            VmmOp::AttachDisk => VmmMessage::AttachDisk,
            VmmOp::DetachDisk => VmmMessage::DetachDisk,
            VmmOp::AttachNic => VmmMessage::AttachNic,
            VmmOp::DetachNic => VmmMessage::DetachNic,
            VmmOp::SnapshotCreate => VmmMessage::SnapshotCreate,
            VmmOp::SnapshotRevert => VmmMessage::SnapshotRevert,
            VmmOp::SnapshotDelete => VmmMessage::SnapshotDelete,
            VmmOp::DiskSnapshotCreate => VmmMessage::DiskSnapshotCreate,
            VmmOp::DiskResize => VmmMessage::ResizeDisk,
            VmmOp::UpdateConf => VmmMessage::UpdateConf,
            VmmOp::UpdateSg { .. } => VmmMessage::UpdateSg,
            VmmOp::UpdateNic { .. } => VmmMessage::UpdateNic,
            VmmOp::Resize => VmmMessage::Resize,
            VmmOp::Backup => VmmMessage::Backup,
            VmmOp::BackupCancel => VmmMessage::BackupCancel,
            VmmOp::DriverCancel => VmmMessage::DriverCancel,
        }
    }

    /// The lifecycle step failed when the request cannot be submitted.
    /// Operations nothing waits on have none.
    pub fn step(self) -> Option<DriverStep> {
        let step = match self {
            VmmOp::Deploy | VmmOp::Restore | VmmOp::Migrate => DriverStep::Deploy,
            VmmOp::Save => DriverStep::Save,
            VmmOp::Shutdown | VmmOp::Cancel => DriverStep::Shutdown,
            VmmOp::AttachDisk => DriverStep::Attach,
            VmmOp::DetachDisk => DriverStep::Detach,
            VmmOp::AttachNic => DriverStep::AttachNic,
            VmmOp::DetachNic => DriverStep::DetachNic,
            VmmOp::SnapshotCreate => DriverStep::SnapshotCreate,
            VmmOp::SnapshotRevert => DriverStep::SnapshotRevert,
            VmmOp::SnapshotDelete => DriverStep::SnapshotDelete,
            VmmOp::DiskSnapshotCreate => DriverStep::DiskSnapshot,
            VmmOp::DiskResize => DriverStep::DiskResize,
            VmmOp::UpdateConf => DriverStep::UpdateConf,
            VmmOp::Resize => DriverStep::Resize,
            VmmOp::Backup => DriverStep::Backup,
            VmmOp::Cleanup { .. } => DriverStep::Cleanup,
            VmmOp::Reboot
            | VmmOp::Reset
            | VmmOp::UpdateSg { .. }
            | VmmOp::UpdateNic { .. }
            | VmmOp::BackupCancel
            | VmmOp::DriverCancel => return None,
        };
        Some(step)
    }
}

/// Message types on a hypervisor driver channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE")]
pub enum VmmMessage {
    Deploy,
    Shutdown,
    Cancel,
    Save,
    Restore,
    Reboot,
    Reset,
    Migrate,
    AttachDisk,
    DetachDisk,
    AttachNic,
    DetachNic,
    SnapshotCreate,
    SnapshotRevert,
    SnapshotDelete,
    DiskSnapshotCreate,
    DiskSnapshotDelete,
    ResizeDisk,
    UpdateConf,
    UpdateSg,
    UpdateNic,
    #[strum(serialize = "DRIVER_CANCEL")]
    DriverCancel,
    Cleanup,
    Backup,
    BackupCancel,
    Resize,
    Poll,
    Log,
}

pub enum VmmAction {
    Trigger { vid: ObjectId, op: VmmOp },
    /// A line read from hypervisor driver `driver`.
    DriverMessage { driver: String, line: String },
}

/// Enqueues work for the virtual machine manager.
#[derive(Clone)]
pub struct VmmHandle {
    queue: Arc<ActionQueue<VmmAction>>,
}

impl VmmHandle {
    pub fn new(queue: Arc<ActionQueue<VmmAction>>) -> Self {
        Self { queue }
    }

    pub fn trigger(&self, vid: ObjectId, op: VmmOp) {
        self.queue.push(VmmAction::Trigger { vid, op });
    }

    pub fn driver_message(&self, driver: &str, line: String) {
        self.queue.push(VmmAction::DriverMessage { driver: driver.to_string(), line });
    }
}

pub struct VirtualMachineManager {
    queue: Arc<ActionQueue<VmmAction>>,
    pools: Arc<Pools>,
    lcm: LcmHandle,
    drivers: BTreeMap<String, Arc<dyn DriverChannel>>,
    config: Arc<Config>,
    log: Logger,
}

impl VirtualMachineManager {
    pub fn new(
        queue: Arc<ActionQueue<VmmAction>>,
        pools: Arc<Pools>,
        lcm: LcmHandle,
        drivers: BTreeMap<String, Arc<dyn DriverChannel>>,
        config: Arc<Config>,
        log: &Logger,
    ) -> Self {
        Self {
            queue,
            pools,
            lcm,
            drivers,
            config,
            log: log.new(o!("component" => "vmm")),
        }
    }

    fn driver_for(&self, vm: &VirtualMachine) -> Result<&Arc<dyn DriverChannel>, VmmError> {
        let name = vm.history().ok_or(VmmError::NoHistory)?.vmm_mad.as_str();
        self.drivers
            .get(name)
            .ok_or_else(|| VmmError::NoDriver(name.to_string()))
    }

    fn submit(&self, vm: &VirtualMachine, op: VmmOp) -> Result<(), VmmError> {
        let driver = self.driver_for(vm)?;
        let payload = match op {
            VmmOp::DriverCancel => String::new(),
            _ => VmmRequest::build(vm, op, &self.config.hostname)?.encode()?,
        };
        let msg = Message::request(op.message(), vm.oid, payload);
        driver.write(&msg.to_string())?;
        Ok(())
    }

    fn trigger(&self, vid: ObjectId, op: VmmOp) {
        let Some(mut vm) = self.pools.vms.get(vid) else {
            error!(self.log, "VM does not exist"; "vm_id" => vid,
                "operation" => %op.message());
            return;
        };

        match self.submit(&vm, op) {
            Ok(()) => {
                info!(self.log, "hypervisor request sent"; "vm_id" => vid,
                    "operation" => %op.message());
            }
            Err(e) => {
                error!(self.log, "hypervisor request failed"; "vm_id" => vid,
                    "operation" => %op.message(), "error" => %e);
                let Some(step) = op.step() else {
                    return;
                };
                vm.set_template_error_message(&format!(
                    "Error sending {} request: {e}",
                    op.message()
                ));
                self.persist(&vm);
                drop(vm);
                self.lcm.failure(step, vid);
            }
        }
    }

    fn persist(&self, vm: &VirtualMachine) {
        if let Err(e) = self.pools.vms.update(vm) {
            error!(self.log, "failed to persist VM"; "vm_id" => vm.oid,
                "error" => %e);
        }
    }
}

impl ActionHandler for VirtualMachineManager {
    type Action = VmmAction;

    fn queue(&self) -> &ActionQueue<VmmAction> {
        &self.queue
    }

    fn handle(&self, action: VmmAction) {
        match action {
            VmmAction::Trigger { vid, op } => self.trigger(vid, op),
            VmmAction::DriverMessage { driver, line } => self.protocol(&driver, &line),
        }
    }
}
