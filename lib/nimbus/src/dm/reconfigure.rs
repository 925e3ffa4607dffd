// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capacity and configuration changes, backups and restores.

use nimbus_types::{
    DatastoreType, ImageType, LcmState, ObjectId, PendingResize, RestoreRequest,
    VectorAttribute, VmState,
};
use slog::{error, info};

use super::{DispatchError, DispatchManager};
use crate::quota::VmUsage;
use crate::tm::TransferOp;
use crate::vmm::VmmOp;
use crate::RequestAttributes;

/// Template sections replaced by an update-conf request. `None` keeps the
/// current section.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfUpdate {
    pub os: Option<VectorAttribute>,
    pub context: Option<VectorAttribute>,
    pub graphics: Option<VectorAttribute>,
    pub backup: Option<BackupConfig>,
}

/// Backup policy of a VM.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackupConfig {
    pub incremental: bool,
    /// Increments kept before the oldest ones are merged.
    pub keep_last: Option<u32>,
}

/// States in which the template can change without the hypervisor.
fn offline(state: VmState) -> bool {
    matches!(
        state,
        VmState::Init
            | VmState::Pending
            | VmState::Hold
            | VmState::Poweroff
            | VmState::Undeployed
            | VmState::CloningFailure
    )
}

impl DispatchManager {
    /// Changes CPU and memory. A running VM is resized live when its
    /// hypervisor driver supports it.
    pub fn resize(
        &self,
        vid: ObjectId,
        cpu: f64,
        vcpu: u32,
        memory: u64,
        _ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        let current = self.pools.vms.get_ro(vid).ok_or(DispatchError::NotFound(vid))?;
        let (state, lcm_state) = (current.state(), current.lcm_state());
        let live = state == VmState::Active && lcm_state == LcmState::Running;
        if !live && !offline(state) {
            return Err(self.reject("resize", &current));
        }
        if live {
            let vmm_mad = current.history().map(|h| h.vmm_mad.as_str()).unwrap_or_default();
            if !self.config.vmm_driver(vmm_mad).live_resize {
                return Err(DispatchError::Rejected(format!(
                    "Hypervisor {vmm_mad} cannot resize VM {vid} while running"
                )));
            }
        }

        let cpu_delta = cpu - current.cpu;
        let mem_delta = memory as i64 - current.memory as i64;
        let counted_running = !matches!(state, VmState::Poweroff | VmState::Undeployed);
        let delta = VmUsage {
            cpu: cpu_delta,
            memory: mem_delta,
            running_cpu: if counted_running { cpu_delta } else { 0.0 },
            running_memory: if counted_running { mem_delta } else { 0 },
            ..Default::default()
        };
        self.quotas
            .vm_check(current.uid, current.gid, &delta)
            .map_err(DispatchError::Rejected)?;

        let mut vm = self.get_vm(vid)?;
        if (vm.state(), vm.lcm_state()) != (state, lcm_state) {
            let err = self.reject("resize", &vm);
            drop(vm);
            self.quotas.vm_add(current.uid, current.gid, &delta.negate());
            return Err(err);
        }

        if live {
            vm.set_lcm_state(LcmState::HotplugResize);
            vm.pending_resize = Some(PendingResize { cpu, vcpu, memory });
            self.update(&vm);
            drop(vm);
            self.vmm.trigger(vid, VmmOp::Resize);
            return Ok(());
        }

        if let (VmState::Poweroff, Some(hid)) = (state, vm.hid()) {
            let cpu_hundredths = (cpu * 100.0).round() as i64 - (vm.cpu * 100.0).round() as i64;
            let res = self.pools.hosts.update_capacity(
                hid,
                vid,
                cpu_hundredths,
                mem_delta * 1024,
            );
            if let Err(e) = res {
                error!(self.log, "could not update host capacity"; "vm_id" => vid,
                    "error" => %e);
            }
        }
        vm.cpu = cpu;
        vm.vcpu = vcpu;
        vm.memory = memory;
        self.update(&vm);
        info!(self.log, "VM resized"; "vm_id" => vid, "cpu" => cpu, "memory" => memory);
        Ok(())
    }

    /// Replaces OS, context or graphics sections. A running VM is
    /// reconfigured by the hypervisor driver as well.
    pub fn update_conf(
        &self,
        vid: ObjectId,
        conf: ConfUpdate,
        _ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        let mut vm = self.check("updateconf", vid, |state, lcm| {
            (state == VmState::Active && lcm == LcmState::Running) || offline(state)
        })?;
        let hypervisor = conf.os.is_some() || conf.context.is_some() || conf.graphics.is_some();
        if let Some(os) = conf.os {
            vm.os = Some(os);
        }
        if let Some(context) = conf.context {
            vm.context = Some(context);
        }
        if let Some(graphics) = conf.graphics {
            vm.graphics = Some(graphics);
        }
        if let Some(backup) = conf.backup {
            if backup.incremental != vm.backups.incremental {
                vm.backups.reset_chain();
            }
            vm.backups.incremental = backup.incremental;
            vm.backups.keep_last = backup.keep_last;
        }
        let live = hypervisor && vm.state() == VmState::Active;
        if live {
            vm.set_lcm_state(LcmState::Hotplug);
        }
        self.update(&vm);
        drop(vm);

        if live {
            self.vmm.trigger(vid, VmmOp::UpdateConf);
        }
        Ok(())
    }

    /// Backs the VM up to backup datastore `ds_id`. With `reset` the next
    /// backup starts a new increment chain.
    pub fn backup(
        &self,
        vid: ObjectId,
        ds_id: ObjectId,
        reset: bool,
        _ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        let ds = self
            .pools
            .datastores
            .get_ro(ds_id)
            .ok_or_else(|| DispatchError::Rejected(format!("Datastore {ds_id} does not exist")))?;
        if ds.ds_type != DatastoreType::Backup {
            return Err(DispatchError::Rejected(format!(
                "Datastore {ds_id} is not a backup datastore"
            )));
        }

        let mut vm = self.check("backup", vid, |state, lcm| {
            (state == VmState::Active && lcm == LcmState::Running) || state == VmState::Poweroff
        })?;
        if vm.backups.active_flatten {
            return Err(DispatchError::Rejected(format!(
                "VM {vid} backup chain is being consolidated"
            )));
        }

        if vm.state() == VmState::Poweroff {
            vm.set_state(VmState::Active);
            vm.set_lcm_state(LcmState::BackupPoweroff);
        } else {
            vm.set_lcm_state(LcmState::Backup);
        }
        if reset {
            vm.backups.reset_chain();
        }
        vm.backups.backup_ds_id = Some(ds_id);
        self.update(&vm);
        drop(vm);

        self.vmm.trigger(vid, VmmOp::Backup);
        Ok(())
    }

    pub fn backup_cancel(
        &self,
        vid: ObjectId,
        _ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        drop(self.check("backup-cancel", vid, |state, lcm| {
            state == VmState::Active
                && matches!(lcm, LcmState::Backup | LcmState::BackupPoweroff)
        })?);
        self.vmm.trigger(vid, VmmOp::BackupCancel);
        Ok(())
    }

    /// Restores the disks of a powered-off VM from backup image `image_id`.
    /// `increment_id` and `disk_id` of -1 select the latest increment and
    /// every disk.
    pub fn restore(
        &self,
        vid: ObjectId,
        image_id: ObjectId,
        increment_id: i64,
        disk_id: i64,
        _ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        let image = self
            .pools
            .images
            .get_ro(image_id)
            .ok_or_else(|| DispatchError::Rejected(format!("Image {image_id} does not exist")))?;
        if image.image_type != ImageType::Backup {
            return Err(DispatchError::Rejected(format!("Image {image_id} is not a backup")));
        }

        let mut vm = self.check("restore", vid, |state, _| state == VmState::Poweroff)?;
        vm.set_state(VmState::Active);
        vm.set_lcm_state(LcmState::Restore);
        vm.backups.pending_restore = Some(RestoreRequest { image_id, increment_id, disk_id });
        self.update(&vm);
        drop(vm);

        self.tm.trigger(vid, TransferOp::Restore);
        Ok(())
    }
}
