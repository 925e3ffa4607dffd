// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver completions: one `<step>_success` / `<step>_failure` pair per
//! driver operation.

use nimbus_types::{
    BackupIncrement, Image, ImageState, ImageType, LcmState, ObjectId, PendingOp,
    SaveAsRequest, SnapshotOp, VirtualMachine, VirtualMachineDisk, VirtualMachineNic,
    VmAction, VmState,
};
use slog::{error, info, warn};

use super::{DriverStep, LcmAction, LifeCycleManager};
use crate::dm::resources;
use crate::pool::PoolGuard;
use crate::quota::VmUsage;
use crate::tm::TransferOp;
use crate::vmm::VmmOp;
use crate::now;

/// Moves an ACTIVE VM back to the stable state a hotplug-style operation
/// started from.
fn settle(vm: &mut VirtualMachine, state: VmState) {
    if state == VmState::Active {
        vm.set_lcm_state(LcmState::Running);
    } else {
        vm.set_state(state);
        vm.set_lcm_state(LcmState::LcmInit);
    }
}

impl LifeCycleManager {
    pub(super) fn driver_callback(
        &self,
        vid: ObjectId,
        step: DriverStep,
        success: bool,
        payload: &str,
    ) {
        match (step, success) {
            (DriverStep::Prolog, true) => self.prolog_success(vid),
            (DriverStep::Prolog, false) => self.prolog_failure(vid),
            (DriverStep::Epilog, true) => self.epilog_success(vid),
            (DriverStep::Epilog, false) => self.epilog_failure(vid),
            (DriverStep::Deploy, true) => self.deploy_success(vid, payload),
            (DriverStep::Deploy, false) => self.deploy_failure(vid),
            (DriverStep::Shutdown, true) => self.shutdown_success(vid),
            (DriverStep::Shutdown, false) => self.shutdown_failure(vid),
            (DriverStep::Save, true) => self.save_success(vid),
            (DriverStep::Save, false) => self.save_failure(vid),
            (DriverStep::Saveas, ok) => self.saveas_done(vid, ok),
            (DriverStep::Attach, ok) => self.attach_done(vid, ok),
            (DriverStep::Detach, ok) => self.detach_done(vid, ok),
            (DriverStep::AttachNic, ok) => self.attach_nic_done(vid, ok),
            (DriverStep::DetachNic, ok) => self.detach_nic_done(vid, ok),
            (DriverStep::SnapshotCreate, ok) => {
                self.snapshot_done(vid, SnapshotOp::Create, ok, payload)
            }
            (DriverStep::SnapshotRevert, ok) => {
                self.snapshot_done(vid, SnapshotOp::Revert, ok, payload)
            }
            (DriverStep::SnapshotDelete, ok) => {
                self.snapshot_done(vid, SnapshotOp::Delete, ok, payload)
            }
            (DriverStep::DiskSnapshot, ok) => self.disk_snapshot_done(vid, ok),
            (DriverStep::DiskResize, ok) => self.disk_resize_done(vid, ok),
            (DriverStep::DiskRestore, ok) => self.disk_restore_done(vid, ok),
            (DriverStep::Backup, ok) => self.backup_done(vid, ok, payload),
            (DriverStep::Resize, ok) => self.resize_done(vid, ok),
            (DriverStep::UpdateConf, ok) => self.update_conf_done(vid, ok),
            (DriverStep::Cleanup, _) => self.cleanup_callback(vid),
        }
    }

    fn prolog_success(&self, vid: ObjectId) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        let t = now();
        let (next, op) = match vm.lcm_state() {
            LcmState::Prolog => (LcmState::Boot, VmmOp::Deploy),
            LcmState::PrologResume => (LcmState::BootStopped, VmmOp::Restore),
            LcmState::PrologUndeploy => (LcmState::BootUndeploy, VmmOp::Deploy),
            LcmState::PrologMigrate => (LcmState::BootMigrate, VmmOp::Restore),
            LcmState::PrologMigrateUnknown => (LcmState::BootMigrate, VmmOp::Deploy),
            LcmState::PrologMigratePoweroff => {
                if let Some(h) = vm.history_mut() {
                    h.prolog_etime = t;
                }
                self.update_history(&vm);
                let was_running = matches!(
                    vm.previous_history().map(|h| h.action),
                    Some(VmAction::PoffMigrate | VmAction::PoffHardMigrate)
                );
                if was_running {
                    drop(vm);
                    self.dm.poweroff_success(vid);
                } else {
                    vm.set_state(VmState::Poweroff);
                    vm.set_lcm_state(LcmState::LcmInit);
                    self.update(&vm);
                }
                return;
            }
            LcmState::PrologMigrateSuspend => {
                if let Some(h) = vm.history_mut() {
                    h.prolog_etime = t;
                }
                vm.set_state(VmState::Suspended);
                vm.set_lcm_state(LcmState::LcmInit);
                self.update_history(&vm);
                self.update(&vm);
                return;
            }
            _ => {
                self.wrong_state("prolog success", &vm);
                return;
            }
        };

        vm.set_lcm_state(next);
        if let Some(h) = vm.history_mut() {
            h.prolog_etime = t;
            h.running_stime = t;
        }
        self.update_history(&vm);
        self.update(&vm);
        drop(vm);

        self.vmm.trigger(vid, op);
    }

    fn prolog_failure(&self, vid: ObjectId) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        let next = match vm.lcm_state() {
            LcmState::Prolog => LcmState::PrologFailure,
            LcmState::PrologResume => LcmState::PrologResumeFailure,
            LcmState::PrologUndeploy => LcmState::PrologUndeployFailure,
            LcmState::PrologMigrate => LcmState::PrologMigrateFailure,
            LcmState::PrologMigratePoweroff => LcmState::PrologMigratePoweroffFailure,
            LcmState::PrologMigrateSuspend => LcmState::PrologMigrateSuspendFailure,
            LcmState::PrologMigrateUnknown => LcmState::PrologMigrateUnknownFailure,
            _ => {
                self.wrong_state("prolog failure", &vm);
                return;
            }
        };
        vm.set_lcm_state(next);
        if let Some(h) = vm.history_mut() {
            h.prolog_etime = now();
        }
        self.update_history(&vm);
        self.update(&vm);
    }

    fn epilog_success(&self, vid: ObjectId) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        let state = vm.lcm_state();
        if !matches!(
            state,
            LcmState::Epilog | LcmState::EpilogStop | LcmState::EpilogUndeploy
        ) {
            self.wrong_state("epilog success", &vm);
            return;
        }

        let t = now();
        let stopping = state != LcmState::Epilog;
        if let Some(h) = vm.history_mut() {
            h.epilog_etime = t;
            h.etime = t;
            h.on_frontend = stopping;
        }
        self.del_capacity(vm.hid(), vid);
        self.update_history(&vm);
        self.update(&vm);
        drop(vm);

        match state {
            LcmState::EpilogStop => self.dm.stop_success(vid),
            LcmState::EpilogUndeploy => self.dm.undeploy_success(vid),
            _ => self.dm.done(vid),
        }
    }

    fn epilog_failure(&self, vid: ObjectId) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        let next = match vm.lcm_state() {
            LcmState::Epilog => LcmState::EpilogFailure,
            LcmState::EpilogStop => LcmState::EpilogStopFailure,
            LcmState::EpilogUndeploy => LcmState::EpilogUndeployFailure,
            _ => {
                self.wrong_state("epilog failure", &vm);
                return;
            }
        };
        vm.set_lcm_state(next);
        if let Some(h) = vm.history_mut() {
            h.epilog_etime = now();
        }
        self.update_history(&vm);
        self.update(&vm);
    }

    fn deploy_success(&self, vid: ObjectId, payload: &str) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        let t = now();
        match vm.lcm_state() {
            LcmState::Boot
            | LcmState::BootUnknown
            | LcmState::BootPoweroff
            | LcmState::BootSuspended
            | LcmState::BootStopped
            | LcmState::BootUndeploy
            | LcmState::BootMigrate => {
                let deploy_id = payload.trim();
                if !deploy_id.is_empty() && !deploy_id.starts_with('-') {
                    vm.deploy_id = Some(deploy_id.to_string());
                    self.pools.vms.insert_index(deploy_id, vid);
                }
                vm.set_lcm_state(LcmState::Running);
                vm.clear_template_error_message();
                if let Some(h) = vm.history_mut() {
                    if h.running_stime == 0 {
                        h.running_stime = t;
                    }
                }
                self.update_history(&vm);
                self.update(&vm);
            }
            LcmState::Migrate => {
                if let Some(prev) = vm.previous_history_mut() {
                    prev.running_etime = t;
                    prev.etime = t;
                }
                self.del_capacity(vm.previous_hid(), vid);
                vm.set_lcm_state(LcmState::Running);
                self.update_previous_history(&vm);
                self.update_history(&vm);
                self.update(&vm);
            }
            _ => self.wrong_state("deploy success", &vm),
        }
    }

    fn deploy_failure(&self, vid: ObjectId) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        let t = now();
        match vm.lcm_state() {
            LcmState::Migrate => {
                if let Some(h) = vm.history_mut() {
                    h.running_etime = t;
                    h.etime = t;
                }
                if let Some(prev) = vm.previous_history_mut() {
                    prev.etime = t;
                }
                self.update_history(&vm);
                self.update_previous_history(&vm);
                self.del_capacity(vm.hid(), vid);

                vm.cp_previous_history();
                if let Some(h) = vm.history_mut() {
                    h.stime = t;
                    h.running_stime = t;
                }
                vm.set_lcm_state(LcmState::Running);
                self.update_history(&vm);
                self.update(&vm);
            }
            LcmState::BootPoweroff => {
                if let Some(h) = vm.history_mut() {
                    h.running_etime = t;
                    h.etime = t;
                }
                self.update_history(&vm);
                drop(vm);
                self.dm.poweroff_success(vid);
            }
            LcmState::BootSuspended => {
                if let Some(h) = vm.history_mut() {
                    h.running_etime = t;
                    h.etime = t;
                }
                self.update_history(&vm);
                drop(vm);
                self.dm.suspend_success(vid);
            }
            state => {
                let next = match state {
                    LcmState::Boot => LcmState::BootFailure,
                    LcmState::BootMigrate => LcmState::BootMigrateFailure,
                    LcmState::BootUndeploy => LcmState::BootUndeployFailure,
                    LcmState::BootStopped => LcmState::BootStoppedFailure,
                    LcmState::BootUnknown => LcmState::Unknown,
                    _ => {
                        self.wrong_state("deploy failure", &vm);
                        return;
                    }
                };
                vm.set_lcm_state(next);
                self.update(&vm);
            }
        }
    }

    fn shutdown_success(&self, vid: ObjectId) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        let t = now();
        match vm.lcm_state() {
            LcmState::Shutdown => {
                vm.set_lcm_state(LcmState::Epilog);
                if let Some(h) = vm.history_mut() {
                    h.running_etime = t;
                    h.epilog_stime = t;
                }
                self.update_history(&vm);
                self.update(&vm);
                drop(vm);
                self.tm.trigger(vid, TransferOp::Epilog { local: false });
            }
            LcmState::ShutdownPoweroff => {
                if let Some(h) = vm.history_mut() {
                    h.running_etime = t;
                }
                self.update_history(&vm);
                drop(vm);
                self.dm.poweroff_success(vid);
            }
            LcmState::ShutdownUndeploy => {
                vm.set_lcm_state(LcmState::EpilogUndeploy);
                if let Some(h) = vm.history_mut() {
                    h.running_etime = t;
                    h.epilog_stime = t;
                }
                self.update_history(&vm);
                self.update(&vm);
                drop(vm);
                self.tm.trigger(vid, TransferOp::EpilogStop);
            }
            LcmState::SaveMigrate => {
                self.save_migrate_done(vm, LcmState::PrologMigratePoweroff);
            }
            _ => self.wrong_state("shutdown success", &vm),
        }
    }

    fn shutdown_failure(&self, vid: ObjectId) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        match vm.lcm_state() {
            LcmState::Shutdown
            | LcmState::ShutdownPoweroff
            | LcmState::ShutdownUndeploy => {
                vm.set_lcm_state(LcmState::Running);
                self.update(&vm);
            }
            LcmState::SaveMigrate => self.save_migrate_rollback(&mut vm),
            _ => self.wrong_state("shutdown failure", &vm),
        }
    }

    /// The VM left the source host: release it there and start moving its
    /// files to the target.
    fn save_migrate_done(
        &self,
        mut vm: PoolGuard<VirtualMachine>,
        next: LcmState,
    ) {
        let vid = vm.oid;
        let t = now();
        if let Some(prev) = vm.previous_history_mut() {
            prev.running_etime = t;
            prev.etime = t;
        }
        if let Some(h) = vm.history_mut() {
            h.prolog_stime = t;
        }
        self.del_capacity(vm.previous_hid(), vid);
        vm.set_lcm_state(next);
        self.update_previous_history(&vm);
        self.update_history(&vm);
        self.update(&vm);
        drop(vm);

        self.tm.trigger(vid, TransferOp::PrologMigrate);
    }

    /// The VM never left the source host: drop the target record and keep
    /// running where it was.
    fn save_migrate_rollback(&self, vm: &mut VirtualMachine) {
        let t = now();
        if let Some(h) = vm.history_mut() {
            h.etime = t;
        }
        if let Some(prev) = vm.previous_history_mut() {
            prev.running_etime = t;
            prev.etime = t;
        }
        self.update_history(vm);
        self.update_previous_history(vm);
        self.del_capacity(vm.hid(), vm.oid);

        vm.cp_previous_history();
        if let Some(h) = vm.history_mut() {
            h.stime = t;
            h.running_stime = t;
        }
        vm.set_lcm_state(LcmState::Running);
        self.update_history(vm);
        self.update(vm);
    }

    fn save_success(&self, vid: ObjectId) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        let t = now();
        match vm.lcm_state() {
            LcmState::SaveMigrate => self.save_migrate_done(vm, LcmState::PrologMigrate),
            LcmState::SaveSuspend => {
                if let Some(h) = vm.history_mut() {
                    h.running_etime = t;
                }
                self.update_history(&vm);
                drop(vm);
                self.dm.suspend_success(vid);
            }
            LcmState::SaveStop => {
                vm.set_lcm_state(LcmState::EpilogStop);
                if let Some(h) = vm.history_mut() {
                    h.running_etime = t;
                    h.epilog_stime = t;
                }
                self.update_history(&vm);
                self.update(&vm);
                drop(vm);
                self.tm.trigger(vid, TransferOp::EpilogStop);
            }
            _ => self.wrong_state("save success", &vm),
        }
    }

    fn save_failure(&self, vid: ObjectId) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        match vm.lcm_state() {
            LcmState::SaveMigrate => self.save_migrate_rollback(&mut vm),
            LcmState::SaveSuspend | LcmState::SaveStop => {
                vm.set_lcm_state(LcmState::Running);
                self.update(&vm);
            }
            _ => self.wrong_state("save failure", &vm),
        }
    }

    fn attach_done(&self, vid: ObjectId, success: bool) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        let back = match vm.lcm_state() {
            LcmState::Hotplug => VmState::Active,
            LcmState::HotplugPrologPoweroff => VmState::Poweroff,
            _ => {
                self.wrong_state("attach", &vm);
                return;
            }
        };
        let removed = if success {
            vm.clear_disk_pending(PendingOp::Attach);
            None
        } else {
            vm.take_pending_disk(PendingOp::Attach)
        };
        settle(&mut vm, back);
        self.update(&vm);
        let (uid, gid) = (vm.uid, vm.gid);
        drop(vm);

        if let Some(disk) = removed {
            self.release_disk(uid, gid, vid, &disk);
        }
    }

    /// Returns a disk that left the VM: its image and its datastore usage.
    fn release_disk(&self, uid: ObjectId, gid: ObjectId, vid: ObjectId, disk: &VirtualMachineDisk) {
        resources::release_disk_image(&self.pools, vid, disk, false, &self.log);
        if let Some((ds_id, size)) = resources::disk_ds_usage(disk) {
            self.quotas.ds_add(uid, gid, ds_id, -(size as i64));
        }
    }

    fn detach_done(&self, vid: ObjectId, success: bool) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        let back = match vm.lcm_state() {
            LcmState::Hotplug => VmState::Active,
            LcmState::HotplugEpilogPoweroff => VmState::Poweroff,
            _ => {
                self.wrong_state("detach", &vm);
                return;
            }
        };
        let removed = if success {
            vm.take_pending_disk(PendingOp::Detach)
        } else {
            vm.clear_disk_pending(PendingOp::Detach);
            None
        };
        settle(&mut vm, back);
        self.update(&vm);
        let (uid, gid) = (vm.uid, vm.gid);
        drop(vm);

        if let Some(disk) = removed {
            self.release_disk(uid, gid, vid, &disk);
        }
    }

    fn nic_back_state(&self, vm: &VirtualMachine, event: &str) -> Option<VmState> {
        match vm.lcm_state() {
            LcmState::HotplugNic => Some(VmState::Active),
            LcmState::HotplugNicPoweroff => Some(VmState::Poweroff),
            _ => {
                self.wrong_state(event, vm);
                None
            }
        }
    }

    fn attach_nic_done(&self, vid: ObjectId, success: bool) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        let Some(back) = self.nic_back_state(&vm, "attach nic") else {
            return;
        };
        let removed = if success {
            vm.clear_nic_pending(PendingOp::Attach);
            None
        } else {
            vm.take_pending_nic(PendingOp::Attach)
        };
        self.finish_nic(vm, back, removed);
    }

    fn detach_nic_done(&self, vid: ObjectId, success: bool) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        let Some(back) = self.nic_back_state(&vm, "detach nic") else {
            return;
        };
        let removed = if success {
            vm.take_pending_nic(PendingOp::Detach)
        } else {
            vm.clear_nic_pending(PendingOp::Detach);
            None
        };
        self.finish_nic(vm, back, removed);
    }

    /// Settles a NIC hotplug and, if a NIC left the VM, returns its lease
    /// and drops the VM from groups no other NIC references.
    fn finish_nic(
        &self,
        mut vm: PoolGuard<VirtualMachine>,
        back: VmState,
        removed: Option<VirtualMachineNic>,
    ) {
        let vid = vm.oid;
        let mut orphaned = Vec::new();
        if let Some(nic) = &removed {
            let still_used = vm.security_groups();
            for sgid in nic.security_groups() {
                if !still_used.contains(&sgid) {
                    vm.remove_sg_rules(sgid);
                    orphaned.push(sgid);
                }
            }
        }
        settle(&mut vm, back);
        self.update(&vm);
        drop(vm);

        if let Some(nic) = removed {
            resources::release_nic(&self.pools, vid, &nic, &self.log);
            resources::leave_security_groups(&self.pools, vid, &orphaned, &self.log);
        }
    }

    fn snapshot_done(&self, vid: ObjectId, op: SnapshotOp, success: bool, payload: &str) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        if vm.lcm_state() != LcmState::HotplugSnapshot {
            self.wrong_state("snapshot", &vm);
            return;
        }
        match (op, success) {
            (SnapshotOp::Create, true) => {
                let hypervisor_id = payload.trim().to_string();
                if let Some(snap) = vm.snapshots.iter_mut().find(|s| s.pending.is_some()) {
                    if !hypervisor_id.is_empty() && !hypervisor_id.starts_with('-') {
                        snap.hypervisor_id = hypervisor_id;
                    }
                }
                vm.clear_snapshot_pending();
            }
            (SnapshotOp::Create, false) | (SnapshotOp::Delete, true) => {
                vm.remove_pending_snapshot();
            }
            _ => vm.clear_snapshot_pending(),
        }
        vm.set_lcm_state(LcmState::Running);
        self.update(&vm);
    }

    fn disk_snapshot_done(&self, vid: ObjectId, success: bool) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        use LcmState::*;
        let state = vm.lcm_state();
        let (op, back) = match state {
            DiskSnapshot => (SnapshotOp::Create, VmState::Active),
            DiskSnapshotDelete => (SnapshotOp::Delete, VmState::Active),
            DiskSnapshotPoweroff => (SnapshotOp::Create, VmState::Poweroff),
            DiskSnapshotRevertPoweroff => (SnapshotOp::Revert, VmState::Poweroff),
            DiskSnapshotDeletePoweroff => (SnapshotOp::Delete, VmState::Poweroff),
            DiskSnapshotSuspended => (SnapshotOp::Create, VmState::Suspended),
            DiskSnapshotRevertSuspended => (SnapshotOp::Revert, VmState::Suspended),
            DiskSnapshotDeleteSuspended => (SnapshotOp::Delete, VmState::Suspended),
            _ => {
                self.wrong_state("disk snapshot", &vm);
                return;
            }
        };

        let Some((disk_id, snap_id)) = vm.snapshot_disk() else {
            error!(self.log, "no disk snapshot in progress"; "vm_id" => vid);
            settle(&mut vm, back);
            self.update(&vm);
            return;
        };

        let mut released = None;
        if let Some(disk) = vm.disk_mut(disk_id) {
            let ds_id = disk.datastore_id();
            match (op, success) {
                (SnapshotOp::Create, false) | (SnapshotOp::Delete, true) => {
                    if let (Some(size), Some(ds_id)) = (disk.snapshots.delete(snap_id), ds_id) {
                        released = Some((ds_id, size));
                    }
                }
                (SnapshotOp::Revert, true) => {
                    disk.snapshots.revert(snap_id);
                }
                _ => {}
            }
        }
        vm.clear_disk_pending(PendingOp::Snapshot);
        settle(&mut vm, back);
        let (uid, gid) = (vm.uid, vm.gid);
        self.update(&vm);
        drop(vm);

        if let Some((ds_id, size)) = released {
            self.quotas.ds_add(uid, gid, ds_id, -(size as i64));
        }
    }

    fn disk_resize_done(&self, vid: ObjectId, success: bool) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        let back = match vm.lcm_state() {
            LcmState::DiskResize => VmState::Active,
            LcmState::DiskResizePoweroff => VmState::Poweroff,
            LcmState::DiskResizeUndeployed => VmState::Undeployed,
            _ => {
                self.wrong_state("disk resize", &vm);
                return;
            }
        };
        let resized = vm.end_disk_resize(!success);
        let ds_id = resized
            .and_then(|(id, _, _)| vm.disk(id))
            .and_then(|d| d.datastore_id());
        settle(&mut vm, back);
        let (uid, gid) = (vm.uid, vm.gid);
        self.update(&vm);
        drop(vm);

        if let (false, Some((_, old, new)), Some(ds_id)) = (success, resized, ds_id) {
            self.quotas.ds_add(uid, gid, ds_id, old as i64 - new as i64);
        }
    }

    fn disk_restore_done(&self, vid: ObjectId, success: bool) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        if vm.lcm_state() != LcmState::Restore {
            self.wrong_state("restore", &vm);
            return;
        }
        if !success {
            warn!(self.log, "backup restore failed"; "vm_id" => vid);
        }
        vm.backups.pending_restore = None;
        settle(&mut vm, VmState::Poweroff);
        self.update(&vm);
    }

    fn saveas_done(&self, vid: ObjectId, success: bool) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        let back = match vm.lcm_state() {
            LcmState::HotplugSaveas => VmState::Active,
            LcmState::HotplugSaveasPoweroff => VmState::Poweroff,
            LcmState::HotplugSaveasSuspended => VmState::Suspended,
            LcmState::HotplugSaveasUndeployed => VmState::Undeployed,
            LcmState::HotplugSaveasStopped => VmState::Stopped,
            _ => {
                self.wrong_state("saveas", &vm);
                return;
            }
        };
        let req = vm.saveas_disk();
        vm.clear_disk_pending(PendingOp::SaveAs);
        settle(&mut vm, back);
        self.update(&vm);
        drop(vm);

        let Some(req) = req else {
            return;
        };
        if !success {
            self.abandon_saveas(vid, &req);
            return;
        }
        let Some(mut image) = self.pools.images.get(req.image_id) else {
            warn!(self.log, "saved image is gone"; "vm_id" => vid,
                "image_id" => req.image_id);
            return;
        };
        image.state = ImageState::Ready;
        if let Err(e) = self.pools.images.update(&image) {
            error!(self.log, "failed to persist image"; "image_id" => image.oid,
                "error" => %e);
        }
    }

    /// Marks the target image of a save-as that will never complete as
    /// failed and returns the datastore usage charged for it. Call without
    /// holding the VM guard.
    pub(super) fn abandon_saveas(&self, vid: ObjectId, req: &SaveAsRequest) {
        let Some(mut image) = self.pools.images.get(req.image_id) else {
            warn!(self.log, "saved image is gone"; "vm_id" => vid,
                "image_id" => req.image_id);
            return;
        };
        image.state = ImageState::Error;
        if let Err(e) = self.pools.images.update(&image) {
            error!(self.log, "failed to persist image"; "image_id" => image.oid,
                "error" => %e);
        }
        let (uid, gid, ds_id, size) = (image.uid, image.gid, image.datastore_id, image.size);
        drop(image);

        self.quotas.ds_add(uid, gid, ds_id, -(size as i64));
    }

    fn backup_done(&self, vid: ObjectId, success: bool, payload: &str) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        let back = match vm.lcm_state() {
            LcmState::Backup => VmState::Active,
            LcmState::BackupPoweroff => VmState::Poweroff,
            _ => {
                self.wrong_state("backup", &vm);
                return;
            }
        };
        let mut charged = None;
        let mut flatten = None;
        if success {
            let mut parts = payload.split_whitespace();
            let source = parts.next().unwrap_or_default().to_string();
            let size: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            match self.store_backup(&mut vm, source, size) {
                Some((image_id, chain_len)) => {
                    charged = vm.backups.backup_ds_id.map(|ds| (ds, size));
                    info!(self.log, "backup stored"; "vm_id" => vid,
                        "image_id" => image_id, "size" => size);
                    if vm.backups.excess(chain_len) > 0 {
                        vm.backups.active_flatten = true;
                        flatten = Some(image_id);
                    }
                }
                None => warn!(self.log, "backup could not be registered";
                    "vm_id" => vid),
            }
        }
        settle(&mut vm, back);
        let (uid, gid) = (vm.uid, vm.gid);
        self.update(&vm);
        drop(vm);

        if let Some((ds_id, size)) = charged {
            self.quotas.ds_add(uid, gid, ds_id, size as i64);
        }
        if let Some(image_id) = flatten {
            self.handle_self().trigger(LcmAction::FlattenBackup { vid, image_id });
        }
    }

    /// Merges the oldest increments of the chain beyond the VM's keep-last
    /// limit. New backups are refused until this clears `active_flatten`.
    pub(super) fn flatten_backup(&self, vid: ObjectId, image_id: ObjectId) {
        let Some(vm) = self.get_vm(vid) else {
            return;
        };
        let backups = vm.backups.clone();
        drop(vm);

        match self.pools.images.get(image_id) {
            Some(mut image) => {
                let count = backups.excess(image.increments.len());
                image.flatten(count);
                if let Err(e) = self.pools.images.update(&image) {
                    error!(self.log, "failed to persist image"; "image_id" => image_id,
                        "error" => %e);
                }
                info!(self.log, "backup chain flattened"; "vm_id" => vid,
                    "image_id" => image_id, "merged" => count);
            }
            None => warn!(self.log, "backup image is gone"; "vm_id" => vid,
                "image_id" => image_id),
        }

        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        vm.backups.active_flatten = false;
        self.update(&vm);
    }

    /// Records a finished backup, either as a new backup image or as the
    /// next increment of the current chain.
    fn store_backup(
        &self,
        vm: &mut VirtualMachine,
        source: String,
        size: u64,
    ) -> Option<(ObjectId, usize)> {
        let ds_id = vm.backups.backup_ds_id?;
        let chain = u32::try_from(vm.backups.incremental_backup_id).ok();

        if let (true, Some(image_id)) = (vm.backups.incremental, chain) {
            if let Some(mut image) = self.pools.images.get(image_id) {
                let id = image.increments.last().map_or(0, |i| i.id + 1);
                image.increments.push(BackupIncrement { id, source, size });
                image.size += size;
                if let Err(e) = self.pools.images.update(&image) {
                    error!(self.log, "failed to persist image"; "image_id" => image_id,
                        "error" => %e);
                }
                vm.backups.last_increment_id = id;
                vm.backups.last_backup_id = Some(image_id);
                vm.backups.last_backup_size = size;
                return Some((image_id, image.increments.len()));
            }
        }

        let image = Image {
            uid: vm.uid,
            gid: vm.gid,
            name: format!("{} {}-backup", vm.oid, now()),
            datastore_id: ds_id,
            source: source.clone(),
            image_type: ImageType::Backup,
            state: ImageState::Ready,
            size,
            increments: vec![BackupIncrement { id: 0, source, size }],
            ..Default::default()
        };
        let image_id = match self.pools.images.allocate(image) {
            Ok(id) => id,
            Err(e) => {
                error!(self.log, "could not allocate backup image"; "vm_id" => vm.oid,
                    "error" => %e);
                return None;
            }
        };
        if vm.backups.incremental {
            vm.backups.incremental_backup_id = i64::from(image_id);
            vm.backups.last_increment_id = 0;
        }
        vm.backups.last_backup_id = Some(image_id);
        vm.backups.last_backup_size = size;
        Some((image_id, 1))
    }

    fn resize_done(&self, vid: ObjectId, success: bool) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        if vm.lcm_state() != LcmState::HotplugResize {
            self.wrong_state("resize", &vm);
            return;
        }
        let Some(pending) = vm.pending_resize.take() else {
            vm.set_lcm_state(LcmState::Running);
            self.update(&vm);
            return;
        };
        let (uid, gid) = (vm.uid, vm.gid);
        let delta = VmUsage {
            cpu: pending.cpu - vm.cpu,
            memory: pending.memory as i64 - vm.memory as i64,
            running_cpu: pending.cpu - vm.cpu,
            running_memory: pending.memory as i64 - vm.memory as i64,
            ..Default::default()
        };

        if success {
            if let Some(hid) = vm.hid() {
                let cpu_delta = (pending.cpu * 100.0).round() as i64
                    - (vm.cpu * 100.0).round() as i64;
                let mem_delta = (pending.memory as i64 - vm.memory as i64) * 1024;
                if let Err(e) = self.pools.hosts.update_capacity(hid, vid, cpu_delta, mem_delta) {
                    error!(self.log, "could not update host capacity"; "vm_id" => vid,
                        "error" => %e);
                }
            }
            vm.cpu = pending.cpu;
            vm.vcpu = pending.vcpu;
            vm.memory = pending.memory;
        }
        vm.set_lcm_state(LcmState::Running);
        self.update(&vm);
        drop(vm);

        if !success {
            self.quotas.vm_add(uid, gid, &delta.negate());
        }
    }

    fn update_conf_done(&self, vid: ObjectId, success: bool) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        if vm.lcm_state() != LcmState::Hotplug {
            self.wrong_state("update conf", &vm);
            return;
        }
        if !success {
            warn!(self.log, "configuration update failed"; "vm_id" => vid);
        }
        vm.set_lcm_state(LcmState::Running);
        self.update(&vm);
    }

    fn cleanup_callback(&self, vid: ObjectId) {
        let Some(vm) = self.get_vm(vid) else {
            return;
        };
        if vm.lcm_state() == LcmState::CleanupResubmit {
            drop(vm);
            self.dm.resubmit(vid);
        } else {
            info!(self.log, "cleanup finished"; "vm_id" => vid,
                "state" => vm.state_str());
        }
    }
}
