// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Triggers started by the dispatch manager and by monitoring.

use nimbus_types::{HistoryReason, LcmState, ObjectId, VmAction, VmState};
use slog::info;

use super::cleanup::Abandoned;
use super::{DriverStep, LifeCycleManager};
use crate::tm::TransferOp;
use crate::vmm::VmmOp;
use crate::{now, RequestAttributes};

impl LifeCycleManager {
    pub(super) fn deploy_action(&self, vid: ObjectId, _ra: &RequestAttributes) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        if vm.state() != VmState::Active {
            self.wrong_state("deploy", &vm);
            return;
        }

        let resume = match vm.previous_history().map(|h| h.action) {
            Some(VmAction::Stop) => Some(LcmState::PrologResume),
            Some(VmAction::Undeploy | VmAction::UndeployHard) => {
                Some(LcmState::PrologUndeploy)
            }
            _ => None,
        };
        vm.set_lcm_state(resume.unwrap_or(LcmState::Prolog));

        let t = now();
        if let Some(h) = vm.history_mut() {
            h.prolog_stime = t;
        }
        self.update_history(&vm);

        let reserved = self.add_capacity(&vm);
        self.update(&vm);
        drop(vm);

        if !reserved {
            self.handle_self().failure(DriverStep::Prolog, vid);
            return;
        }
        let op = if resume.is_some() {
            TransferOp::PrologResume
        } else {
            TransferOp::Prolog
        };
        self.tm.trigger(vid, op);
    }

    pub(super) fn suspend_action(&self, vid: ObjectId, ra: &RequestAttributes) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        if vm.state() != VmState::Active
            || !matches!(vm.lcm_state(), LcmState::Running | LcmState::Unknown)
        {
            self.wrong_state("suspend", &vm);
            return;
        }
        vm.set_lcm_state(LcmState::SaveSuspend);
        vm.resched = false;
        Self::set_action(&mut vm, VmAction::Suspend, ra);
        self.update_history(&vm);
        self.update(&vm);
        drop(vm);

        self.vmm.trigger(vid, VmmOp::Save);
    }

    pub(super) fn stop_action(&self, vid: ObjectId, ra: &RequestAttributes) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        let t = now();
        match (vm.state(), vm.lcm_state()) {
            (VmState::Active, LcmState::Running | LcmState::Unknown) => {
                vm.set_lcm_state(LcmState::SaveStop);
                vm.resched = false;
                Self::set_action(&mut vm, VmAction::Stop, ra);
                self.update_history(&vm);
                self.update(&vm);
                drop(vm);
                self.vmm.trigger(vid, VmmOp::Save);
            }
            (VmState::Suspended, _) => {
                vm.set_state(VmState::Active);
                vm.set_lcm_state(LcmState::EpilogStop);
                Self::set_action(&mut vm, VmAction::Stop, ra);
                if let Some(h) = vm.history_mut() {
                    h.epilog_stime = t;
                }
                self.update_history(&vm);
                self.update(&vm);
                drop(vm);
                self.tm.trigger(vid, TransferOp::EpilogStop);
            }
            _ => self.wrong_state("stop", &vm),
        }
    }

    /// Cold migration to the host of the current history record. The
    /// dispatch manager has already opened that record.
    pub(super) fn migrate_action(
        &self,
        vid: ObjectId,
        ra: &RequestAttributes,
        action: VmAction,
    ) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        let t = now();

        let prolog_state = match (vm.state(), vm.lcm_state()) {
            (VmState::Active, LcmState::Running) => None,
            (VmState::Active, LcmState::Unknown) => Some(LcmState::PrologMigrateUnknown),
            (VmState::Poweroff, _) => Some(LcmState::PrologMigratePoweroff),
            (VmState::Suspended, _) => Some(LcmState::PrologMigrateSuspend),
            _ => {
                self.wrong_state("migrate", &vm);
                return;
            }
        };

        vm.resched = false;
        if let Some(h) = vm.history_mut() {
            h.stime = t;
        }
        if let Some(prev) = vm.previous_history_mut() {
            prev.action = action;
            prev.uid = ra.uid;
            prev.gid = ra.gid;
            prev.req_id = ra.req_id;
            prev.running_etime = t;
        }

        let Some(lcm_state) = prolog_state else {
            vm.set_lcm_state(LcmState::SaveMigrate);
            self.add_capacity(&vm);
            self.update_history(&vm);
            self.update_previous_history(&vm);
            self.update(&vm);
            drop(vm);

            let op = match action {
                VmAction::PoffMigrate => VmmOp::Shutdown,
                VmAction::PoffHardMigrate => VmmOp::Cancel,
                _ => VmmOp::Save,
            };
            self.vmm.trigger(vid, op);
            return;
        };

        if lcm_state == LcmState::PrologMigrateUnknown {
            // No checkpoint was taken: the VM boots from its disks.
            if let Some(prev) = vm.previous_history_mut() {
                prev.reason = HistoryReason::Error;
            }
        }
        vm.set_state(VmState::Active);
        vm.set_lcm_state(lcm_state);
        let vmm_mad = vm.history().map(|h| h.vmm_mad.clone()).unwrap_or_default();
        if !self.config.vmm_driver(&vmm_mad).keep_snapshots {
            vm.delete_snapshots();
        }
        if let Some(prev) = vm.previous_history_mut() {
            prev.etime = t;
        }
        if let Some(h) = vm.history_mut() {
            h.prolog_stime = t;
        }

        self.del_capacity(vm.previous_hid(), vid);
        self.add_capacity(&vm);

        self.update_history(&vm);
        self.update_previous_history(&vm);
        self.update(&vm);
        drop(vm);

        self.tm.trigger(vid, TransferOp::PrologMigrate);
    }

    pub(super) fn live_migrate_action(&self, vid: ObjectId, ra: &RequestAttributes) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        if vm.state() != VmState::Active || vm.lcm_state() != LcmState::Running {
            self.wrong_state("live migrate", &vm);
            return;
        }
        let t = now();
        vm.set_lcm_state(LcmState::Migrate);
        vm.resched = false;
        if let Some(h) = vm.history_mut() {
            h.stime = t;
            h.running_stime = t;
        }
        if let Some(prev) = vm.previous_history_mut() {
            prev.action = VmAction::LiveMigrate;
            prev.uid = ra.uid;
            prev.gid = ra.gid;
            prev.req_id = ra.req_id;
        }
        self.add_capacity(&vm);
        self.update_history(&vm);
        self.update_previous_history(&vm);
        self.update(&vm);
        drop(vm);

        self.vmm.trigger(vid, VmmOp::Migrate);
    }

    pub(super) fn shutdown_action(&self, vid: ObjectId, hard: bool, ra: &RequestAttributes) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        let t = now();
        let action = if hard { VmAction::TerminateHard } else { VmAction::Terminate };
        let (uid, gid, cpu, memory) = (vm.uid, vm.gid, vm.cpu, vm.memory);

        match (vm.state(), vm.lcm_state()) {
            (VmState::Active, LcmState::Running | LcmState::Unknown) => {
                vm.set_lcm_state(LcmState::Shutdown);
                Self::set_action(&mut vm, action, ra);
                self.update_history(&vm);
                self.update(&vm);
                drop(vm);
                self.vmm.trigger(vid, if hard { VmmOp::Cancel } else { VmmOp::Shutdown });
            }
            (VmState::Active, LcmState::Shutdown) if hard => {
                Self::set_action(&mut vm, action, ra);
                self.update_history(&vm);
                drop(vm);
                info!(self.log, "cancelling soft shutdown in progress"; "vm_id" => vid);
                self.vmm.trigger(vid, VmmOp::DriverCancel);
                self.vmm.trigger(vid, VmmOp::Cancel);
            }
            (state @ (VmState::Suspended | VmState::Poweroff), _) => {
                vm.set_state(VmState::Active);
                vm.set_lcm_state(LcmState::Epilog);
                Self::set_action(&mut vm, action, ra);
                if let Some(h) = vm.history_mut() {
                    h.running_etime = t;
                    h.epilog_stime = t;
                }
                self.update_history(&vm);
                self.update(&vm);
                drop(vm);
                if state == VmState::Poweroff {
                    self.restore_running_quota(uid, gid, cpu, memory);
                }
                self.tm.trigger(vid, TransferOp::Epilog { local: false });
            }
            (VmState::Stopped | VmState::Undeployed, _) => {
                vm.set_state(VmState::Active);
                vm.set_lcm_state(LcmState::Epilog);
                Self::set_action(&mut vm, action, ra);
                if let Some(h) = vm.history_mut() {
                    h.epilog_stime = t;
                }
                self.update_history(&vm);
                self.update(&vm);
                drop(vm);
                self.restore_running_quota(uid, gid, cpu, memory);
                self.tm.trigger(vid, TransferOp::Epilog { local: true });
            }
            _ => self.wrong_state("shutdown", &vm),
        }
    }

    pub(super) fn undeploy_action(&self, vid: ObjectId, hard: bool, ra: &RequestAttributes) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        let t = now();
        let action = if hard { VmAction::UndeployHard } else { VmAction::Undeploy };
        let (uid, gid, cpu, memory) = (vm.uid, vm.gid, vm.cpu, vm.memory);

        match (vm.state(), vm.lcm_state()) {
            (VmState::Active, LcmState::Running | LcmState::Unknown) => {
                vm.set_lcm_state(LcmState::ShutdownUndeploy);
                vm.resched = false;
                Self::set_action(&mut vm, action, ra);
                self.update_history(&vm);
                self.update(&vm);
                drop(vm);
                self.vmm.trigger(vid, if hard { VmmOp::Cancel } else { VmmOp::Shutdown });
            }
            (VmState::Poweroff, _) => {
                vm.set_state(VmState::Active);
                vm.set_lcm_state(LcmState::EpilogUndeploy);
                vm.resched = false;
                Self::set_action(&mut vm, action, ra);
                if let Some(h) = vm.history_mut() {
                    h.running_etime = t;
                    h.epilog_stime = t;
                }
                self.update_history(&vm);
                self.update(&vm);
                drop(vm);
                self.restore_running_quota(uid, gid, cpu, memory);
                self.tm.trigger(vid, TransferOp::EpilogStop);
            }
            _ => self.wrong_state("undeploy", &vm),
        }
    }

    pub(super) fn poweroff_action(&self, vid: ObjectId, hard: bool, ra: &RequestAttributes) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        if vm.state() != VmState::Active
            || !matches!(vm.lcm_state(), LcmState::Running | LcmState::Unknown)
        {
            self.wrong_state("poweroff", &vm);
            return;
        }
        vm.set_lcm_state(LcmState::ShutdownPoweroff);
        vm.resched = false;
        let action = if hard { VmAction::PoweroffHard } else { VmAction::Poweroff };
        Self::set_action(&mut vm, action, ra);
        self.update_history(&vm);
        self.update(&vm);
        drop(vm);

        self.vmm.trigger(vid, if hard { VmmOp::Cancel } else { VmmOp::Shutdown });
    }

    /// Resumes a suspended VM from its checkpoint.
    pub(super) fn restore_action(&self, vid: ObjectId, ra: &RequestAttributes) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        if vm.state() != VmState::Suspended {
            self.wrong_state("restore", &vm);
            return;
        }
        let t = now();
        Self::set_action(&mut vm, VmAction::Resume, ra);
        self.update_history(&vm);

        vm.set_state(VmState::Active);
        vm.set_lcm_state(LcmState::BootSuspended);
        vm.cp_history();
        if let Some(h) = vm.history_mut() {
            h.stime = t;
            h.running_stime = t;
        }
        self.update_history(&vm);
        self.update(&vm);
        drop(vm);

        self.vmm.trigger(vid, VmmOp::Restore);
    }

    /// Boots a VM again on the same host: from POWEROFF, or after the VM
    /// went missing (UNKNOWN) or a boot failed.
    pub(super) fn restart_action(&self, vid: ObjectId, ra: &RequestAttributes) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        let t = now();

        if vm.state() == VmState::Poweroff {
            Self::set_action(&mut vm, VmAction::Resume, ra);
            self.update_history(&vm);
            vm.set_state(VmState::Active);
            vm.set_lcm_state(LcmState::BootPoweroff);
            vm.cp_history();
            if let Some(h) = vm.history_mut() {
                h.stime = t;
                h.running_stime = t;
            }
            self.update_history(&vm);
            self.update(&vm);
            drop(vm);
            self.vmm.trigger(vid, VmmOp::Deploy);
            return;
        }

        if vm.state() != VmState::Active {
            self.wrong_state("restart", &vm);
            return;
        }
        let next = match vm.lcm_state() {
            LcmState::Unknown => LcmState::BootUnknown,
            LcmState::BootFailure => LcmState::Boot,
            LcmState::BootMigrateFailure => LcmState::BootMigrate,
            LcmState::BootUndeployFailure => LcmState::BootUndeploy,
            LcmState::BootStoppedFailure => LcmState::BootStopped,
            s @ (LcmState::Boot
            | LcmState::BootUnknown
            | LcmState::BootPoweroff
            | LcmState::BootSuspended
            | LcmState::BootStopped
            | LcmState::BootUndeploy
            | LcmState::BootMigrate) => s,
            _ => {
                self.wrong_state("restart", &vm);
                return;
            }
        };
        vm.set_lcm_state(next);
        vm.resched = false;
        self.update(&vm);
        drop(vm);

        self.vmm.trigger(vid, VmmOp::Deploy);
    }

    pub(super) fn delete_action(&self, vid: ObjectId, ra: &RequestAttributes) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        if vm.state() != VmState::Active {
            self.wrong_state("delete", &vm);
            return;
        }
        Self::set_action(&mut vm, VmAction::Delete, ra);
        let abandoned = Abandoned::take(&mut vm);
        self.clean_up_vm(&mut vm, true);
        self.update_history(&vm);
        self.update(&vm);
        drop(vm);

        self.refund(vid, abandoned);
        self.dm.done(vid);
    }

    pub(super) fn delete_recreate_action(&self, vid: ObjectId, ra: &RequestAttributes) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        if vm.state() != VmState::Active {
            self.wrong_state("delete-recreate", &vm);
            return;
        }
        Self::set_action(&mut vm, VmAction::DeleteRecreate, ra);
        let abandoned = Abandoned::take(&mut vm);
        self.clean_up_vm(&mut vm, false);
        self.update_history(&vm);
        self.update(&vm);
        drop(vm);

        // Back in PENDING the VM counts as running.
        self.refund(vid, abandoned);
    }

    pub(super) fn monitor_unknown(&self, vid: ObjectId) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        if vm.state() != VmState::Active || vm.lcm_state() != LcmState::Running {
            return;
        }
        vm.set_lcm_state(LcmState::Unknown);
        self.update(&vm);
        info!(self.log, "VM is not reachable"; "vm_id" => vid);
    }

    /// The hypervisor reports the VM powered off without being asked to.
    pub(super) fn monitor_poweroff(&self, vid: ObjectId) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        if vm.state() != VmState::Active {
            return;
        }
        match vm.lcm_state() {
            LcmState::Running | LcmState::Unknown => {
                vm.set_lcm_state(LcmState::ShutdownPoweroff);
                vm.resched = false;
                if let Some(h) = vm.history_mut() {
                    h.running_etime = now();
                }
                self.update_history(&vm);
                self.update(&vm);
                drop(vm);
                self.dm.poweroff_success(vid);
            }
            LcmState::Shutdown
            | LcmState::ShutdownPoweroff
            | LcmState::ShutdownUndeploy => {
                drop(vm);
                self.handle_self().success(DriverStep::Shutdown, vid);
            }
            _ => {}
        }
    }

    pub(super) fn monitor_running(&self, vid: ObjectId) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        match (vm.state(), vm.lcm_state()) {
            (VmState::Active, LcmState::Unknown) => {
                vm.set_lcm_state(LcmState::Running);
                self.update(&vm);
            }
            (VmState::Poweroff, _) => {
                let t = now();
                let (uid, gid, cpu, memory) = (vm.uid, vm.gid, vm.cpu, vm.memory);
                vm.set_state(VmState::Active);
                vm.set_lcm_state(LcmState::Running);
                vm.cp_history();
                if let Some(h) = vm.history_mut() {
                    h.stime = t;
                    h.running_stime = t;
                }
                self.update_history(&vm);
                self.update(&vm);
                drop(vm);
                self.restore_running_quota(uid, gid, cpu, memory);
            }
            _ => {}
        }
    }
}
