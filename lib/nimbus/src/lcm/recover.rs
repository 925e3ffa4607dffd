// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operator recovery: forcing the outcome of a stuck operation, or running
//! it again.

use nimbus_types::{
    HistoryReason, LcmState, ObjectId, PendingOp, SnapshotOp, VirtualMachine, VmAction,
};
use slog::{info, warn};

use super::{DriverStep, LcmAction, LifeCycleManager};
use crate::tm::TransferOp;
use crate::vmm::VmmOp;
use crate::RequestAttributes;

/// The in-flight state a `*_FAILURE` state came from.
fn in_flight(state: LcmState) -> LcmState {
    use LcmState::*;
    match state {
        PrologFailure => Prolog,
        PrologResumeFailure => PrologResume,
        PrologUndeployFailure => PrologUndeploy,
        PrologMigrateFailure => PrologMigrate,
        PrologMigratePoweroffFailure => PrologMigratePoweroff,
        PrologMigrateSuspendFailure => PrologMigrateSuspend,
        PrologMigrateUnknownFailure => PrologMigrateUnknown,
        EpilogFailure => Epilog,
        EpilogStopFailure => EpilogStop,
        EpilogUndeployFailure => EpilogUndeploy,
        BootFailure => Boot,
        BootMigrateFailure => BootMigrate,
        BootUndeployFailure => BootUndeploy,
        BootStoppedFailure => BootStopped,
        other => other,
    }
}

/// The driver step whose completion moves a VM out of `state`. `None` for
/// states no driver operation is pending on.
fn pending_step(vm: &VirtualMachine, state: LcmState) -> Option<DriverStep> {
    use LcmState::*;
    let step = match state {
        LcmInit | Running | Unknown | CleanupDelete | CleanupResubmit => return None,

        Prolog | PrologResume | PrologUndeploy | PrologMigrate
        | PrologMigratePoweroff | PrologMigrateSuspend | PrologMigrateUnknown
        | PrologFailure | PrologResumeFailure | PrologUndeployFailure
        | PrologMigrateFailure | PrologMigratePoweroffFailure
        | PrologMigrateSuspendFailure | PrologMigrateUnknownFailure => {
            DriverStep::Prolog
        }

        Epilog | EpilogStop | EpilogUndeploy | EpilogFailure
        | EpilogStopFailure | EpilogUndeployFailure => DriverStep::Epilog,

        Boot | BootUnknown | BootPoweroff | BootSuspended | BootStopped
        | BootUndeploy | BootMigrate | Migrate | BootFailure
        | BootMigrateFailure | BootUndeployFailure | BootStoppedFailure => {
            DriverStep::Deploy
        }

        Shutdown | ShutdownPoweroff | ShutdownUndeploy => DriverStep::Shutdown,
        SaveMigrate if powers_off(migration_action(vm)) => DriverStep::Shutdown,
        SaveStop | SaveSuspend | SaveMigrate => DriverStep::Save,

        Hotplug => {
            if vm.pending_disk(PendingOp::Attach).is_some() {
                DriverStep::Attach
            } else if vm.pending_disk(PendingOp::Detach).is_some() {
                DriverStep::Detach
            } else {
                DriverStep::UpdateConf
            }
        }
        HotplugPrologPoweroff => DriverStep::Attach,
        HotplugEpilogPoweroff => DriverStep::Detach,
        HotplugNic | HotplugNicPoweroff => {
            if vm.pending_nic(PendingOp::Attach).is_some() {
                DriverStep::AttachNic
            } else {
                DriverStep::DetachNic
            }
        }
        HotplugSnapshot => match vm.pending_snapshot().and_then(|s| s.pending) {
            Some(SnapshotOp::Revert) => DriverStep::SnapshotRevert,
            Some(SnapshotOp::Delete) => DriverStep::SnapshotDelete,
            _ => DriverStep::SnapshotCreate,
        },
        HotplugSaveas | HotplugSaveasPoweroff | HotplugSaveasSuspended
        | HotplugSaveasUndeployed | HotplugSaveasStopped => DriverStep::Saveas,

        DiskSnapshot | DiskSnapshotDelete | DiskSnapshotPoweroff
        | DiskSnapshotRevertPoweroff | DiskSnapshotDeletePoweroff
        | DiskSnapshotSuspended | DiskSnapshotRevertSuspended
        | DiskSnapshotDeleteSuspended => DriverStep::DiskSnapshot,

        DiskResize | DiskResizePoweroff | DiskResizeUndeployed => DriverStep::DiskResize,
        HotplugResize => DriverStep::Resize,
        Backup | BackupPoweroff => DriverStep::Backup,
        Restore => DriverStep::DiskRestore,
    };
    Some(step)
}

/// The action a cold migration was requested with, kept on the source
/// host record.
fn migration_action(vm: &VirtualMachine) -> VmAction {
    vm.previous_history().map(|h| h.action).unwrap_or_default()
}

fn powers_off(action: VmAction) -> bool {
    matches!(action, VmAction::PoffMigrate | VmAction::PoffHardMigrate)
}

/// What `retry` reissues for a VM in `state`.
#[derive(Debug)]
enum Reissue {
    Transfer(TransferOp),
    Hypervisor(VmmOp),
}

/// The records a retried command depends on.
#[derive(Clone, Copy, Default)]
struct RetryContext {
    /// Files live on the front-end (stopped or undeployed).
    on_frontend: bool,
    /// Action of the current history record.
    action: VmAction,
    /// Action of the source host record during a migration.
    migration: VmAction,
    /// The migration went through a save, so a checkpoint exists on the
    /// target.
    checkpoint: bool,
}

impl RetryContext {
    fn of(vm: &VirtualMachine) -> Self {
        let prev = vm.previous_history();
        Self {
            on_frontend: vm.history().is_some_and(|h| h.on_frontend),
            action: vm.history().map(|h| h.action).unwrap_or_default(),
            migration: migration_action(vm),
            checkpoint: prev.is_some_and(|h| {
                h.action == VmAction::Migrate && h.reason != HistoryReason::Error
            }),
        }
    }
}

fn reissue(state: LcmState, ctx: RetryContext) -> Option<Reissue> {
    use LcmState::*;
    let hard = matches!(
        ctx.action,
        VmAction::TerminateHard | VmAction::UndeployHard | VmAction::PoweroffHard
    );
    let op = match state {
        Prolog => Reissue::Transfer(TransferOp::Prolog),
        PrologResume | PrologUndeploy => Reissue::Transfer(TransferOp::PrologResume),
        PrologMigrate | PrologMigratePoweroff | PrologMigrateSuspend
        | PrologMigrateUnknown => Reissue::Transfer(TransferOp::PrologMigrate),
        Epilog => Reissue::Transfer(TransferOp::Epilog { local: ctx.on_frontend }),
        EpilogStop | EpilogUndeploy => Reissue::Transfer(TransferOp::EpilogStop),
        BootMigrate if ctx.checkpoint => Reissue::Hypervisor(VmmOp::Restore),
        Boot | BootUnknown | BootPoweroff | BootUndeploy | BootMigrate => {
            Reissue::Hypervisor(VmmOp::Deploy)
        }
        BootSuspended | BootStopped => Reissue::Hypervisor(VmmOp::Restore),
        Migrate => Reissue::Hypervisor(VmmOp::Migrate),
        SaveMigrate => Reissue::Hypervisor(match ctx.migration {
            VmAction::PoffMigrate => VmmOp::Shutdown,
            VmAction::PoffHardMigrate => VmmOp::Cancel,
            _ => VmmOp::Save,
        }),
        SaveStop | SaveSuspend => Reissue::Hypervisor(VmmOp::Save),
        Shutdown | ShutdownPoweroff | ShutdownUndeploy => {
            Reissue::Hypervisor(if hard { VmmOp::Cancel } else { VmmOp::Shutdown })
        }
        _ => return None,
    };
    Some(op)
}

impl LifeCycleManager {
    /// Completes the pending operation of `vid` as if its driver had
    /// reported `success`. A VM in a failure state with `success == false`
    /// is left where it is.
    pub(super) fn recover(&self, vid: ObjectId, success: bool, ra: &RequestAttributes) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        let state = vm.lcm_state();
        info!(self.log, "recovering VM"; "vm_id" => vid, "state" => %state,
            "success" => success, "uid" => ra.uid);

        match state {
            LcmState::CleanupDelete => {
                drop(vm);
                self.dm.done(vid);
                return;
            }
            LcmState::CleanupResubmit => {
                drop(vm);
                self.dm.resubmit(vid);
                return;
            }
            LcmState::Unknown => {
                drop(vm);
                if success {
                    self.handle_self().trigger(LcmAction::MonitorRunning(vid));
                }
                return;
            }
            _ => {}
        }

        let Some(step) = pending_step(&vm, state) else {
            info!(self.log, "nothing to recover"; "vm_id" => vid, "state" => %state);
            return;
        };

        if state.is_failure() {
            if !success {
                return;
            }
            vm.set_lcm_state(in_flight(state));
            self.update(&vm);
        }
        drop(vm);

        let me = self.handle_self();
        if success {
            me.success(step, vid);
        } else {
            me.failure(step, vid);
        }
    }

    /// Runs the pending (or last failed) transfer or hypervisor operation
    /// of `vid` again.
    pub(super) fn retry(&self, vid: ObjectId, ra: &RequestAttributes) {
        let Some(mut vm) = self.get_vm(vid) else {
            return;
        };
        let failed = vm.lcm_state();
        let state = in_flight(failed);

        let Some(op) = reissue(state, RetryContext::of(&vm)) else {
            warn!(self.log, "retry is not supported in this state";
                "vm_id" => vid, "state" => %failed);
            return;
        };
        info!(self.log, "retrying operation"; "vm_id" => vid, "state" => %failed,
            "uid" => ra.uid);

        if failed != state {
            vm.set_lcm_state(state);
            self.update(&vm);
        }
        drop(vm);

        match op {
            Reissue::Transfer(op) => self.tm.trigger(vid, op),
            Reissue::Hypervisor(op) => self.vmm.trigger(vid, op),
        }
    }
}
