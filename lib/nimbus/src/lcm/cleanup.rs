// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use nimbus_types::{
    HistoryReason, LcmState, ObjectId, PendingOp, SaveAsRequest, VirtualMachine,
};
use slog::{info, warn};

use super::LifeCycleManager;
use crate::now;
use crate::quota::VmUsage;
use crate::tm::{DeleteTarget, TransferOp};
use crate::vmm::VmmOp;

/// What has to be torn down for a VM caught in a given state.
enum Teardown {
    /// No driver operation and no files on a host.
    Nothing,
    /// A transfer may be running: cancel it and delete the files.
    Transfer(DeleteTarget),
    /// The VM may be running on its host: cancel and clean up there.
    Hypervisor,
    /// A migration is in flight between two hosts.
    Migration,
    /// The VM is stopped on its host; only its files remain.
    Files(DeleteTarget),
}

fn teardown(state: LcmState) -> Teardown {
    use LcmState::*;
    match state {
        LcmInit | CleanupResubmit | CleanupDelete => Teardown::Nothing,

        Prolog | PrologFailure | PrologResume | PrologResumeFailure
        | PrologUndeploy | PrologUndeployFailure | Epilog | EpilogFailure
        | EpilogStop | EpilogStopFailure | EpilogUndeploy
        | EpilogUndeployFailure => Teardown::Transfer(DeleteTarget::Current),

        PrologMigrate
        | PrologMigrateFailure
        | PrologMigratePoweroff
        | PrologMigratePoweroffFailure
        | PrologMigrateSuspend
        | PrologMigrateSuspendFailure
        | PrologMigrateUnknown
        | PrologMigrateUnknownFailure => Teardown::Transfer(DeleteTarget::Both),

        Boot | BootFailure | BootUnknown | BootPoweroff | BootSuspended
        | BootStopped | BootStoppedFailure | BootUndeploy
        | BootUndeployFailure | BootMigrate | BootMigrateFailure | Running
        | Unknown | Shutdown | ShutdownPoweroff | ShutdownUndeploy
        | SaveStop | SaveSuspend | Hotplug | HotplugNic | HotplugSnapshot
        | HotplugSaveas | DiskSnapshot | DiskSnapshotDelete | DiskResize
        | HotplugResize | Backup => Teardown::Hypervisor,

        Migrate | SaveMigrate => Teardown::Migration,

        HotplugSaveasPoweroff
        | HotplugSaveasSuspended
        | HotplugPrologPoweroff
        | HotplugEpilogPoweroff
        | HotplugNicPoweroff
        | DiskSnapshotPoweroff
        | DiskSnapshotRevertPoweroff
        | DiskSnapshotDeletePoweroff
        | DiskSnapshotSuspended
        | DiskSnapshotRevertSuspended
        | DiskSnapshotDeleteSuspended
        | DiskResizePoweroff
        | BackupPoweroff
        | Restore => Teardown::Files(DeleteTarget::Current),

        HotplugSaveasUndeployed | HotplugSaveasStopped | DiskResizeUndeployed => {
            Teardown::Files(DeleteTarget::Local)
        }
    }
}

/// Quota held by operations a teardown abandons. Taken from the VM before
/// `clean_up_vm` and refunded once its guard is released.
pub(super) struct Abandoned {
    uid: ObjectId,
    gid: ObjectId,
    /// CPU and memory of a VM the running counters do not cover; the final
    /// release treats it as running.
    uncounted: Option<(f64, u64)>,
    saveas: Option<SaveAsRequest>,
    /// Datastore and size change of an unfinished disk resize.
    disk_resize: Option<(ObjectId, i64)>,
    /// Usage charged for an unfinished live resize.
    resize: Option<VmUsage>,
}

impl Abandoned {
    /// Ends the in-flight operations of `vm`, rolling back a disk resize.
    pub(super) fn take(vm: &mut VirtualMachine) -> Self {
        let counted = vm.counts_running();
        let disk_resize = vm.end_disk_resize(true).and_then(|(id, old, new)| {
            let ds_id = vm.disk(id)?.datastore_id()?;
            Some((ds_id, new as i64 - old as i64))
        });
        let resize = vm.pending_resize.take().map(|p| {
            let cpu = p.cpu - vm.cpu;
            let memory = p.memory as i64 - vm.memory as i64;
            VmUsage {
                cpu,
                memory,
                running_cpu: if counted { cpu } else { 0.0 },
                running_memory: if counted { memory } else { 0 },
                ..Default::default()
            }
        });
        Self {
            uid: vm.uid,
            gid: vm.gid,
            uncounted: (!counted).then_some((vm.cpu, vm.memory)),
            saveas: vm.saveas_disk(),
            disk_resize,
            resize,
        }
    }
}

impl LifeCycleManager {
    /// Returns what the abandoned operations of `vid` were charged. Call
    /// without holding the VM guard.
    pub(super) fn refund(&self, vid: ObjectId, abandoned: Abandoned) {
        let Abandoned { uid, gid, uncounted, saveas, disk_resize, resize } = abandoned;
        if let Some((cpu, memory)) = uncounted {
            self.restore_running_quota(uid, gid, cpu, memory);
        }
        if let Some(req) = saveas {
            self.abandon_saveas(vid, &req);
        }
        if let Some((ds_id, grown)) = disk_resize {
            self.quotas.ds_add(uid, gid, ds_id, -grown);
        }
        if let Some(delta) = resize {
            self.quotas.vm_add(uid, gid, &delta.negate());
        }
    }

    /// Aborts whatever the VM is doing and removes it from its host(s).
    ///
    /// With `dispose` the VM ends up in CLEANUP_DELETE and the caller
    /// finishes it; otherwise it lands in CLEANUP_RESUBMIT and is resubmitted
    /// once the hypervisor cleanup reports back. Called with the VM guard
    /// held; only queues are touched besides the host and cluster pools.
    pub(super) fn clean_up_vm(&self, vm: &mut VirtualMachine, dispose: bool) {
        let vid = vm.oid;
        let state = vm.lcm_state();
        let t = now();

        info!(self.log, "cleaning up VM"; "vm_id" => vid, "state" => %state,
            "dispose" => dispose);

        vm.set_lcm_state(if dispose {
            LcmState::CleanupDelete
        } else {
            LcmState::CleanupResubmit
        });
        vm.resched = false;
        self.release_vnc_port(vm);

        if let Some(h) = vm.history_mut() {
            h.etime = t;
            h.reason = HistoryReason::User;
        }
        self.del_capacity(vm.hid(), vid);

        match teardown(state) {
            Teardown::Nothing => {}
            Teardown::Transfer(target) => {
                if let Some(h) = vm.history_mut() {
                    if h.prolog_stime != 0 && h.prolog_etime == 0 {
                        h.prolog_etime = t;
                    }
                    if h.epilog_stime != 0 && h.epilog_etime == 0 {
                        h.epilog_etime = t;
                    }
                }
                if target == DeleteTarget::Both {
                    self.close_previous(vm, t);
                }
                self.tm.driver_cancel(vid);
                self.tm.trigger(vid, TransferOp::EpilogDelete(target));
            }
            Teardown::Hypervisor => {
                if let Some(h) = vm.history_mut() {
                    h.running_etime = t;
                }
                self.clear_pending(vm);
                self.vmm.trigger(vid, VmmOp::DriverCancel);
                self.vmm.trigger(vid, VmmOp::Cleanup { previous: false });
            }
            Teardown::Migration => {
                if let Some(h) = vm.history_mut() {
                    h.running_etime = t;
                }
                self.close_previous(vm, t);
                self.vmm.trigger(vid, VmmOp::DriverCancel);
                self.vmm.trigger(vid, VmmOp::Cleanup { previous: true });
            }
            Teardown::Files(target) => {
                self.clear_pending(vm);
                self.tm.trigger(vid, TransferOp::EpilogDelete(target));
            }
        }
    }

    /// Closes the source-host record of an interrupted migration.
    fn close_previous(&self, vm: &mut VirtualMachine, t: i64) {
        if let Some(prev) = vm.previous_history_mut() {
            prev.running_etime = t;
            prev.etime = t;
            prev.reason = HistoryReason::User;
        }
        self.del_capacity(vm.previous_hid(), vm.oid);
        self.update_previous_history(vm);
    }

    fn clear_pending(&self, vm: &mut VirtualMachine) {
        for op in [PendingOp::Attach, PendingOp::Detach, PendingOp::Snapshot, PendingOp::SaveAs] {
            vm.clear_disk_pending(op);
        }
        vm.end_disk_resize(true);
        vm.clear_nic_pending(PendingOp::Attach);
        vm.clear_nic_pending(PendingOp::Detach);
        vm.clear_snapshot_pending();
        vm.pending_resize = None;
    }

    fn release_vnc_port(&self, vm: &mut VirtualMachine) {
        let (Some(port), Some(cluster_id)) =
            (vm.vnc_port(), vm.history().map(|h| h.cluster_id))
        else {
            return;
        };
        match self.pools.clusters.get(cluster_id) {
            Some(mut cluster) => {
                cluster.release_vnc_port(port);
                if let Err(e) = self.pools.clusters.update(&cluster) {
                    warn!(self.log, "failed to persist cluster";
                        "cluster_id" => cluster_id, "error" => %e);
                }
            }
            None => warn!(self.log, "cluster is gone, VNC port not released";
                "vm_id" => vm.oid, "cluster_id" => cluster_id),
        }
        vm.clear_vnc_port();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn migration_states_clean_both_hosts() {
        for state in LcmState::iter() {
            let name = state.to_string();
            match teardown(state) {
                Teardown::Transfer(DeleteTarget::Both) => {
                    assert!(name.starts_with("PROLOG_MIGRATE"), "{name}")
                }
                Teardown::Migration => {
                    assert!(matches!(state, LcmState::Migrate | LcmState::SaveMigrate))
                }
                _ => assert!(!name.starts_with("PROLOG_MIGRATE"), "{name}"),
            }
        }
    }

    #[test]
    fn stopped_files_are_deleted_locally() {
        assert!(matches!(
            teardown(LcmState::HotplugSaveasStopped),
            Teardown::Files(DeleteTarget::Local)
        ));
        assert!(matches!(teardown(LcmState::Running), Teardown::Hypervisor));
        assert!(matches!(teardown(LcmState::LcmInit), Teardown::Nothing));
    }
}
