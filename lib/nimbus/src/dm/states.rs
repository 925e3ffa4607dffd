// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Terminal notifications from the life-cycle manager, and the release of
//! everything a VM holds once it is done.

use nimbus_types::{LcmState, ObjectId, VirtualMachine, VmAction, VmState};
use slog::{error, info};

use super::{resources, DispatchManager};
use crate::pool::PoolGuard;
use crate::quota::VmUsage;
use crate::{now, RequestAttributes};

impl DispatchManager {
    /// Leaves the VM in `state` once the life-cycle manager has settled it,
    /// returning its owner and size. A VM outside `from` is only logged.
    fn settle_active(
        &self,
        vid: ObjectId,
        event: &str,
        from: &[LcmState],
        state: VmState,
    ) -> Option<(ObjectId, ObjectId, f64, u64)> {
        let mut vm = self.pools.vms.get(vid)?;
        if vm.state() != VmState::Active || !from.contains(&vm.lcm_state()) {
            error!(self.log, "{} success received but VM is in wrong state", event;
                "vm_id" => vid, "state" => vm.state_str());
            return None;
        }
        vm.set_state(state);
        vm.set_lcm_state(LcmState::LcmInit);
        self.update(&vm);
        info!(self.log, "VM {}", event; "vm_id" => vid, "state" => vm.state_str());
        Some((vm.uid, vm.gid, vm.cpu, vm.memory))
    }

    fn release_running_quota(&self, owner: Option<(ObjectId, ObjectId, f64, u64)>) {
        if let Some((uid, gid, cpu, memory)) = owner {
            self.quotas.vm_add(uid, gid, &VmUsage::running(cpu, memory).negate());
        }
    }

    pub(super) fn stop_success(&self, vid: ObjectId) {
        let owner = self.settle_active(
            vid,
            "stop",
            &[LcmState::EpilogStop, LcmState::PrologResume, LcmState::BootStopped],
            VmState::Stopped,
        );
        self.release_running_quota(owner);
    }

    pub(super) fn undeploy_success(&self, vid: ObjectId) {
        let owner = self.settle_active(
            vid,
            "undeploy",
            &[LcmState::EpilogUndeploy, LcmState::PrologUndeploy, LcmState::BootUndeploy],
            VmState::Undeployed,
        );
        self.release_running_quota(owner);
    }

    pub(super) fn poweroff_success(&self, vid: ObjectId) {
        let owner = self.settle_active(
            vid,
            "poweroff",
            &[
                LcmState::ShutdownPoweroff,
                LcmState::BootPoweroff,
                LcmState::PrologMigratePoweroff,
            ],
            VmState::Poweroff,
        );
        self.release_running_quota(owner);
    }

    pub(super) fn suspend_success(&self, vid: ObjectId) {
        self.settle_active(
            vid,
            "suspend",
            &[
                LcmState::SaveSuspend,
                LcmState::BootSuspended,
                LcmState::PrologMigrateSuspend,
            ],
            VmState::Suspended,
        );
    }

    pub(super) fn done(&self, vid: ObjectId) {
        let Some(vm) = self.pools.vms.get(vid) else {
            return;
        };
        if vm.state() != VmState::Active
            || !matches!(vm.lcm_state(), LcmState::Epilog | LcmState::CleanupDelete)
        {
            error!(self.log, "done received but VM is in wrong state";
                "vm_id" => vid, "state" => vm.state_str());
            return;
        }
        self.free_vm_resources(vm);
    }

    /// Sends a cleaned-up VM back to the scheduler.
    pub(super) fn resubmit(&self, vid: ObjectId) {
        let Some(mut vm) = self.pools.vms.get(vid) else {
            return;
        };
        if vm.state() != VmState::Active || vm.lcm_state() != LcmState::CleanupResubmit {
            error!(self.log, "resubmit received but VM is in wrong state";
                "vm_id" => vid, "state" => vm.state_str());
            return;
        }
        if let Some(deploy_id) = vm.deploy_id.take() {
            self.pools.vms.drop_index(&deploy_id);
        }
        vm.set_state(VmState::Pending);
        vm.set_lcm_state(LcmState::LcmInit);
        self.update(&vm);
        info!(self.log, "VM resubmitted"; "vm_id" => vid);
    }

    /// Closes the current history record with `action` and opens a copy on
    /// the same host, so accounting restarts with the new footprint.
    pub(super) fn close_cp_history(
        &self,
        vm: &mut VirtualMachine,
        action: VmAction,
        ra: &RequestAttributes,
    ) {
        let t = now();
        let running = vm.state() == VmState::Active;
        if let Some(h) = vm.history_mut() {
            if running {
                h.running_etime = t;
            }
            h.etime = t;
            h.action = action;
            h.uid = ra.uid;
            h.gid = ra.gid;
            h.req_id = ra.req_id;
        }
        self.update_history(vm);

        vm.cp_history();
        if let Some(h) = vm.history_mut() {
            h.stime = t;
            if running {
                h.running_stime = t;
            }
        }
        self.update_history(vm);
    }

    /// Moves the VM to DONE and gives back everything it holds: graphics
    /// port, images, leases, group memberships and quota usage.
    pub(super) fn free_vm_resources(&self, mut vm: PoolGuard<VirtualMachine>) {
        let vid = vm.oid;
        let t = now();
        let counted_running = vm.counts_running();

        vm.set_state(VmState::Done);
        vm.set_lcm_state(LcmState::LcmInit);
        vm.etime = t;
        vm.resched = false;

        if let Some(port) = vm.vnc_port() {
            let cluster_id = vm.history().map_or(0, |h| h.cluster_id);
            if let Some(mut cluster) = self.pools.clusters.get(cluster_id) {
                cluster.release_vnc_port(port);
                if let Err(e) = self.pools.clusters.update(&cluster) {
                    error!(self.log, "failed to persist cluster"; "cluster_id" => cluster_id,
                        "error" => %e);
                }
            }
            vm.clear_vnc_port();
        }

        if let Some(h) = vm.history_mut() {
            if h.etime == 0 {
                h.etime = t;
            }
        }
        self.update_history(&vm);
        self.update(&vm);

        let done = vm.clone();
        drop(vm);

        let ds_usage = resources::release_vm(&self.pools, &done, &self.log);

        let mut usage = VmUsage::whole(done.cpu, done.memory);
        if !counted_running {
            usage = VmUsage { running_vms: 0, running_cpu: 0.0, running_memory: 0, ..usage };
        }
        self.quotas.vm_add(done.uid, done.gid, &usage.negate());
        for (ds_id, size) in ds_usage {
            self.quotas.ds_add(done.uid, done.gid, ds_id, -(size as i64));
        }

        if let Some(deploy_id) = &done.deploy_id {
            self.pools.vms.drop_index(deploy_id);
        }
        info!(self.log, "VM done"; "vm_id" => vid);
    }
}
