// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Placement and lifecycle actions: allocate, deploy, migrate, the
//! shutdown family and the delete variants.

use nimbus_types::{
    History, LcmState, ObjectId, VirtualMachine, VmAction, VmState,
};
use slog::{error, info, warn};

use super::{resources, DispatchError, DispatchManager};
use crate::lcm::LcmAction;
use crate::pool::PoolGuard;
use crate::quota::VmUsage;
use crate::tm::{DeleteTarget, TransferOp};
use crate::vmm::VmmOp;
use crate::{now, RequestAttributes};

pub(super) fn running_or_unknown(state: VmState, lcm: LcmState) -> bool {
    state == VmState::Active && matches!(lcm, LcmState::Running | LcmState::Unknown)
}

fn not_scheduled(state: VmState) -> bool {
    matches!(
        state,
        VmState::Init
            | VmState::Pending
            | VmState::Hold
            | VmState::Cloning
            | VmState::CloningFailure
    )
}

impl DispatchManager {
    /// Adds a new VM in PENDING (or HOLD), taking its quota and the images,
    /// leases and security groups its template references. On any failure
    /// nothing is left allocated.
    pub fn allocate(&self, vm: VirtualMachine, on_hold: bool) -> Result<ObjectId, DispatchError> {
        let (uid, gid) = (vm.uid, vm.gid);
        let usage = VmUsage::whole(vm.cpu, vm.memory);
        self.quotas.vm_check(uid, gid, &usage).map_err(DispatchError::Rejected)?;

        let vid = match self.pools.vms.allocate_vm(vm, on_hold) {
            Ok(vid) => vid,
            Err(e) => {
                self.quotas.vm_add(uid, gid, &usage.negate());
                return Err(e.into());
            }
        };

        let Some(mut vm) = self.pools.vms.get(vid) else {
            return Err(DispatchError::NotFound(vid));
        };
        let outcome = self.acquire_template(&mut vm);
        self.update(&vm);
        let snapshot = vm.clone();
        drop(vm);

        match outcome {
            Ok(()) => {
                for (ds_id, size) in snapshot.disks.iter().filter_map(resources::disk_ds_usage) {
                    self.quotas.ds_add(uid, gid, ds_id, size as i64);
                }
                info!(self.log, "VM allocated"; "vm_id" => vid,
                    "state" => snapshot.state_str());
                Ok(vid)
            }
            Err(reason) => {
                warn!(self.log, "VM allocation failed"; "vm_id" => vid,
                    "reason" => &reason);
                resources::release_vm(&self.pools, &snapshot, &self.log);
                self.quotas.vm_add(uid, gid, &usage.negate());
                self.pools.vms.drop_object(vid)?;
                Err(DispatchError::Rejected(reason))
            }
        }
    }

    fn acquire_template(&self, vm: &mut VirtualMachine) -> Result<(), String> {
        let vid = vm.oid;
        for (id, disk) in (0u32..).zip(vm.disks.iter_mut()) {
            if disk.disk_id().is_none() {
                disk.attrs.replace("DISK_ID", id.to_string());
            }
            resources::acquire_disk_image(&self.pools, vid, &mut disk.attrs)?;
        }
        for (id, nic) in (0u32..).zip(vm.nics.iter_mut()) {
            if nic.nic_id().is_none() {
                nic.attrs.replace("NIC_ID", id.to_string());
            }
            resources::acquire_nic(&self.pools, vid, &mut nic.attrs)?;
        }
        let sgids = vm.security_groups();
        for (sgid, rules) in resources::join_security_groups(&self.pools, vid, &sgids, &self.log) {
            vm.set_sg_rules(sgid, rules);
        }
        Ok(())
    }

    /// Builds the history record for placing `vm` on host `hid` with
    /// system datastore `ds_id`.
    fn placement(
        &self,
        vm: &VirtualMachine,
        hid: ObjectId,
        ds_id: ObjectId,
        ra: &RequestAttributes,
    ) -> Result<History, DispatchError> {
        let host = self
            .pools
            .hosts
            .get_ro(hid)
            .ok_or_else(|| DispatchError::Rejected(format!("Host {hid} does not exist")))?;
        let ds = self
            .pools
            .datastores
            .get_ro(ds_id)
            .ok_or_else(|| DispatchError::Rejected(format!("Datastore {ds_id} does not exist")))?;
        Ok(History {
            hid,
            hostname: host.name,
            cluster_id: host.cluster_id,
            vmm_mad: host.vmm_mad,
            tm_mad: ds.tm_mad,
            ds_id,
            system_dir: self.config.system_dir(ds_id, vm.oid),
            public_cloud: host.public_cloud,
            stime: now(),
            uid: ra.uid,
            gid: ra.gid,
            req_id: ra.req_id,
            ..Default::default()
        })
    }

    /// Reserves a VNC port in the host's cluster if the VM asks for VNC
    /// graphics without one.
    fn reserve_vnc_port(&self, vm: &mut VirtualMachine, cluster_id: ObjectId) {
        let wants_vnc = vm.graphics.as_ref().is_some_and(|g| {
            g.vector_value("TYPE").is_some_and(|t| t.eq_ignore_ascii_case("VNC"))
                && !g.contains("PORT")
        });
        if !wants_vnc {
            return;
        }
        let Some(mut cluster) = self.pools.clusters.get(cluster_id) else {
            warn!(self.log, "cluster does not exist, no VNC port reserved";
                "vm_id" => vm.oid, "cluster_id" => cluster_id);
            return;
        };
        let port = cluster.reserve_vnc_port(self.config.vnc_base_port, vm.oid);
        if let Err(e) = self.pools.clusters.update(&cluster) {
            error!(self.log, "failed to persist cluster"; "cluster_id" => cluster_id,
                "error" => %e);
        }
        if let Some(g) = vm.graphics.as_mut() {
            g.replace("PORT", port.to_string());
        }
    }

    pub fn deploy(
        &self,
        vid: ObjectId,
        hid: ObjectId,
        ds_id: ObjectId,
        ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        let mut vm = self.check("deploy", vid, |state, _| {
            matches!(
                state,
                VmState::Pending | VmState::Hold | VmState::Stopped | VmState::Undeployed
            )
        })?;
        let record = self.placement(&vm, hid, ds_id, ra)?;
        let from = vm.state();

        self.reserve_vnc_port(&mut vm, record.cluster_id);
        vm.set_state(VmState::Active);
        vm.set_lcm_state(LcmState::LcmInit);
        vm.add_history(record);
        self.update_history(&vm);
        self.update(&vm);
        let (uid, gid, cpu, memory) = (vm.uid, vm.gid, vm.cpu, vm.memory);
        drop(vm);

        if matches!(from, VmState::Stopped | VmState::Undeployed) {
            self.quotas.vm_add(uid, gid, &VmUsage::running(cpu, memory));
        }
        info!(self.log, "deploying VM"; "vm_id" => vid, "host_id" => hid);
        self.lcm.trigger(LcmAction::Deploy { vid, ra: *ra });
        Ok(())
    }

    /// Adopts a VM already running on `hid` under `deploy_id`.
    pub fn import(
        &self,
        vid: ObjectId,
        hid: ObjectId,
        ds_id: ObjectId,
        deploy_id: &str,
        ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        let mut vm = self.check("import", vid, |state, _| {
            matches!(state, VmState::Pending | VmState::Hold)
        })?;
        let mut record = self.placement(&vm, hid, ds_id, ra)?;
        record.running_stime = record.stime;
        record.action = VmAction::Import;

        self.pools.hosts.add_capacity(hid, &vm.capacity())?;

        self.reserve_vnc_port(&mut vm, record.cluster_id);
        vm.set_state(VmState::Active);
        vm.set_lcm_state(LcmState::Running);
        vm.add_history(record);
        vm.deploy_id = Some(deploy_id.to_string());
        vm.imported = true;
        self.update_history(&vm);
        self.update(&vm);
        drop(vm);

        self.pools.vms.insert_index(deploy_id, vid);
        info!(self.log, "VM imported"; "vm_id" => vid, "deploy_id" => deploy_id);
        Ok(())
    }

    /// Cold migration to `hid`. `action` selects how a running VM is
    /// stopped first: `Migrate` saves it, `PoffMigrate` shuts it down and
    /// `PoffHardMigrate` destroys it.
    pub fn migrate(
        &self,
        vid: ObjectId,
        hid: ObjectId,
        ds_id: ObjectId,
        action: VmAction,
        ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        if !matches!(
            action,
            VmAction::Migrate | VmAction::PoffMigrate | VmAction::PoffHardMigrate
        ) {
            return Err(DispatchError::Rejected(format!("{action} is not a migration")));
        }
        let poweroff = action != VmAction::Migrate;
        let mut vm = self.check("migrate", vid, |state, lcm| {
            if poweroff {
                state == VmState::Active && lcm == LcmState::Running
            } else {
                running_or_unknown(state, lcm)
                    || matches!(state, VmState::Poweroff | VmState::Suspended)
            }
        })?;
        let record = self.placement(&vm, hid, ds_id, ra)?;
        vm.add_history(record);
        self.update_history(&vm);
        self.update_previous_history(&vm);
        self.update(&vm);
        drop(vm);

        self.lcm.trigger(LcmAction::Migrate { vid, ra: *ra, action });
        Ok(())
    }

    /// Live migration to `hid`, keeping the VM on its system datastore.
    pub fn live_migrate(
        &self,
        vid: ObjectId,
        hid: ObjectId,
        ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        let mut vm = self.check("live-migrate", vid, |state, lcm| {
            state == VmState::Active && lcm == LcmState::Running
        })?;
        let Some(ds_id) = vm.history().map(|h| h.ds_id) else {
            return Err(self.reject("live-migrate", &vm));
        };
        let record = self.placement(&vm, hid, ds_id, ra)?;
        vm.add_history(record);
        self.update_history(&vm);
        self.update(&vm);
        drop(vm);

        self.lcm.trigger(LcmAction::LiveMigrate { vid, ra: *ra });
        Ok(())
    }

    pub fn terminate(
        &self,
        vid: ObjectId,
        hard: bool,
        ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        let vm = self.get_vm(vid)?;
        let (state, lcm) = (vm.state(), vm.lcm_state());

        if not_scheduled(state) {
            self.free_vm_resources(vm);
            return Ok(());
        }
        let action = match (state, lcm) {
            (
                VmState::Suspended | VmState::Poweroff | VmState::Stopped | VmState::Undeployed,
                _,
            ) => LcmAction::Shutdown { vid, hard, ra: *ra },
            (VmState::Active, LcmState::Running | LcmState::Unknown) => {
                LcmAction::Shutdown { vid, hard, ra: *ra }
            }
            (VmState::Active, LcmState::Shutdown) if hard => {
                LcmAction::Shutdown { vid, hard, ra: *ra }
            }
            (VmState::Active, lcm) if lcm.is_failure() => LcmAction::Delete { vid, ra: *ra },
            _ => return Err(self.reject("terminate", &vm)),
        };
        drop(vm);
        self.lcm.trigger(action);
        Ok(())
    }

    pub fn undeploy(
        &self,
        vid: ObjectId,
        hard: bool,
        ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        drop(self.check("undeploy", vid, |state, lcm| {
            state == VmState::Poweroff || running_or_unknown(state, lcm)
        })?);
        self.lcm.trigger(LcmAction::Undeploy { vid, hard, ra: *ra });
        Ok(())
    }

    pub fn poweroff(
        &self,
        vid: ObjectId,
        hard: bool,
        ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        drop(self.check("poweroff", vid, running_or_unknown)?);
        self.lcm.trigger(LcmAction::Poweroff { vid, hard, ra: *ra });
        Ok(())
    }

    pub fn hold(&self, vid: ObjectId, _ra: &RequestAttributes) -> Result<(), DispatchError> {
        let mut vm = self.check("hold", vid, |state, _| state == VmState::Pending)?;
        vm.set_state(VmState::Hold);
        self.update(&vm);
        Ok(())
    }

    pub fn release(&self, vid: ObjectId, _ra: &RequestAttributes) -> Result<(), DispatchError> {
        let mut vm = self.check("release", vid, |state, _| state == VmState::Hold)?;
        vm.set_state(VmState::Pending);
        self.update(&vm);
        Ok(())
    }

    pub fn stop(&self, vid: ObjectId, ra: &RequestAttributes) -> Result<(), DispatchError> {
        drop(self.check("stop", vid, |state, lcm| {
            state == VmState::Suspended || running_or_unknown(state, lcm)
        })?);
        self.lcm.trigger(LcmAction::Stop { vid, ra: *ra });
        Ok(())
    }

    pub fn suspend(&self, vid: ObjectId, ra: &RequestAttributes) -> Result<(), DispatchError> {
        drop(self.check("suspend", vid, running_or_unknown)?);
        self.lcm.trigger(LcmAction::Suspend { vid, ra: *ra });
        Ok(())
    }

    /// Brings a stopped, undeployed, suspended or powered-off VM back.
    /// Stopped and undeployed VMs go back to the scheduler.
    pub fn resume(&self, vid: ObjectId, ra: &RequestAttributes) -> Result<(), DispatchError> {
        let mut vm = self.check("resume", vid, |state, _| {
            matches!(
                state,
                VmState::Stopped | VmState::Undeployed | VmState::Suspended | VmState::Poweroff
            )
        })?;
        let (uid, gid, cpu, memory) = (vm.uid, vm.gid, vm.cpu, vm.memory);
        match vm.state() {
            VmState::Stopped | VmState::Undeployed => {
                vm.set_state(VmState::Pending);
                vm.set_lcm_state(LcmState::LcmInit);
                self.update(&vm);
                drop(vm);
                self.quotas.vm_add(uid, gid, &VmUsage::running(cpu, memory));
            }
            VmState::Suspended => {
                drop(vm);
                self.lcm.trigger(LcmAction::Restore { vid, ra: *ra });
            }
            _ => {
                drop(vm);
                self.quotas.vm_add(uid, gid, &VmUsage::running(cpu, memory));
                self.lcm.trigger(LcmAction::Restart { vid, ra: *ra });
            }
        }
        Ok(())
    }

    /// Reboots a running VM in place. A VM that went missing or failed to
    /// boot is booted again instead.
    pub fn reboot(
        &self,
        vid: ObjectId,
        hard: bool,
        ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        let mut vm = self.check("reboot", vid, |state, lcm| {
            state == VmState::Active
                && matches!(
                    lcm,
                    LcmState::Running
                        | LcmState::Unknown
                        | LcmState::BootFailure
                        | LcmState::BootMigrateFailure
                        | LcmState::BootUndeployFailure
                        | LcmState::BootStoppedFailure
                )
        })?;
        if vm.lcm_state() != LcmState::Running {
            drop(vm);
            self.lcm.trigger(LcmAction::Restart { vid, ra: *ra });
            return Ok(());
        }
        if let Some(h) = vm.history_mut() {
            h.action = if hard { VmAction::RebootHard } else { VmAction::Reboot };
            h.uid = ra.uid;
            h.gid = ra.gid;
            h.req_id = ra.req_id;
        }
        self.update_history(&vm);
        drop(vm);
        self.vmm.trigger(vid, if hard { VmmOp::Reset } else { VmmOp::Reboot });
        Ok(())
    }

    /// Flags (or unflags) a running VM for rescheduling.
    pub fn resched(
        &self,
        vid: ObjectId,
        resched: bool,
        _ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        let action = if resched { "resched" } else { "unresched" };
        let mut vm = self.check(action, vid, running_or_unknown)?;
        vm.resched = resched;
        self.update(&vm);
        Ok(())
    }

    pub fn recover(
        &self,
        vid: ObjectId,
        success: bool,
        ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        drop(self.check("recover", vid, |state, _| state == VmState::Active)?);
        self.lcm.trigger(LcmAction::Recover { vid, success, ra: *ra });
        Ok(())
    }

    pub fn retry(&self, vid: ObjectId, ra: &RequestAttributes) -> Result<(), DispatchError> {
        drop(self.check("retry", vid, |state, _| state == VmState::Active)?);
        self.lcm.trigger(LcmAction::Retry { vid, ra: *ra });
        Ok(())
    }

    /// Deletes the VM whatever it is doing. An ACTIVE VM is torn down by
    /// the life-cycle manager first.
    pub fn delete(&self, vid: ObjectId, ra: &RequestAttributes) -> Result<(), DispatchError> {
        let vm = self.check("delete", vid, |state, _| state != VmState::Done)?;
        if vm.state() == VmState::Active {
            drop(vm);
            self.lcm.trigger(LcmAction::Delete { vid, ra: *ra });
            return Ok(());
        }
        self.delete_vm(vm);
        Ok(())
    }

    /// Deletes a VM that is not ACTIVE, removing any files it left on the
    /// host or on the front-end.
    fn delete_vm(&self, vm: PoolGuard<VirtualMachine>) {
        let vid = vm.oid;
        match vm.state() {
            VmState::Suspended | VmState::Poweroff => {
                if !vm.is_public_cloud() {
                    if let Some(hid) = vm.hid() {
                        self.pools.hosts.del_capacity(hid, vid);
                    }
                    self.tm.trigger(vid, TransferOp::EpilogDelete(DeleteTarget::Current));
                }
            }
            VmState::Stopped | VmState::Undeployed => {
                if !vm.is_public_cloud() {
                    self.tm.trigger(vid, TransferOp::EpilogDelete(DeleteTarget::Local));
                }
            }
            _ => {}
        }
        self.free_vm_resources(vm);
    }

    /// Tears the VM down and sends it back to PENDING.
    pub fn delete_recreate(
        &self,
        vid: ObjectId,
        ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        drop(self.check("delete-recreate", vid, |state, _| state == VmState::Active)?);
        self.lcm.trigger(LcmAction::DeleteRecreate { vid, ra: *ra });
        Ok(())
    }

    /// Forgets the VM without contacting any driver: frees everything it
    /// holds and removes it from the pool.
    pub fn delete_vm_db(&self, vid: ObjectId) -> Result<(), DispatchError> {
        let vm = self.get_vm(vid)?;
        if let Some(hid) = vm.hid() {
            self.pools.hosts.del_capacity(hid, vid);
        }
        if let Some(hid) = vm.previous_hid() {
            self.pools.hosts.del_capacity(hid, vid);
        }
        if vm.state() != VmState::Done {
            self.free_vm_resources(vm);
        } else {
            drop(vm);
        }
        self.pools.vms.drop_object(vid)?;
        info!(self.log, "VM removed from the pool"; "vm_id" => vid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_fixture::Fixture;
    use super::*;
    use crate::tm::TmAction;
    use crate::vmm::VmmAction;
    use nimbus_types::{
        Image, ImageState, SecurityGroup, VectorAttribute, VirtualMachineDisk,
        VirtualMachineNic, VirtualNetwork,
    };

    fn ra() -> RequestAttributes {
        RequestAttributes::new(0, 0, 1)
    }

    #[test]
    fn allocate_acquires_template_resources() {
        let f = Fixture::new();
        let image_id = f
            .pools
            .images
            .allocate(Image {
                datastore_id: 1,
                source: "/img/a".to_string(),
                size: 2048,
                state: ImageState::Ready,
                ..Default::default()
            })
            .unwrap();
        let sgid = f
            .pools
            .secgroups
            .allocate(SecurityGroup {
                rules: vec![VectorAttribute::from_pairs("RULE", [("PROTOCOL", "TCP")])],
                ..Default::default()
            })
            .unwrap();
        let vnid = f
            .pools
            .vnets
            .allocate(VirtualNetwork { security_groups: vec![sgid], ..Default::default() })
            .unwrap();

        let mut vm = VirtualMachine::new(0, 0, 0, "web");
        vm.cpu = 1.0;
        vm.memory = 1024;
        vm.disks.push(VirtualMachineDisk::from(VectorAttribute::from_pairs(
            "DISK",
            [("IMAGE_ID", image_id.to_string())],
        )));
        vm.nics.push(VirtualMachineNic::from(VectorAttribute::from_pairs(
            "NIC",
            [("NETWORK_ID", vnid.to_string())],
        )));

        let vid = f.dm.allocate(vm, false).unwrap();

        let vm = f.pools.vms.get_ro(vid).unwrap();
        assert_eq!(vm.state(), VmState::Pending);
        assert_eq!(vm.disks[0].disk_id(), Some(0));
        assert_eq!(vm.disks[0].source(), Some("/img/a"));
        assert!(vm.nics[0].ip().is_some());
        assert_eq!(vm.sg_rules.len(), 1);
        assert!(f.pools.secgroups.get_ro(sgid).unwrap().members.contains(vid));
        assert_eq!(f.quotas.vm_usage(0).memory, 1024);
        assert_eq!(f.quotas.ds_usage(0, 1), 2048);
    }

    #[test]
    fn allocate_failure_leaves_nothing_behind() {
        let f = Fixture::new();
        let mut vm = VirtualMachine::new(0, 0, 0, "broken");
        vm.memory = 256;
        vm.disks.push(VirtualMachineDisk::from(VectorAttribute::from_pairs(
            "DISK",
            [("IMAGE_ID", "42")],
        )));

        let err = f.dm.allocate(vm, false).unwrap_err();
        assert_eq!(err.code(), -1);
        assert!(f.pools.vms.ids().is_empty());
        assert_eq!(f.quotas.vm_usage(0).vms, 0);
    }

    #[test]
    fn deploy_opens_history_and_triggers_lcm() {
        let f = Fixture::new();
        let vid = f.dm.allocate(VirtualMachine::new(0, 0, 0, "vm"), false).unwrap();

        f.dm.deploy(vid, 1, 0, &ra()).unwrap();

        let vm = f.pools.vms.get_ro(vid).unwrap();
        assert_eq!((vm.state(), vm.lcm_state()), (VmState::Active, LcmState::LcmInit));
        let h = vm.history().unwrap();
        assert_eq!((h.hid, h.hostname.as_str(), h.tm_mad.as_str()), (1, "node1", "ssh"));
        assert!(matches!(f.drain_lcm()[..], [LcmAction::Deploy { vid: v, .. }] if v == vid));
    }

    #[test]
    fn deploy_reserves_vnc_port() {
        let f = Fixture::new();
        let mut vm = VirtualMachine::new(0, 0, 0, "vm");
        vm.graphics = Some(VectorAttribute::from_pairs("GRAPHICS", [("TYPE", "vnc")]));
        let vid = f.dm.allocate(vm, false).unwrap();

        f.dm.deploy(vid, 0, 0, &ra()).unwrap();

        let port = f.pools.vms.get_ro(vid).unwrap().vnc_port().unwrap();
        assert!(f.pools.clusters.get_ro(0).unwrap().vnc_ports.contains(&port));
    }

    #[test]
    fn rejected_actions_leave_the_vm_untouched() {
        let f = Fixture::new();
        let vid = f.vm_in(VmState::Active, LcmState::Prolog);
        let before = f.pools.vms.get_ro(vid).unwrap();

        let results = [
            f.dm.deploy(vid, 1, 0, &ra()),
            f.dm.migrate(vid, 1, 0, VmAction::Migrate, &ra()),
            f.dm.live_migrate(vid, 1, &ra()),
            f.dm.terminate(vid, false, &ra()),
            f.dm.undeploy(vid, false, &ra()),
            f.dm.poweroff(vid, false, &ra()),
            f.dm.hold(vid, &ra()),
            f.dm.release(vid, &ra()),
            f.dm.stop(vid, &ra()),
            f.dm.suspend(vid, &ra()),
            f.dm.resume(vid, &ra()),
            f.dm.reboot(vid, false, &ra()),
            f.dm.resched(vid, true, &ra()),
        ];
        for result in results {
            assert_eq!(result.unwrap_err().code(), -2);
        }
        assert_eq!(f.pools.vms.get_ro(vid).unwrap(), before);
        assert!(f.drain_lcm().is_empty());
        assert!(f.drain_vmm().is_empty());
        assert!(f.drain_tm().is_empty());
    }

    #[test]
    fn unknown_vm_is_not_found() {
        let f = Fixture::new();
        let err = f.dm.suspend(99, &ra()).unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(99)));
        assert_eq!(err.code(), -1);
    }

    #[test]
    fn poweroff_migration_requires_running() {
        let f = Fixture::new();
        let vid = f.vm_in(VmState::Poweroff, LcmState::LcmInit);
        assert!(f.dm.migrate(vid, 1, 0, VmAction::PoffMigrate, &ra()).is_err());

        f.dm.migrate(vid, 1, 0, VmAction::Migrate, &ra()).unwrap();
        let vm = f.pools.vms.get_ro(vid).unwrap();
        assert_eq!((vm.hid(), vm.previous_hid()), (Some(1), Some(0)));
    }

    #[test]
    fn terminate_routes_by_state() {
        let f = Fixture::new();
        let pending = f.vm_in(VmState::Pending, LcmState::LcmInit);
        let failed = f.vm_in(VmState::Active, LcmState::PrologFailure);
        let running = f.vm_in(VmState::Active, LcmState::Running);

        f.dm.terminate(pending, false, &ra()).unwrap();
        f.dm.terminate(failed, false, &ra()).unwrap();
        f.dm.terminate(running, true, &ra()).unwrap();

        assert_eq!(f.state(pending).0, VmState::Done);
        let lcm = f.drain_lcm();
        assert!(matches!(lcm[0], LcmAction::Delete { vid, .. } if vid == failed));
        assert!(matches!(lcm[1], LcmAction::Shutdown { vid, hard: true, .. } if vid == running));
    }

    #[test]
    fn resume_from_stopped_goes_pending_and_restores_running_quota() {
        let f = Fixture::new();
        let vid = f.vm_in(VmState::Stopped, LcmState::LcmInit);
        f.dm.resume(vid, &ra()).unwrap();
        assert_eq!(f.state(vid), (VmState::Pending, LcmState::LcmInit));
        assert_eq!(f.quotas.vm_usage(0).running_vms, 1);
        assert!(f.drain_lcm().is_empty());
    }

    #[test]
    fn reboot_of_running_vm_goes_to_the_hypervisor() {
        let f = Fixture::new();
        let vid = f.vm_in(VmState::Active, LcmState::Running);
        f.dm.reboot(vid, true, &ra()).unwrap();
        assert!(matches!(
            f.drain_vmm()[..],
            [VmmAction::Trigger { op: VmmOp::Reset, .. }]
        ));
    }

    #[test]
    fn delete_suspended_vm_on_private_host() {
        let f = Fixture::new();
        let vid = f.vm_in(VmState::Suspended, LcmState::LcmInit);
        let capacity = f.pools.vms.get_ro(vid).unwrap().capacity();
        f.pools.hosts.add_capacity(0, &capacity).unwrap();

        f.dm.delete(vid, &ra()).unwrap();

        assert!(f.pools.hosts.get_ro(0).unwrap().share.vms.is_empty());
        assert!(matches!(
            f.drain_tm()[..],
            [TmAction::Transfer { op: TransferOp::EpilogDelete(DeleteTarget::Current), .. }]
        ));
        let vm = f.pools.vms.get_ro(vid).unwrap();
        assert_eq!((vm.state(), vm.lcm_state()), (VmState::Done, LcmState::LcmInit));
        assert!(vm.etime > 0);
    }

    #[test]
    fn delete_vm_db_drops_the_row() {
        let f = Fixture::new();
        let vid = f.vm_in(VmState::Active, LcmState::Running);
        f.dm.delete_vm_db(vid).unwrap();
        assert!(f.pools.vms.get_ro(vid).is_none());
    }
}
