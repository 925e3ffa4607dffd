// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Disk, NIC and security group hotplug, disk save-as and disk resize.
//!
//! A running VM is changed through the hypervisor driver. A powered-off VM
//! has its disks staged by the transfer driver, and its NICs changed in the
//! template unless the driver asks for cold attach.

use std::collections::BTreeSet;

use nimbus_types::{
    Image, ImageState, LcmState, ObjectId, PendingOp, SaveAsRequest, VectorAttribute,
    VirtualMachine, VirtualMachineDisk, VirtualMachineNic, VmAction, VmState,
};
use slog::{error, info};

use super::{resources, DispatchError, DispatchManager};
use crate::tm::TransferOp;
use crate::vmm::VmmOp;
use crate::RequestAttributes;

fn running(state: VmState, lcm: LcmState) -> bool {
    state == VmState::Active && lcm == LcmState::Running
}

fn running_or_poweroff(state: VmState, lcm: LcmState) -> bool {
    running(state, lcm) || state == VmState::Poweroff
}

/// Enters the hotplug sub-state `live` for a running VM, or `cold` for a
/// powered-off one.
fn enter(vm: &mut VirtualMachine, live: LcmState, cold: LcmState) {
    if vm.state() == VmState::Poweroff {
        vm.set_state(VmState::Active);
        vm.set_lcm_state(cold);
    } else {
        vm.set_lcm_state(live);
    }
}

/// Undoes [`enter`] when the request cannot be set up.
fn leave(vm: &mut VirtualMachine, from: VmState) {
    if from == VmState::Poweroff {
        vm.set_state(VmState::Poweroff);
        vm.set_lcm_state(LcmState::LcmInit);
    } else {
        vm.set_lcm_state(LcmState::Running);
    }
}

impl DispatchManager {
    /// Validates a new `DISK` section, acquires its image and returns the
    /// disk ready to be added to the VM.
    fn set_up_attach_disk(
        &self,
        vm: &VirtualMachine,
        mut attrs: VectorAttribute,
    ) -> Result<VirtualMachineDisk, String> {
        attrs.replace("DISK_ID", vm.next_disk_id().to_string());
        if attrs.contains("IMAGE_ID") {
            resources::acquire_disk_image(&self.pools, vm.oid, &mut attrs)?;
        } else {
            let disk = VirtualMachineDisk::from(attrs.clone());
            if !disk.is_volatile() {
                return Err("DISK needs IMAGE_ID or a volatile TYPE".to_string());
            }
            if disk.size().is_none() {
                return Err("Volatile DISK needs a SIZE".to_string());
            }
        }
        Ok(VirtualMachineDisk::from(attrs))
    }

    pub fn attach(
        &self,
        vid: ObjectId,
        disk: VectorAttribute,
        ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        let mut vm = self.check("disk-attach", vid, running_or_poweroff)?;
        let from = vm.state();
        enter(&mut vm, LcmState::Hotplug, LcmState::HotplugPrologPoweroff);

        let disk = match self.set_up_attach_disk(&vm, disk) {
            Ok(disk) => disk,
            Err(reason) => {
                leave(&mut vm, from);
                info!(self.log, "disk attach rejected"; "vm_id" => vid, "reason" => &reason);
                return Err(DispatchError::Rejected(reason));
            }
        };
        let Some(disk_id) = disk.disk_id() else {
            leave(&mut vm, from);
            return Err(DispatchError::Rejected("DISK has no DISK_ID".to_string()));
        };
        let charge = resources::disk_ds_usage(&disk);
        vm.disks.push(disk);
        vm.set_disk_pending(disk_id, PendingOp::Attach);
        self.close_cp_history(&mut vm, VmAction::DiskAttach, ra);
        self.update(&vm);
        let (uid, gid) = (vm.uid, vm.gid);
        drop(vm);

        if let Some((ds_id, size)) = charge {
            self.quotas.ds_add(uid, gid, ds_id, size as i64);
        }
        if from == VmState::Poweroff {
            self.tm.trigger(vid, TransferOp::PrologAttach);
        } else {
            self.vmm.trigger(vid, VmmOp::AttachDisk);
        }
        Ok(())
    }

    pub fn detach(
        &self,
        vid: ObjectId,
        disk_id: u32,
        ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        let mut vm = self.check("disk-detach", vid, running_or_poweroff)?;
        if vm.disk(disk_id).is_none() {
            return Err(DispatchError::Rejected(format!(
                "VM {vid} has no disk {disk_id}"
            )));
        }
        let from = vm.state();
        enter(&mut vm, LcmState::Hotplug, LcmState::HotplugEpilogPoweroff);
        vm.set_disk_pending(disk_id, PendingOp::Detach);
        self.close_cp_history(&mut vm, VmAction::DiskDetach, ra);
        self.update(&vm);
        drop(vm);

        if from == VmState::Poweroff {
            self.tm.trigger(vid, TransferOp::EpilogDetach);
        } else {
            self.vmm.trigger(vid, VmmOp::DetachDisk);
        }
        Ok(())
    }

    /// True if NIC changes of this powered-off VM go through its driver.
    fn cold_nic_attach(&self, vm: &VirtualMachine) -> bool {
        let vmm_mad = vm.history().map(|h| h.vmm_mad.as_str()).unwrap_or_default();
        self.config.vmm_driver(vmm_mad).cold_nic_attach
    }

    pub fn attach_nic(
        &self,
        vid: ObjectId,
        mut nic: VectorAttribute,
        ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        let mut vm = self.check("nic-attach", vid, running_or_poweroff)?;
        let from = vm.state();
        let through_driver = from != VmState::Poweroff || self.cold_nic_attach(&vm);
        if through_driver {
            enter(&mut vm, LcmState::HotplugNic, LcmState::HotplugNicPoweroff);
        }

        let nic_id = vm.next_nic_id();
        nic.replace("NIC_ID", nic_id.to_string());
        let sgids = match resources::acquire_nic(&self.pools, vid, &mut nic) {
            Ok(sgids) => sgids,
            Err(reason) => {
                if through_driver {
                    leave(&mut vm, from);
                }
                info!(self.log, "NIC attach rejected"; "vm_id" => vid, "reason" => &reason);
                return Err(DispatchError::Rejected(reason));
            }
        };
        let joined: BTreeSet<ObjectId> =
            sgids.difference(&vm.security_groups()).copied().collect();
        for (sgid, rules) in
            resources::join_security_groups(&self.pools, vid, &joined, &self.log)
        {
            vm.set_sg_rules(sgid, rules);
        }
        vm.nics.push(VirtualMachineNic::from(nic));
        if through_driver {
            vm.set_nic_pending(nic_id, PendingOp::Attach);
        }
        self.close_cp_history(&mut vm, VmAction::NicAttach, ra);
        self.update(&vm);
        drop(vm);

        if through_driver {
            self.vmm.trigger(vid, VmmOp::AttachNic);
        }
        Ok(())
    }

    pub fn detach_nic(
        &self,
        vid: ObjectId,
        nic_id: u32,
        ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        let mut vm = self.check("nic-detach", vid, running_or_poweroff)?;
        if vm.nic(nic_id).is_none() {
            return Err(DispatchError::Rejected(format!("VM {vid} has no NIC {nic_id}")));
        }
        let from = vm.state();
        if from != VmState::Poweroff || self.cold_nic_attach(&vm) {
            enter(&mut vm, LcmState::HotplugNic, LcmState::HotplugNicPoweroff);
            vm.set_nic_pending(nic_id, PendingOp::Detach);
            self.close_cp_history(&mut vm, VmAction::NicDetach, ra);
            self.update(&vm);
            drop(vm);
            self.vmm.trigger(vid, VmmOp::DetachNic);
            return Ok(());
        }

        vm.set_nic_pending(nic_id, PendingOp::Detach);
        let Some(removed) = vm.take_pending_nic(PendingOp::Detach) else {
            return Err(DispatchError::Rejected(format!("VM {vid} has no NIC {nic_id}")));
        };
        let still_used = vm.security_groups();
        let orphaned: Vec<ObjectId> = removed
            .security_groups()
            .into_iter()
            .filter(|sgid| !still_used.contains(sgid))
            .collect();
        for sgid in &orphaned {
            vm.remove_sg_rules(*sgid);
        }
        self.close_cp_history(&mut vm, VmAction::NicDetach, ra);
        self.update(&vm);
        drop(vm);

        resources::release_nic(&self.pools, vid, &removed, &self.log);
        resources::leave_security_groups(&self.pools, vid, &orphaned, &self.log);
        Ok(())
    }

    fn sg_allowed(state: VmState, lcm: LcmState) -> bool {
        use LcmState::*;
        state != VmState::Done
            && !matches!(
                lcm,
                Boot | BootUnknown
                    | BootPoweroff
                    | BootSuspended
                    | BootStopped
                    | BootUndeploy
                    | BootMigrate
            )
    }

    /// Adds security group `sgid` to NIC `nic_id`. On a running VM the new
    /// rules are pushed by the next update round of the group.
    pub fn attach_sg(
        &self,
        vid: ObjectId,
        nic_id: u32,
        sgid: ObjectId,
        _ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        let mut vm = self.check("sg-attach", vid, Self::sg_allowed)?;
        let Some(nic) = vm.nic(nic_id) else {
            return Err(DispatchError::Rejected(format!("VM {vid} has no NIC {nic_id}")));
        };
        let mut sgids = nic.security_groups();
        if !sgids.insert(sgid) {
            return Err(DispatchError::Rejected(format!(
                "Security group {sgid} is already attached to NIC {nic_id}"
            )));
        }
        let Some(sg) = self.pools.secgroups.get_ro(sgid) else {
            return Err(DispatchError::Rejected(format!(
                "Security group {sgid} does not exist"
            )));
        };

        if let Some(nic) = vm.nic_mut(nic_id) {
            nic.set_security_groups(&sgids);
        }
        vm.set_sg_rules(sgid, sg.vm_rules());
        let live = running(vm.state(), vm.lcm_state());
        self.update(&vm);
        drop(vm);

        if live {
            self.queue_sg_update(vid, sgid);
            return Ok(());
        }
        let Some(mut sg) = self.pools.secgroups.get(sgid) else {
            return Ok(());
        };
        sg.members.add_vm(vid);
        if let Err(e) = self.pools.secgroups.update(&sg) {
            error!(self.log, "failed to persist security group"; "sg_id" => sgid,
                "error" => %e);
        }
        Ok(())
    }

    /// Removes security group `sgid` from NIC `nic_id`. A running VM gets
    /// its remaining rules pushed through the update round of a group it
    /// still belongs to.
    pub fn detach_sg(
        &self,
        vid: ObjectId,
        nic_id: u32,
        sgid: ObjectId,
        _ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        let mut vm = self.check("sg-detach", vid, Self::sg_allowed)?;
        let Some(nic) = vm.nic(nic_id) else {
            return Err(DispatchError::Rejected(format!("VM {vid} has no NIC {nic_id}")));
        };
        let mut sgids = nic.security_groups();
        if !sgids.remove(&sgid) {
            return Err(DispatchError::Rejected(format!(
                "Security group {sgid} is not attached to NIC {nic_id}"
            )));
        }
        if let Some(nic) = vm.nic_mut(nic_id) {
            nic.set_security_groups(&sgids);
        }
        let remaining = vm.security_groups();
        let orphaned = !remaining.contains(&sgid);
        if orphaned {
            vm.remove_sg_rules(sgid);
        }
        let live = running(vm.state(), vm.lcm_state());
        self.update(&vm);
        drop(vm);

        if orphaned {
            resources::leave_security_groups(&self.pools, vid, &[sgid], &self.log);
        }
        if !live {
            return Ok(());
        }
        match remaining.iter().next() {
            Some(&via) => self.queue_sg_update(vid, via),
            // No group left to queue on: nothing else updates this VM.
            None => self.vmm.trigger(vid, VmmOp::UpdateSg { sgid }),
        }
        Ok(())
    }

    /// Queues `vid` as outdated in group `sgid` and starts an update round.
    fn queue_sg_update(&self, vid: ObjectId, sgid: ObjectId) {
        let Some(mut sg) = self.pools.secgroups.get(sgid) else {
            return;
        };
        sg.members.add_outdated(vid);
        if let Err(e) = self.pools.secgroups.update(&sg) {
            error!(self.log, "failed to persist security group"; "sg_id" => sgid,
                "error" => %e);
        }
        drop(sg);
        self.lcm.updatesg(sgid);
    }

    /// Saves disk `disk_id` (or its snapshot `snapshot_id`, -1 for the
    /// current contents) as a new image. Returns the image id.
    pub fn disk_saveas(
        &self,
        vid: ObjectId,
        disk_id: u32,
        name: &str,
        snapshot_id: i64,
        _ra: &RequestAttributes,
    ) -> Result<ObjectId, DispatchError> {
        let mut vm = self.check("disk-saveas", vid, |state, lcm| {
            running(state, lcm)
                || matches!(
                    state,
                    VmState::Poweroff | VmState::Suspended | VmState::Undeployed | VmState::Stopped
                )
        })?;
        let Some(disk) = vm.disk(disk_id) else {
            return Err(DispatchError::Rejected(format!("VM {vid} has no disk {disk_id}")));
        };
        let (Some(ds_id), false) = (disk.datastore_id(), disk.is_volatile()) else {
            return Err(DispatchError::Rejected(format!(
                "Disk {disk_id} of VM {vid} is not backed by an image"
            )));
        };
        if snapshot_id >= 0 && !disk.snapshots.snapshots.contains_key(&snapshot_id) {
            return Err(DispatchError::Rejected(format!(
                "Disk {disk_id} has no snapshot {snapshot_id}"
            )));
        }
        let size = disk.size().unwrap_or(0);
        let format = disk.format().unwrap_or_default().to_string();

        let image_id = self.pools.images.allocate(Image {
            uid: vm.uid,
            gid: vm.gid,
            name: name.to_string(),
            datastore_id: ds_id,
            state: ImageState::Locked,
            size,
            format,
            ..Default::default()
        })?;
        let source = self
            .config
            .datastore_location
            .join(ds_id.to_string())
            .join(format!("saveas-{vid}-{disk_id}-{image_id}"))
            .display()
            .to_string();
        if let Some(mut image) = self.pools.images.get(image_id) {
            image.source = source.clone();
            self.pools.images.update(&image)?;
        }

        let next = match vm.state() {
            VmState::Poweroff => LcmState::HotplugSaveasPoweroff,
            VmState::Suspended => LcmState::HotplugSaveasSuspended,
            VmState::Undeployed => LcmState::HotplugSaveasUndeployed,
            VmState::Stopped => LcmState::HotplugSaveasStopped,
            _ => LcmState::HotplugSaveas,
        };
        vm.set_state(VmState::Active);
        vm.set_lcm_state(next);
        vm.set_saveas_disk(&SaveAsRequest { disk_id, image_id, source, snapshot_id });
        self.update(&vm);
        let (uid, gid) = (vm.uid, vm.gid);
        drop(vm);

        self.quotas.ds_add(uid, gid, ds_id, size as i64);
        self.tm.trigger(vid, TransferOp::SaveasHot);
        Ok(image_id)
    }

    /// Grows disk `disk_id` to `size` MiB.
    pub fn disk_resize(
        &self,
        vid: ObjectId,
        disk_id: u32,
        size: u64,
        _ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        let mut vm = self.check("disk-resize", vid, |state, lcm| {
            running(state, lcm) || matches!(state, VmState::Poweroff | VmState::Undeployed)
        })?;
        let Some(disk) = vm.disk(disk_id) else {
            return Err(DispatchError::Rejected(format!("VM {vid} has no disk {disk_id}")));
        };
        let current = disk.size().unwrap_or(0);
        if size <= current {
            return Err(DispatchError::Rejected(format!(
                "New size {size} of disk {disk_id} must be greater than {current}"
            )));
        }
        if !disk.snapshots.is_empty() {
            return Err(DispatchError::Rejected(format!(
                "Disk {disk_id} has snapshots and cannot be resized"
            )));
        }
        let ds_id = disk.datastore_id();

        let from = vm.state();
        let next = match from {
            VmState::Poweroff => LcmState::DiskResizePoweroff,
            VmState::Undeployed => LcmState::DiskResizeUndeployed,
            _ => LcmState::DiskResize,
        };
        vm.set_state(VmState::Active);
        vm.set_lcm_state(next);
        vm.set_disk_resize(disk_id, size);
        if let Some(h) = vm.history_mut() {
            h.action = VmAction::DiskResize;
        }
        self.update(&vm);
        let (uid, gid) = (vm.uid, vm.gid);
        drop(vm);

        if let Some(ds_id) = ds_id {
            self.quotas.ds_add(uid, gid, ds_id, size as i64 - current as i64);
        }
        if from == VmState::Active {
            self.vmm.trigger(vid, VmmOp::DiskResize);
        } else {
            self.tm.trigger(vid, TransferOp::ResizeDisk);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_fixture::Fixture;
    use super::*;
    use crate::lcm::LcmAction;
    use crate::tm::TmAction;
    use crate::vmm::VmmAction;
    use nimbus_types::{SecurityGroup, VirtualNetwork};

    fn ra() -> RequestAttributes {
        RequestAttributes::new(0, 0, 1)
    }

    fn volatile_disk() -> VectorAttribute {
        VectorAttribute::from_pairs(
            "DISK",
            [("TYPE", "FS"), ("SIZE", "1024"), ("FORMAT", "raw")],
        )
    }

    fn nic_on(vnid: ObjectId) -> VectorAttribute {
        VectorAttribute::from_pairs("NIC", [("NETWORK_ID", vnid.to_string())])
    }

    #[test]
    fn attach_to_running_vm_goes_to_the_hypervisor() {
        let f = Fixture::new();
        let vid = f.vm_in(VmState::Active, LcmState::Running);

        f.dm.attach(vid, volatile_disk(), &ra()).unwrap();

        let vm = f.pools.vms.get_ro(vid).unwrap();
        assert_eq!(vm.lcm_state(), LcmState::Hotplug);
        assert_eq!(vm.pending_disk(PendingOp::Attach).and_then(|d| d.disk_id()), Some(0));
        assert_eq!(vm.history().unwrap().seq, 1);
        assert!(matches!(f.drain_vmm()[..], [VmmAction::Trigger { op: VmmOp::AttachDisk, .. }]));
    }

    #[test]
    fn attach_to_poweroff_vm_stages_the_disk() {
        let f = Fixture::new();
        let vid = f.vm_in(VmState::Poweroff, LcmState::LcmInit);

        f.dm.attach(vid, volatile_disk(), &ra()).unwrap();

        assert_eq!(f.state(vid), (VmState::Active, LcmState::HotplugPrologPoweroff));
        assert!(matches!(
            f.drain_tm()[..],
            [TmAction::Transfer { op: TransferOp::PrologAttach, .. }]
        ));
    }

    #[test]
    fn failed_attach_set_up_rolls_back() {
        let f = Fixture::new();
        let vid = f.vm_in(VmState::Active, LcmState::Running);
        let before = f.pools.vms.get_ro(vid).unwrap();

        let missing_image = VectorAttribute::from_pairs("DISK", [("IMAGE_ID", "77")]);
        assert!(f.dm.attach(vid, missing_image, &ra()).is_err());

        let vm = f.pools.vms.get_ro(vid).unwrap();
        assert_eq!(vm.lcm_state(), LcmState::Running);
        assert_eq!(vm.history(), before.history());
        assert!(!vm.has_previous_history());
        assert!(f.drain_vmm().is_empty());
        assert!(f.drain_tm().is_empty());
    }

    #[test]
    fn nic_attach_on_poweroff_is_a_template_change() {
        let f = Fixture::new();
        let vnid = f.pools.vnets.allocate(VirtualNetwork::default()).unwrap();
        let vid = f.vm_in(VmState::Poweroff, LcmState::LcmInit);

        f.dm
            .attach_nic(vid, nic_on(vnid), &ra())
            .unwrap();

        let vm = f.pools.vms.get_ro(vid).unwrap();
        assert_eq!((vm.state(), vm.lcm_state()), (VmState::Poweroff, LcmState::LcmInit));
        assert_eq!(vm.nics.len(), 1);
        assert!(vm.pending_nic(PendingOp::Attach).is_none());
        assert!(f.drain_vmm().is_empty());

        f.dm.detach_nic(vid, 0, &ra()).unwrap();
        assert!(f.pools.vms.get_ro(vid).unwrap().nics.is_empty());
        assert!(f.pools.vnets.get_ro(vnid).unwrap().leases.is_empty());
    }

    #[test]
    fn nic_attach_on_running_vm_is_hotplugged() {
        let f = Fixture::new();
        let vnid = f.pools.vnets.allocate(VirtualNetwork::default()).unwrap();
        let vid = f.vm_in(VmState::Active, LcmState::Running);

        f.dm
            .attach_nic(vid, nic_on(vnid), &ra())
            .unwrap();

        assert_eq!(f.state(vid), (VmState::Active, LcmState::HotplugNic));
        assert!(matches!(f.drain_vmm()[..], [VmmAction::Trigger { op: VmmOp::AttachNic, .. }]));
    }

    #[test]
    fn sg_attach_on_running_vm_queues_a_group_update() {
        let f = Fixture::new();
        let vnid = f.pools.vnets.allocate(VirtualNetwork::default()).unwrap();
        let sgid = f.pools.secgroups.allocate(SecurityGroup::default()).unwrap();
        let vid = f.vm_in(VmState::Poweroff, LcmState::LcmInit);
        f.dm
            .attach_nic(vid, nic_on(vnid), &ra())
            .unwrap();
        f.pools.vms.get(vid).unwrap().set_state(VmState::Active);
        f.pools.vms.get(vid).unwrap().set_lcm_state(LcmState::Running);

        f.dm.attach_sg(vid, 0, sgid, &ra()).unwrap();

        let sg = f.pools.secgroups.get_ro(sgid).unwrap();
        assert!(sg.members.outdated.contains(&vid));
        assert!(matches!(f.drain_lcm()[..], [LcmAction::Updatesg(id)] if id == sgid));
        assert!(f.dm.attach_sg(vid, 0, sgid, &ra()).is_err());

        f.dm.detach_sg(vid, 0, sgid, &ra()).unwrap();
        assert!(!f.pools.secgroups.get_ro(sgid).unwrap().members.contains(vid));
        assert!(matches!(
            f.drain_vmm()[..],
            [VmmAction::Trigger { op: VmmOp::UpdateSg { sgid: id }, .. }] if id == sgid
        ));
    }

    #[test]
    fn sg_detach_pushes_remaining_rules_through_a_group_queue() {
        let f = Fixture::new();
        let vnid = f.pools.vnets.allocate(VirtualNetwork::default()).unwrap();
        let first = f.pools.secgroups.allocate(SecurityGroup::default()).unwrap();
        let second = f.pools.secgroups.allocate(SecurityGroup::default()).unwrap();
        let vid = f.vm_in(VmState::Poweroff, LcmState::LcmInit);
        f.dm.attach_nic(vid, nic_on(vnid), &ra()).unwrap();
        f.dm.attach_sg(vid, 0, first, &ra()).unwrap();
        f.dm.attach_sg(vid, 0, second, &ra()).unwrap();
        f.pools.vms.get(vid).unwrap().set_state(VmState::Active);
        f.pools.vms.get(vid).unwrap().set_lcm_state(LcmState::Running);
        f.drain_lcm();
        f.drain_vmm();

        f.dm.detach_sg(vid, 0, first, &ra()).unwrap();

        assert!(!f.pools.secgroups.get_ro(first).unwrap().members.contains(vid));
        let sg = f.pools.secgroups.get_ro(second).unwrap();
        assert!(sg.members.outdated.contains(&vid));
        assert!(matches!(f.drain_lcm()[..], [LcmAction::Updatesg(id)] if id == second));
        assert!(f.drain_vmm().is_empty());
    }

    #[test]
    fn sg_attach_rejected_while_booting() {
        let f = Fixture::new();
        let vid = f.vm_in(VmState::Active, LcmState::Boot);
        let err = f.dm.attach_sg(vid, 0, 0, &ra()).unwrap_err();
        assert_eq!(err.code(), -2);
    }

    #[test]
    fn disk_resize_must_grow() {
        let f = Fixture::new();
        let vid = f.vm_in(VmState::Poweroff, LcmState::LcmInit);
        f.pools.vms.get(vid).unwrap().disks.push(volatile_disk_with_id(0));

        assert!(f.dm.disk_resize(vid, 0, 512, &ra()).is_err());
        f.dm.disk_resize(vid, 0, 4096, &ra()).unwrap();

        let vm = f.pools.vms.get_ro(vid).unwrap();
        assert_eq!(vm.lcm_state(), LcmState::DiskResizePoweroff);
        assert_eq!(vm.disk(0).unwrap().size(), Some(4096));
        assert!(matches!(
            f.drain_tm()[..],
            [TmAction::Transfer { op: TransferOp::ResizeDisk, .. }]
        ));
    }

    #[test]
    fn saveas_locks_a_new_image() {
        let f = Fixture::new();
        let vid = f.vm_in(VmState::Poweroff, LcmState::LcmInit);
        let mut disk = volatile_disk_with_id(0);
        disk.attrs.replace("TYPE", "FILE");
        disk.attrs.replace("IMAGE_ID", "3");
        disk.attrs.replace("DATASTORE_ID", "1");
        f.pools.vms.get(vid).unwrap().disks.push(disk);

        let image_id = f.dm.disk_saveas(vid, 0, "golden", -1, &ra()).unwrap();

        let image = f.pools.images.get_ro(image_id).unwrap();
        assert_eq!(image.state, ImageState::Locked);
        let vm = f.pools.vms.get_ro(vid).unwrap();
        assert_eq!(vm.lcm_state(), LcmState::HotplugSaveasPoweroff);
        assert_eq!(vm.saveas_disk().map(|r| r.image_id), Some(image_id));
        assert_eq!(f.quotas.ds_usage(0, 1), 1024);
    }

    fn volatile_disk_with_id(id: u32) -> VirtualMachineDisk {
        let mut attrs = volatile_disk();
        attrs.replace("DISK_ID", id.to_string());
        attrs.into()
    }
}
