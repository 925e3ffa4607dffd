// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hypervisor (memory) snapshots and disk snapshots.

use nimbus_types::{LcmState, ObjectId, SnapshotOp, VirtualMachine, VmAction, VmState};

use super::{resources, DispatchError, DispatchManager};
use crate::tm::{SnapshotCommand, TransferOp};
use crate::vmm::VmmOp;
use crate::{now, RequestAttributes};

fn running(state: VmState, lcm: LcmState) -> bool {
    state == VmState::Active && lcm == LcmState::Running
}

fn snapshot_exists(vm: &VirtualMachine, snap_id: u32) -> Result<(), DispatchError> {
    if vm.snapshots.iter().any(|s| s.snapshot_id == snap_id) {
        Ok(())
    } else {
        Err(DispatchError::Rejected(format!(
            "VM {} has no snapshot {snap_id}",
            vm.oid
        )))
    }
}

impl DispatchManager {
    /// Takes a hypervisor snapshot of a running VM. Returns the snapshot id.
    pub fn snapshot_create(
        &self,
        vid: ObjectId,
        name: &str,
        ra: &RequestAttributes,
    ) -> Result<u32, DispatchError> {
        let mut vm = self.check("snapshot-create", vid, running)?;
        let snap_id = vm.new_snapshot(name, now());
        vm.set_lcm_state(LcmState::HotplugSnapshot);
        self.close_cp_history(&mut vm, VmAction::SnapshotCreate, ra);
        self.update(&vm);
        drop(vm);

        self.vmm.trigger(vid, VmmOp::SnapshotCreate);
        Ok(snap_id)
    }

    pub fn snapshot_revert(
        &self,
        vid: ObjectId,
        snap_id: u32,
        ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        let mut vm = self.check("snapshot-revert", vid, running)?;
        snapshot_exists(&vm, snap_id)?;
        vm.set_snapshot_pending(snap_id, SnapshotOp::Revert);
        vm.set_lcm_state(LcmState::HotplugSnapshot);
        self.close_cp_history(&mut vm, VmAction::SnapshotRevert, ra);
        self.update(&vm);
        drop(vm);

        self.vmm.trigger(vid, VmmOp::SnapshotRevert);
        Ok(())
    }

    pub fn snapshot_delete(
        &self,
        vid: ObjectId,
        snap_id: u32,
        ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        let mut vm = self.check("snapshot-delete", vid, running)?;
        snapshot_exists(&vm, snap_id)?;
        vm.set_snapshot_pending(snap_id, SnapshotOp::Delete);
        vm.set_lcm_state(LcmState::HotplugSnapshot);
        self.close_cp_history(&mut vm, VmAction::SnapshotDelete, ra);
        self.update(&vm);
        drop(vm);

        self.vmm.trigger(vid, VmmOp::SnapshotDelete);
        Ok(())
    }

    /// Snapshots disk `disk_id`. A running VM is snapshotted by its
    /// hypervisor driver, a powered-off or suspended one by the transfer
    /// driver. Returns the new disk snapshot id.
    pub fn disk_snapshot_create(
        &self,
        vid: ObjectId,
        disk_id: u32,
        name: &str,
        ra: &RequestAttributes,
    ) -> Result<i64, DispatchError> {
        let mut vm = self.check("disk-snapshot-create", vid, |state, lcm| {
            running(state, lcm) || matches!(state, VmState::Poweroff | VmState::Suspended)
        })?;
        let Some(disk) = vm.disk_mut(disk_id) else {
            return Err(DispatchError::Rejected(format!("VM {vid} has no disk {disk_id}")));
        };
        if disk.is_volatile() {
            return Err(DispatchError::Rejected(format!(
                "Cannot snapshot volatile disk {disk_id}"
            )));
        }
        let size = disk.size().unwrap_or(0);
        let snap_id = disk.snapshots.create(name, size, now());
        let charge = resources::disk_ds_usage(disk).map(|(ds_id, _)| ds_id);

        let from = vm.state();
        let next = match from {
            VmState::Poweroff => LcmState::DiskSnapshotPoweroff,
            VmState::Suspended => LcmState::DiskSnapshotSuspended,
            _ => LcmState::DiskSnapshot,
        };
        vm.set_state(VmState::Active);
        vm.set_lcm_state(next);
        vm.set_snapshot_disk(disk_id, snap_id);
        self.close_cp_history(&mut vm, VmAction::DiskSnapshotCreate, ra);
        self.update(&vm);
        let (uid, gid) = (vm.uid, vm.gid);
        drop(vm);

        if let Some(ds_id) = charge {
            self.quotas.ds_add(uid, gid, ds_id, size as i64);
        }
        if from == VmState::Active {
            self.vmm.trigger(vid, VmmOp::DiskSnapshotCreate);
        } else {
            self.tm.trigger(vid, TransferOp::Snapshot(SnapshotCommand::Create));
        }
        Ok(snap_id)
    }

    pub fn disk_snapshot_revert(
        &self,
        vid: ObjectId,
        disk_id: u32,
        snap_id: i64,
        ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        let mut vm = self.check("disk-snapshot-revert", vid, |state, _| {
            matches!(state, VmState::Poweroff | VmState::Suspended)
        })?;
        let Some(disk) = vm.disk(disk_id) else {
            return Err(DispatchError::Rejected(format!("VM {vid} has no disk {disk_id}")));
        };
        if !disk.snapshots.snapshots.contains_key(&snap_id) {
            return Err(DispatchError::Rejected(format!(
                "Disk {disk_id} has no snapshot {snap_id}"
            )));
        }

        let next = if vm.state() == VmState::Poweroff {
            LcmState::DiskSnapshotRevertPoweroff
        } else {
            LcmState::DiskSnapshotRevertSuspended
        };
        vm.set_state(VmState::Active);
        vm.set_lcm_state(next);
        vm.set_snapshot_disk(disk_id, snap_id);
        self.close_cp_history(&mut vm, VmAction::DiskSnapshotRevert, ra);
        self.update(&vm);
        drop(vm);

        self.tm.trigger(vid, TransferOp::Snapshot(SnapshotCommand::Revert));
        Ok(())
    }

    pub fn disk_snapshot_delete(
        &self,
        vid: ObjectId,
        disk_id: u32,
        snap_id: i64,
        ra: &RequestAttributes,
    ) -> Result<(), DispatchError> {
        let mut vm = self.check("disk-snapshot-delete", vid, |state, lcm| {
            running(state, lcm) || matches!(state, VmState::Poweroff | VmState::Suspended)
        })?;
        let Some(disk) = vm.disk(disk_id) else {
            return Err(DispatchError::Rejected(format!("VM {vid} has no disk {disk_id}")));
        };
        disk.snapshots.test_delete(snap_id).map_err(DispatchError::Rejected)?;

        let next = match vm.state() {
            VmState::Poweroff => LcmState::DiskSnapshotDeletePoweroff,
            VmState::Suspended => LcmState::DiskSnapshotDeleteSuspended,
            _ => LcmState::DiskSnapshotDelete,
        };
        vm.set_state(VmState::Active);
        vm.set_lcm_state(next);
        vm.set_snapshot_disk(disk_id, snap_id);
        self.close_cp_history(&mut vm, VmAction::DiskSnapshotDelete, ra);
        self.update(&vm);
        drop(vm);

        self.tm.trigger(vid, TransferOp::Snapshot(SnapshotCommand::Delete));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_fixture::Fixture;
    use super::*;
    use crate::tm::TmAction;
    use crate::vmm::VmmAction;
    use nimbus_types::{PendingOp, VectorAttribute, VirtualMachineDisk};

    fn ra() -> RequestAttributes {
        RequestAttributes::new(0, 0, 1)
    }

    fn image_disk(f: &Fixture, vid: ObjectId) {
        let disk = VirtualMachineDisk::from(VectorAttribute::from_pairs(
            "DISK",
            [("DISK_ID", "0"), ("IMAGE_ID", "0"), ("DATASTORE_ID", "1"), ("SIZE", "2048")],
        ));
        f.pools.vms.get(vid).unwrap().disks.push(disk);
    }

    #[test]
    fn vm_snapshot_create_and_delete() {
        let f = Fixture::new();
        let vid = f.vm_in(VmState::Active, LcmState::Running);

        let snap = f.dm.snapshot_create(vid, "", &ra()).unwrap();
        let vm = f.pools.vms.get_ro(vid).unwrap();
        assert_eq!(vm.lcm_state(), LcmState::HotplugSnapshot);
        assert_eq!(vm.pending_snapshot().map(|s| s.name.as_str()), Some("snapshot-0"));
        assert!(matches!(
            f.drain_vmm()[..],
            [VmmAction::Trigger { op: VmmOp::SnapshotCreate, .. }]
        ));

        // Busy until the driver answers.
        assert!(f.dm.snapshot_delete(vid, snap, &ra()).is_err());
        assert!(f.dm.snapshot_revert(vid, 9, &ra()).is_err());
    }

    #[test]
    fn disk_snapshot_on_poweroff_goes_to_transfer_driver() {
        let f = Fixture::new();
        let vid = f.vm_in(VmState::Poweroff, LcmState::LcmInit);
        image_disk(&f, vid);

        let snap = f.dm.disk_snapshot_create(vid, 0, "before-upgrade", &ra()).unwrap();

        let vm = f.pools.vms.get_ro(vid).unwrap();
        assert_eq!(vm.lcm_state(), LcmState::DiskSnapshotPoweroff);
        assert_eq!(vm.snapshot_disk(), Some((0, snap)));
        assert!(vm.pending_disk(PendingOp::Snapshot).is_some());
        assert_eq!(f.quotas.ds_usage(0, 1), 2048);
        assert!(matches!(
            f.drain_tm()[..],
            [TmAction::Transfer { op: TransferOp::Snapshot(SnapshotCommand::Create), .. }]
        ));
    }

    #[test]
    fn disk_snapshot_on_running_vm_goes_to_hypervisor() {
        let f = Fixture::new();
        let vid = f.vm_in(VmState::Active, LcmState::Running);
        image_disk(&f, vid);

        f.dm.disk_snapshot_create(vid, 0, "", &ra()).unwrap();

        assert_eq!(f.state(vid), (VmState::Active, LcmState::DiskSnapshot));
        assert!(matches!(
            f.drain_vmm()[..],
            [VmmAction::Trigger { op: VmmOp::DiskSnapshotCreate, .. }]
        ));
    }

    #[test]
    fn disk_snapshot_revert_and_delete_need_an_existing_snapshot() {
        let f = Fixture::new();
        let vid = f.vm_in(VmState::Suspended, LcmState::LcmInit);
        image_disk(&f, vid);

        assert!(f.dm.disk_snapshot_revert(vid, 0, 0, &ra()).is_err());
        assert!(f.dm.disk_snapshot_delete(vid, 0, 0, &ra()).is_err());
        assert_eq!(f.state(vid), (VmState::Suspended, LcmState::LcmInit));

        f.pools.vms.get(vid).unwrap().disk_mut(0).unwrap().snapshots.create("s", 2048, 0);
        f.dm.disk_snapshot_revert(vid, 0, 0, &ra()).unwrap();
        assert_eq!(f.state(vid), (VmState::Active, LcmState::DiskSnapshotRevertSuspended));
        assert!(matches!(
            f.drain_tm()[..],
            [TmAction::Transfer { op: TransferOp::Snapshot(SnapshotCommand::Revert), .. }]
        ));
    }

    #[test]
    fn volatile_disks_cannot_be_snapshotted() {
        let f = Fixture::new();
        let vid = f.vm_in(VmState::Poweroff, LcmState::LcmInit);
        let disk = VirtualMachineDisk::from(VectorAttribute::from_pairs(
            "DISK",
            [("DISK_ID", "0"), ("TYPE", "SWAP"), ("SIZE", "512")],
        ));
        f.pools.vms.get(vid).unwrap().disks.push(disk);

        assert!(f.dm.disk_snapshot_create(vid, 0, "", &ra()).is_err());
        assert_eq!(f.state(vid), (VmState::Poweroff, LcmState::LcmInit));
    }
}
