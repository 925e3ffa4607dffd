// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The virtual machine record and the helpers the orchestrator uses to move
//! it between states.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{
    HostCapacity, LcmState, ObjectId, Timestamp, VectorAttribute, VmAction, VmState,
};

mod backup;
mod disk;
mod history;
mod nic;
mod snapshot;

pub use backup::{Backups, PendingResize, RestoreRequest};
pub use disk::VirtualMachineDisk;
pub use history::History;
pub use nic::VirtualMachineNic;
pub use snapshot::{DiskSnapshot, DiskSnapshots, SnapshotOp, VmSnapshot};

/// Transient marker placed on a disk or NIC while a driver operation on it
/// is in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum PendingOp {
    Attach,
    Detach,
    Resize,
    Snapshot,
    SaveAs,
}

impl PendingOp {
    fn flag(self) -> &'static str {
        match self {
            PendingOp::Attach => "ATTACH",
            PendingOp::Detach => "DETACH",
            PendingOp::Resize => "RESIZE",
            PendingOp::Snapshot => "DISK_SNAPSHOT_ACTIVE",
            PendingOp::SaveAs => "HOTPLUG_SAVE_AS_ACTIVE",
        }
    }

    /// Companion attributes removed together with the flag.
    fn companions(self) -> &'static [&'static str] {
        match self {
            PendingOp::Attach | PendingOp::Detach => &[],
            PendingOp::Resize => &["SIZE_PREV"],
            PendingOp::Snapshot => &["DISK_SNAPSHOT_ID"],
            PendingOp::SaveAs => &[
                "HOTPLUG_SAVE_AS",
                "HOTPLUG_SAVE_AS_SOURCE",
                "HOTPLUG_SAVE_AS_SNAPSHOT_ID",
            ],
        }
    }
}

/// A disk save-as operation in flight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaveAsRequest {
    pub disk_id: u32,
    pub image_id: ObjectId,
    pub source: String,
    /// -1 saves the current disk contents rather than a snapshot.
    pub snapshot_id: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub oid: ObjectId,
    pub uid: ObjectId,
    pub gid: ObjectId,
    pub name: String,

    state: VmState,
    lcm_state: LcmState,

    /// The scheduler should look for a new host for this VM.
    pub resched: bool,
    /// Hypervisor identifier, known once the VM is deployed.
    pub deploy_id: Option<String>,
    /// Adopted from an unmanaged hypervisor instance.
    pub imported: bool,

    pub cpu: f64,
    pub vcpu: u32,
    /// Memory in MiB.
    pub memory: u64,

    pub os: Option<VectorAttribute>,
    pub context: Option<VectorAttribute>,
    pub graphics: Option<VectorAttribute>,
    /// Copies of the rules of every security group the NICs reference.
    pub sg_rules: Vec<VectorAttribute>,

    pub disks: Vec<VirtualMachineDisk>,
    pub nics: Vec<VirtualMachineNic>,
    pub snapshots: Vec<VmSnapshot>,
    pub backups: Backups,
    pub pending_resize: Option<PendingResize>,

    history: Option<History>,
    previous_history: Option<History>,

    pub vrouter_id: Option<ObjectId>,
    /// Affinity group id and role.
    pub vmgroup: Option<(ObjectId, String)>,

    /// Last driver diagnostic.
    pub error_message: Option<String>,
    pub stime: Timestamp,
    pub etime: Timestamp,
}

impl VirtualMachine {
    pub fn new(oid: ObjectId, uid: ObjectId, gid: ObjectId, name: &str) -> Self {
        Self {
            oid,
            uid,
            gid,
            name: name.to_string(),
            vcpu: 1,
            ..Default::default()
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn lcm_state(&self) -> LcmState {
        self.lcm_state
    }

    pub fn set_state(&mut self, state: VmState) {
        self.state = state;
    }

    pub fn set_lcm_state(&mut self, state: LcmState) {
        self.lcm_state = state;
    }

    /// `ACTIVE/RUNNING` style label for logs and operator output.
    pub fn state_str(&self) -> String {
        if self.state == VmState::Active {
            format!("{}/{}", self.state, self.lcm_state)
        } else {
            self.state.to_string()
        }
    }

    // History records

    pub fn has_history(&self) -> bool {
        self.history.is_some()
    }

    pub fn has_previous_history(&self) -> bool {
        self.previous_history.is_some()
    }

    pub fn history(&self) -> Option<&History> {
        self.history.as_ref()
    }

    pub fn history_mut(&mut self) -> Option<&mut History> {
        self.history.as_mut()
    }

    pub fn previous_history(&self) -> Option<&History> {
        self.previous_history.as_ref()
    }

    pub fn previous_history_mut(&mut self) -> Option<&mut History> {
        self.previous_history.as_mut()
    }

    fn next_seq(&self) -> u32 {
        self.history.as_ref().map_or(0, |h| h.seq + 1)
    }

    /// Opens a new history record; the current one becomes the previous.
    pub fn add_history(&mut self, mut record: History) {
        record.seq = self.next_seq();
        self.previous_history = self.history.take();
        self.history = Some(record);
    }

    /// Opens a new record on the same host as the current one.
    pub fn cp_history(&mut self) {
        if let Some(current) = &self.history {
            let record = current.reopen(current.seq + 1);
            self.previous_history = self.history.replace(record);
        }
    }

    /// Opens a new record back on the previous host.
    pub fn cp_previous_history(&mut self) {
        let (Some(prev), Some(current)) = (&self.previous_history, &self.history)
        else {
            return;
        };
        let record = prev.reopen(current.seq + 1);
        self.previous_history = self.history.replace(record);
    }

    /// Discards the history records, e.g. when a VM goes back to pending.
    pub fn clear_history(&mut self) {
        self.history = None;
        self.previous_history = None;
    }

    pub fn hid(&self) -> Option<ObjectId> {
        self.history.as_ref().map(|h| h.hid)
    }

    pub fn previous_hid(&self) -> Option<ObjectId> {
        self.previous_history.as_ref().map(|h| h.hid)
    }

    pub fn hostname(&self) -> &str {
        self.history.as_ref().map_or("", |h| h.hostname.as_str())
    }

    pub fn is_public_cloud(&self) -> bool {
        self.history.as_ref().is_some_and(|h| h.public_cloud)
    }

    /// Whether quotas currently count this VM as running. Operations on a
    /// powered-off, stopped or undeployed VM move it to ACTIVE without
    /// counting it as running again.
    pub fn counts_running(&self) -> bool {
        use LcmState::*;
        match self.state {
            VmState::Poweroff | VmState::Stopped | VmState::Undeployed => false,
            VmState::Active => match self.lcm_state {
                PrologMigratePoweroff | PrologMigratePoweroffFailure => matches!(
                    self.previous_history.as_ref().map(|h| h.action),
                    Some(VmAction::PoffMigrate | VmAction::PoffHardMigrate)
                ),
                HotplugPrologPoweroff
                | HotplugEpilogPoweroff
                | HotplugNicPoweroff
                | HotplugSaveasPoweroff
                | HotplugSaveasStopped
                | HotplugSaveasUndeployed
                | DiskSnapshotPoweroff
                | DiskSnapshotRevertPoweroff
                | DiskSnapshotDeletePoweroff
                | DiskResizePoweroff
                | DiskResizeUndeployed
                | BackupPoweroff
                | Restore => false,
                _ => true,
            },
            _ => true,
        }
    }

    /// Resources this VM reserves on its host.
    pub fn capacity(&self) -> HostCapacity {
        HostCapacity {
            vm_id: self.oid,
            cpu: (self.cpu * 100.0).round() as u64,
            memory: self.memory * 1024,
            disk: self.disks.iter().map(VirtualMachineDisk::system_size).sum(),
        }
    }

    /// Stores a driver diagnostic. Payloads starting with `-` carry none.
    pub fn set_template_error_message(&mut self, msg: &str) {
        let msg = msg.trim();
        if msg.is_empty() || msg.starts_with('-') {
            return;
        }
        self.error_message = Some(msg.to_string());
    }

    pub fn clear_template_error_message(&mut self) {
        self.error_message = None;
    }

    // Disks

    pub fn disk(&self, disk_id: u32) -> Option<&VirtualMachineDisk> {
        self.disks.iter().find(|d| d.disk_id() == Some(disk_id))
    }

    pub fn disk_mut(&mut self, disk_id: u32) -> Option<&mut VirtualMachineDisk> {
        self.disks.iter_mut().find(|d| d.disk_id() == Some(disk_id))
    }

    pub fn next_disk_id(&self) -> u32 {
        self.disks
            .iter()
            .filter_map(VirtualMachineDisk::disk_id)
            .max()
            .map_or(0, |id| id + 1)
    }

    pub fn set_disk_pending(&mut self, disk_id: u32, op: PendingOp) -> bool {
        match self.disk_mut(disk_id) {
            Some(disk) => {
                disk.attrs.replace(op.flag(), "YES");
                true
            }
            None => false,
        }
    }

    pub fn pending_disk(&self, op: PendingOp) -> Option<&VirtualMachineDisk> {
        self.disks.iter().find(|d| d.attrs.is_yes(op.flag()))
    }

    pub fn pending_disk_mut(&mut self, op: PendingOp) -> Option<&mut VirtualMachineDisk> {
        self.disks.iter_mut().find(|d| d.attrs.is_yes(op.flag()))
    }

    /// Clears the marker (and its companion attributes), returning the disk id.
    pub fn clear_disk_pending(&mut self, op: PendingOp) -> Option<u32> {
        let disk = self.pending_disk_mut(op)?;
        disk.attrs.remove(op.flag());
        for key in op.companions() {
            disk.attrs.remove(key);
        }
        disk.disk_id()
    }

    /// Removes the disk carrying the marker from the VM.
    pub fn take_pending_disk(&mut self, op: PendingOp) -> Option<VirtualMachineDisk> {
        let pos = self.disks.iter().position(|d| d.attrs.is_yes(op.flag()))?;
        let mut disk = self.disks.remove(pos);
        disk.attrs.remove(op.flag());
        Some(disk)
    }

    /// Records a resize to `size` MiB, keeping the old size for rollback.
    pub fn set_disk_resize(&mut self, disk_id: u32, size: u64) -> bool {
        let Some(disk) = self.disk_mut(disk_id) else {
            return false;
        };
        let prev = disk.size().unwrap_or(0);
        disk.attrs.replace("SIZE_PREV", prev.to_string());
        disk.attrs.replace("SIZE", size.to_string());
        disk.attrs.replace(PendingOp::Resize.flag(), "YES");
        true
    }

    /// Ends a resize. On rollback the old size is restored. Returns the disk
    /// id with the old and new sizes.
    pub fn end_disk_resize(&mut self, rollback: bool) -> Option<(u32, u64, u64)> {
        let disk = self.pending_disk_mut(PendingOp::Resize)?;
        let new = disk.size().unwrap_or(0);
        let old: u64 = disk.attrs.get("SIZE_PREV").unwrap_or(new);
        if rollback {
            disk.attrs.replace("SIZE", old.to_string());
        }
        let id = disk.disk_id()?;
        self.clear_disk_pending(PendingOp::Resize);
        Some((id, old, new))
    }

    pub fn set_snapshot_disk(&mut self, disk_id: u32, snap_id: i64) -> bool {
        let Some(disk) = self.disk_mut(disk_id) else {
            return false;
        };
        disk.attrs.replace(PendingOp::Snapshot.flag(), "YES");
        disk.attrs.replace("DISK_SNAPSHOT_ID", snap_id.to_string());
        true
    }

    /// Disk and snapshot id of the disk snapshot operation in flight.
    pub fn snapshot_disk(&self) -> Option<(u32, i64)> {
        let disk = self.pending_disk(PendingOp::Snapshot)?;
        Some((disk.disk_id()?, disk.attrs.get("DISK_SNAPSHOT_ID")?))
    }

    pub fn set_saveas_disk(&mut self, req: &SaveAsRequest) -> bool {
        let Some(disk) = self.disk_mut(req.disk_id) else {
            return false;
        };
        disk.attrs.replace(PendingOp::SaveAs.flag(), "YES");
        disk.attrs.replace("HOTPLUG_SAVE_AS", req.image_id.to_string());
        disk.attrs.replace("HOTPLUG_SAVE_AS_SOURCE", req.source.clone());
        disk.attrs
            .replace("HOTPLUG_SAVE_AS_SNAPSHOT_ID", req.snapshot_id.to_string());
        true
    }

    pub fn saveas_disk(&self) -> Option<SaveAsRequest> {
        let disk = self.pending_disk(PendingOp::SaveAs)?;
        Some(SaveAsRequest {
            disk_id: disk.disk_id()?,
            image_id: disk.attrs.get("HOTPLUG_SAVE_AS")?,
            source: disk.attrs.vector_value("HOTPLUG_SAVE_AS_SOURCE")?.to_string(),
            snapshot_id: disk.attrs.get("HOTPLUG_SAVE_AS_SNAPSHOT_ID").unwrap_or(-1),
        })
    }

    // NICs

    pub fn nic(&self, nic_id: u32) -> Option<&VirtualMachineNic> {
        self.nics.iter().find(|n| n.nic_id() == Some(nic_id))
    }

    pub fn nic_mut(&mut self, nic_id: u32) -> Option<&mut VirtualMachineNic> {
        self.nics.iter_mut().find(|n| n.nic_id() == Some(nic_id))
    }

    pub fn next_nic_id(&self) -> u32 {
        self.nics
            .iter()
            .filter_map(VirtualMachineNic::nic_id)
            .max()
            .map_or(0, |id| id + 1)
    }

    pub fn set_nic_pending(&mut self, nic_id: u32, op: PendingOp) -> bool {
        match self.nic_mut(nic_id) {
            Some(nic) => {
                nic.attrs.replace(op.flag(), "YES");
                true
            }
            None => false,
        }
    }

    pub fn pending_nic(&self, op: PendingOp) -> Option<&VirtualMachineNic> {
        self.nics.iter().find(|n| n.attrs.is_yes(op.flag()))
    }

    pub fn clear_nic_pending(&mut self, op: PendingOp) -> Option<u32> {
        let nic = self.nics.iter_mut().find(|n| n.attrs.is_yes(op.flag()))?;
        nic.attrs.remove(op.flag());
        nic.nic_id()
    }

    pub fn take_pending_nic(&mut self, op: PendingOp) -> Option<VirtualMachineNic> {
        let pos = self.nics.iter().position(|n| n.attrs.is_yes(op.flag()))?;
        let mut nic = self.nics.remove(pos);
        nic.attrs.remove(op.flag());
        Some(nic)
    }

    // Security groups

    /// Every security group referenced by any NIC.
    pub fn security_groups(&self) -> BTreeSet<ObjectId> {
        self.nics.iter().flat_map(|n| n.security_groups()).collect()
    }

    /// Replaces the copy of the rules of group `sgid`.
    pub fn set_sg_rules(&mut self, sgid: ObjectId, rules: Vec<VectorAttribute>) {
        self.remove_sg_rules(sgid);
        self.sg_rules.extend(rules);
    }

    pub fn remove_sg_rules(&mut self, sgid: ObjectId) {
        self.sg_rules
            .retain(|r| r.get::<ObjectId>("SECURITY_GROUP_ID") != Some(sgid));
    }

    // VM snapshots

    pub fn new_snapshot(&mut self, name: &str, time: Timestamp) -> u32 {
        let id = self.snapshots.iter().map(|s| s.snapshot_id + 1).max().unwrap_or(0);
        let name = if name.is_empty() { format!("snapshot-{id}") } else { name.to_string() };
        self.snapshots.push(VmSnapshot {
            snapshot_id: id,
            name,
            hypervisor_id: String::new(),
            time,
            pending: Some(SnapshotOp::Create),
        });
        id
    }

    pub fn set_snapshot_pending(&mut self, snap_id: u32, op: SnapshotOp) -> bool {
        match self.snapshots.iter_mut().find(|s| s.snapshot_id == snap_id) {
            Some(snap) => {
                snap.pending = Some(op);
                true
            }
            None => false,
        }
    }

    pub fn pending_snapshot(&self) -> Option<&VmSnapshot> {
        self.snapshots.iter().find(|s| s.pending.is_some())
    }

    pub fn clear_snapshot_pending(&mut self) {
        for snap in &mut self.snapshots {
            snap.pending = None;
        }
    }

    pub fn remove_pending_snapshot(&mut self) -> Option<VmSnapshot> {
        let pos = self.snapshots.iter().position(|s| s.pending.is_some())?;
        Some(self.snapshots.remove(pos))
    }

    /// Drops every hypervisor snapshot, used when they cannot survive a
    /// host change.
    pub fn delete_snapshots(&mut self) {
        self.snapshots.clear();
    }

    // Graphics

    pub fn vnc_port(&self) -> Option<u32> {
        let g = self.graphics.as_ref()?;
        if g.vector_value("TYPE")?.eq_ignore_ascii_case("VNC") {
            g.get("PORT")
        } else {
            None
        }
    }

    pub fn clear_vnc_port(&mut self) {
        if let Some(g) = self.graphics.as_mut() {
            g.remove("PORT");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(id: u32, pairs: &[(&str, &str)]) -> VirtualMachineDisk {
        let mut attrs =
            VectorAttribute::from_pairs("DISK", pairs.iter().copied());
        attrs.replace("DISK_ID", id.to_string());
        attrs.into()
    }

    #[test]
    fn history_records_chain() {
        let mut vm = VirtualMachine::new(3, 0, 0, "vm");
        assert!(!vm.has_history());
        vm.add_history(History { hid: 1, hostname: "a".into(), ..Default::default() });
        vm.add_history(History { hid: 2, hostname: "b".into(), ..Default::default() });
        assert_eq!(vm.hid(), Some(2));
        assert_eq!(vm.previous_hid(), Some(1));
        assert_eq!(vm.history().unwrap().seq, 1);

        vm.cp_previous_history();
        assert_eq!(vm.hid(), Some(1));
        assert_eq!(vm.previous_hid(), Some(2));
        assert_eq!(vm.history().unwrap().seq, 2);

        vm.cp_history();
        assert_eq!(vm.hid(), Some(1));
        assert_eq!(vm.previous_hid(), Some(1));
    }

    #[test]
    fn running_count_follows_the_state_an_operation_started_from() {
        let mut vm = VirtualMachine::new(4, 0, 0, "vm");
        vm.set_state(VmState::Active);
        vm.set_lcm_state(LcmState::Running);
        assert!(vm.counts_running());
        vm.set_lcm_state(LcmState::DiskResizePoweroff);
        assert!(!vm.counts_running());

        vm.add_history(History { hid: 1, ..Default::default() });
        vm.add_history(History { hid: 2, ..Default::default() });
        vm.set_lcm_state(LcmState::PrologMigratePoweroff);
        vm.previous_history_mut().unwrap().action = VmAction::Migrate;
        assert!(!vm.counts_running());
        vm.previous_history_mut().unwrap().action = VmAction::PoffMigrate;
        assert!(vm.counts_running());

        vm.set_state(VmState::Poweroff);
        assert!(!vm.counts_running());
    }

    #[test]
    fn error_message_ignores_empty_diagnostics() {
        let mut vm = VirtualMachine::new(0, 0, 0, "vm");
        vm.set_template_error_message("- ");
        assert_eq!(vm.error_message, None);
        vm.set_template_error_message("disk full");
        assert_eq!(vm.error_message.as_deref(), Some("disk full"));
    }

    #[test]
    fn disk_resize_rollback_restores_size() {
        let mut vm = VirtualMachine::new(0, 0, 0, "vm");
        vm.disks.push(disk(0, &[("SIZE", "100")]));
        assert!(vm.set_disk_resize(0, 200));
        assert_eq!(vm.end_disk_resize(true), Some((0, 100, 200)));
        assert_eq!(vm.disk(0).unwrap().size(), Some(100));
        assert!(!vm.disk(0).unwrap().attrs.contains("SIZE_PREV"));
        assert!(vm.pending_disk(PendingOp::Resize).is_none());
    }

    #[test]
    fn pending_attach_disk_is_removable() {
        let mut vm = VirtualMachine::new(0, 0, 0, "vm");
        vm.disks.push(disk(0, &[]));
        vm.disks.push(disk(1, &[("ATTACH", "YES")]));
        assert_eq!(vm.next_disk_id(), 2);
        let removed = vm.take_pending_disk(PendingOp::Attach).unwrap();
        assert_eq!(removed.disk_id(), Some(1));
        assert_eq!(vm.disks.len(), 1);
    }

    #[test]
    fn capacity_counts_volatile_and_cloned_disks() {
        let mut vm = VirtualMachine::new(4, 0, 0, "vm");
        vm.cpu = 0.5;
        vm.memory = 128;
        vm.disks.push(disk(0, &[("TYPE", "fs"), ("SIZE", "10")]));
        vm.disks.push(disk(1, &[("IMAGE_ID", "1"), ("CLONE", "YES"), ("SIZE", "5")]));
        vm.disks.push(disk(2, &[("IMAGE_ID", "2"), ("SIZE", "50")]));
        let cap = vm.capacity();
        assert_eq!(cap.cpu, 50);
        assert_eq!(cap.memory, 128 * 1024);
        assert_eq!(cap.disk, 15);
    }
}
