// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;

use base64::Engine;
use nimbus_types::{ObjectId, PendingOp, VirtualMachine};
use serde::{Deserialize, Serialize};

use super::{VmmError, VmmOp};
use crate::tm::commands;
use crate::tm::{DeleteTarget, SnapshotCommand};

/// Body of a hypervisor driver request, sent base64-encoded JSON.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VmmRequest {
    pub vm_id: ObjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_id: Option<String>,
    /// Host the driver acts on.
    pub host: String,
    /// Other end of a migration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migr_host: Option<String>,
    pub system_dir: String,
    pub vmm_mad: String,
    /// Transfer commands the driver runs around the hypervisor operation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tm_commands: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,
    /// The full VM document, for operations that (re)build the domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<serde_json::Value>,
}

impl VmmRequest {
    pub fn build(vm: &VirtualMachine, op: VmmOp, fe: &str) -> Result<Self, VmmError> {
        let h = vm.history().ok_or(VmmError::NoHistory)?;
        let mut req = VmmRequest {
            vm_id: vm.oid,
            deploy_id: vm.deploy_id.clone(),
            host: h.hostname.clone(),
            migr_host: None,
            system_dir: h.system_dir.clone(),
            vmm_mad: h.vmm_mad.clone(),
            ..Default::default()
        };
        let checkpoint = format!("{}/checkpoint", h.system_dir);

        match op {
            VmmOp::Deploy | VmmOp::UpdateConf => {
                req.template = Some(serde_json::to_value(vm)?);
            }
            VmmOp::Save | VmmOp::Restore => {
                req.args.insert("checkpoint".into(), checkpoint);
            }
            VmmOp::Shutdown
            | VmmOp::Cancel
            | VmmOp::Reboot
            | VmmOp::Reset
            | VmmOp::DriverCancel => {}
            VmmOp::Cleanup { previous } => {
                let target = if previous { DeleteTarget::Both } else { DeleteTarget::Current };
                if previous {
                    req.migr_host = vm.previous_history().map(|p| p.hostname.clone());
                }
                req.tm_commands = commands::epilog_delete(vm, fe, target)?;
            }
            VmmOp::Migrate => {
                // Runs on the source host and pushes the VM to the target.
                let prev = vm.previous_history().ok_or(VmmError::NoHistory)?;
                req.migr_host = Some(std::mem::replace(&mut req.host, prev.hostname.clone()));
                req.tm_commands = commands::migrate(vm)?;
            }
            VmmOp::AttachDisk => {
                let disk = vm
                    .pending_disk(PendingOp::Attach)
                    .ok_or(VmmError::NothingPending("disk attach"))?;
                req.args.insert("disk".into(), disk.attrs.to_string());
                req.tm_commands = commands::prolog_attach(vm, fe)?;
            }
            VmmOp::DetachDisk => {
                let disk = vm
                    .pending_disk(PendingOp::Detach)
                    .ok_or(VmmError::NothingPending("disk detach"))?;
                req.args.insert("disk".into(), disk.attrs.to_string());
                req.tm_commands = commands::epilog_detach(vm)?;
            }
            VmmOp::AttachNic | VmmOp::DetachNic => {
                let pending = if op == VmmOp::AttachNic {
                    PendingOp::Attach
                } else {
                    PendingOp::Detach
                };
                let nic = vm
                    .pending_nic(pending)
                    .ok_or(VmmError::NothingPending("NIC hotplug"))?;
                req.args.insert("nic".into(), nic.attrs.to_string());
            }
            VmmOp::SnapshotCreate | VmmOp::SnapshotRevert | VmmOp::SnapshotDelete => {
                let snap = vm
                    .pending_snapshot()
                    .ok_or(VmmError::NothingPending("snapshot"))?;
                req.args.insert("snapshot_id".into(), snap.snapshot_id.to_string());
                if !snap.hypervisor_id.is_empty() {
                    req.args.insert("hypervisor_id".into(), snap.hypervisor_id.clone());
                }
            }
            VmmOp::DiskSnapshotCreate => {
                let (disk_id, snap_id) = vm
                    .snapshot_disk()
                    .ok_or(VmmError::NothingPending("disk snapshot"))?;
                req.args.insert("disk_id".into(), disk_id.to_string());
                req.args.insert("snapshot_id".into(), snap_id.to_string());
                req.tm_commands = commands::disk_snapshot(vm, SnapshotCommand::Create)?;
            }
            VmmOp::DiskResize => {
                let disk = vm
                    .pending_disk(PendingOp::Resize)
                    .ok_or(VmmError::NothingPending("disk resize"))?;
                if let (Some(id), Some(size)) = (disk.disk_id(), disk.size()) {
                    req.args.insert("disk_id".into(), id.to_string());
                    req.args.insert("size".into(), size.to_string());
                }
                req.tm_commands = commands::disk_resize(vm)?;
            }
            VmmOp::UpdateSg { sgid } => {
                req.args.insert("sg_id".into(), sgid.to_string());
                req.template = Some(serde_json::to_value(&vm.sg_rules)?);
            }
            VmmOp::UpdateNic { vnid } => {
                req.args.insert("vnet_id".into(), vnid.to_string());
                let nics: Vec<_> = vm
                    .nics
                    .iter()
                    .filter(|n| n.network_id() == Some(vnid))
                    .map(|n| n.attrs.clone())
                    .collect();
                req.template = Some(serde_json::to_value(nics)?);
            }
            VmmOp::Resize => {
                let r = vm
                    .pending_resize
                    .as_ref()
                    .ok_or(VmmError::NothingPending("resize"))?;
                req.args.insert("cpu".into(), r.cpu.to_string());
                req.args.insert("vcpu".into(), r.vcpu.to_string());
                req.args.insert("memory".into(), r.memory.to_string());
            }
            VmmOp::Backup => {
                let ds = vm
                    .backups
                    .backup_ds_id
                    .ok_or(VmmError::NothingPending("backup"))?;
                req.args.insert("incremental".into(), vm.backups.incremental.to_string());
                req.args.insert(
                    "last_increment_id".into(),
                    vm.backups.last_increment_id.to_string(),
                );
                req.tm_commands = commands::backup(vm, ds)?;
            }
            VmmOp::BackupCancel => {
                req.tm_commands = commands::backup_cancel(vm)?;
            }
        }
        Ok(req)
    }

    pub fn encode(&self) -> Result<String, VmmError> {
        let json = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }

    pub fn decode(payload: &str) -> Result<Self, VmmError> {
        let json = base64::engine::general_purpose::STANDARD.decode(payload.trim())?;
        Ok(serde_json::from_slice(&json)?)
    }
}
