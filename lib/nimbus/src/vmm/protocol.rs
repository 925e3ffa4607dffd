// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Replies from hypervisor drivers.

use nimbus_types::{LcmState, ObjectId, VmState};
use slog::{debug, error, info, warn};

use super::{VirtualMachineManager, VmmMessage};
use crate::driver::{Message, Status};
use crate::lcm::{DriverStep, LcmAction};
use crate::pool::{MemberSets, Pool, PoolObject};

/// The lifecycle step a reply completes. `None` for replies handled here.
fn reply_step(kind: VmmMessage) -> Option<DriverStep> {
    let step = match kind {
        VmmMessage::Deploy | VmmMessage::Restore | VmmMessage::Migrate => DriverStep::Deploy,
        VmmMessage::Shutdown | VmmMessage::Cancel => DriverStep::Shutdown,
        VmmMessage::Save => DriverStep::Save,
        VmmMessage::AttachDisk => DriverStep::Attach,
        VmmMessage::DetachDisk => DriverStep::Detach,
        VmmMessage::AttachNic => DriverStep::AttachNic,
        VmmMessage::DetachNic => DriverStep::DetachNic,
        VmmMessage::SnapshotCreate => DriverStep::SnapshotCreate,
        VmmMessage::SnapshotRevert => DriverStep::SnapshotRevert,
        VmmMessage::SnapshotDelete => DriverStep::SnapshotDelete,
        VmmMessage::DiskSnapshotCreate | VmmMessage::DiskSnapshotDelete => {
            DriverStep::DiskSnapshot
        }
        VmmMessage::ResizeDisk => DriverStep::DiskResize,
        VmmMessage::UpdateConf => DriverStep::UpdateConf,
        VmmMessage::Resize => DriverStep::Resize,
        VmmMessage::Backup => DriverStep::Backup,
        VmmMessage::Cleanup => DriverStep::Cleanup,
        VmmMessage::Reboot
        | VmmMessage::Reset
        | VmmMessage::BackupCancel
        | VmmMessage::UpdateSg
        | VmmMessage::UpdateNic
        | VmmMessage::DriverCancel
        | VmmMessage::Poll
        | VmmMessage::Log => return None,
    };
    Some(step)
}

impl VirtualMachineManager {
    pub(super) fn protocol(&self, driver: &str, line: &str) {
        let msg: Message<VmmMessage> = match line.parse() {
            Ok(msg) => msg,
            Err(e) => {
                warn!(self.log, "malformed hypervisor driver message";
                    "driver" => driver, "line" => line, "error" => %e);
                return;
            }
        };

        match msg.kind {
            VmmMessage::Log => {
                let text = msg.payload.as_str();
                match &msg.status {
                    Status::Other(s) if s == "E" => {
                        error!(self.log, "{}", text; "vm_id" => msg.oid, "driver" => driver)
                    }
                    Status::Other(s) if s == "D" => {
                        debug!(self.log, "{}", text; "vm_id" => msg.oid, "driver" => driver)
                    }
                    _ => info!(self.log, "{}", text; "vm_id" => msg.oid, "driver" => driver),
                }
            }
            VmmMessage::DriverCancel => {
                debug!(self.log, "driver cancel acknowledged"; "vm_id" => msg.oid);
            }
            VmmMessage::Poll => self.poll_reply(&msg),
            VmmMessage::UpdateSg => self.member_reply(&msg, &self.pools.secgroups, true),
            VmmMessage::UpdateNic => self.member_reply(&msg, &self.pools.vnets, false),
            kind => self.operation_reply(kind, &msg),
        }
    }

    fn operation_reply(&self, kind: VmmMessage, msg: &Message<VmmMessage>) {
        let vid = msg.oid;
        let Some(mut vm) = self.pools.vms.get(vid) else {
            warn!(self.log, "hypervisor reply for unknown VM"; "vm_id" => vid);
            return;
        };

        if vm.lcm_state() == LcmState::LcmInit {
            info!(self.log, "Ignored: {} {}", kind, msg.status; "vm_id" => vid);
            return;
        }

        let success = msg.is_success();
        if !success {
            if let Some(diag) = msg.diagnostic() {
                vm.set_template_error_message(&format!("Error executing {kind}: {diag}"));
                self.persist(&vm);
            }
            error!(self.log, "hypervisor operation failed"; "vm_id" => vid,
                "operation" => %kind, "reason" => msg.diagnostic().unwrap_or("-"));
        }
        drop(vm);

        let Some(step) = reply_step(kind) else {
            info!(self.log, "hypervisor operation finished"; "vm_id" => vid,
                "operation" => %kind, "success" => success);
            return;
        };
        if success {
            self.lcm.success_with(step, vid, msg.payload.trim().to_string());
        } else {
            self.lcm.failure(step, vid);
        }
    }

    /// Monitoring: the payload names the state the hypervisor sees.
    fn poll_reply(&self, msg: &Message<VmmMessage>) {
        let vid = msg.oid;
        if !msg.is_success() {
            debug!(self.log, "poll failed"; "vm_id" => vid);
            return;
        }
        let Some(vm) = self.pools.vms.get_ro(vid) else {
            return;
        };
        if !matches!(vm.state(), VmState::Active | VmState::Poweroff) {
            return;
        }
        let action = match msg.payload.split_whitespace().next() {
            Some("RUNNING") => LcmAction::MonitorRunning(vid),
            Some("POWEROFF") => LcmAction::MonitorPoweroff(vid),
            Some("UNKNOWN") => LcmAction::MonitorUnknown(vid),
            other => {
                warn!(self.log, "unknown poll state"; "vm_id" => vid,
                    "state" => other.unwrap_or(""));
                return;
            }
        };
        self.lcm.trigger(action);
    }

    /// A security group or network update finished on one VM. The payload
    /// starts with the object id.
    fn member_reply<T: PoolObject + MemberSets>(
        &self,
        msg: &Message<VmmMessage>,
        pool: &Pool<T>,
        secgroup: bool,
    ) {
        let vid = msg.oid;
        let Some(id) = msg
            .payload
            .split_whitespace()
            .next()
            .and_then(|s| s.parse::<ObjectId>().ok())
        else {
            warn!(self.log, "update reply without object id"; "vm_id" => vid,
                "payload" => &msg.payload);
            return;
        };
        let Some(mut obj) = pool.get(id) else {
            warn!(self.log, "updated object is gone"; "vm_id" => vid, "oid" => id);
            return;
        };
        if !obj.members().updating.contains(&vid) {
            info!(self.log, "Ignored: {} {}", msg.kind, msg.status; "vm_id" => vid);
            return;
        }
        if msg.is_success() {
            obj.members_mut().add_vm(vid);
        } else {
            error!(self.log, "update failed"; "vm_id" => vid, "oid" => id,
                "reason" => msg.diagnostic().unwrap_or("-"));
            obj.members_mut().add_error(vid);
        }
        if let Err(e) = pool.update(&obj) {
            error!(self.log, "failed to persist member sets"; "oid" => id,
                "error" => %e);
        }
        drop(obj);

        if secgroup {
            self.lcm.updatesg(id);
        } else {
            self.lcm.updatevnet(id);
        }
    }
}
