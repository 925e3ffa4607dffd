// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Replies from the transfer driver.

use nimbus_types::LcmState;
use slog::{debug, error, info, warn};

use super::{TmMessage, TransferManager};
use crate::driver::{Message, Status};
use crate::lcm::DriverStep;

/// The step a `TRANSFER` reply completes, given the state the VM is in.
fn transfer_step(state: LcmState) -> Option<DriverStep> {
    use LcmState::*;
    let step = match state {
        Prolog
        | PrologMigrate
        | PrologResume
        | PrologUndeploy
        | PrologMigratePoweroff
        | PrologMigrateSuspend
        | PrologMigrateUnknown => DriverStep::Prolog,

        Epilog | EpilogStop | EpilogUndeploy => DriverStep::Epilog,

        HotplugSaveas
        | HotplugSaveasPoweroff
        | HotplugSaveasSuspended
        | HotplugSaveasUndeployed
        | HotplugSaveasStopped => DriverStep::Saveas,

        HotplugPrologPoweroff => DriverStep::Attach,
        HotplugEpilogPoweroff => DriverStep::Detach,

        DiskSnapshotPoweroff
        | DiskSnapshotRevertPoweroff
        | DiskSnapshotDeletePoweroff
        | DiskSnapshotSuspended
        | DiskSnapshotRevertSuspended
        | DiskSnapshotDeleteSuspended
        | DiskSnapshotDelete => DriverStep::DiskSnapshot,

        DiskResizePoweroff | DiskResizeUndeployed => DriverStep::DiskResize,
        Restore => DriverStep::DiskRestore,
        CleanupResubmit => DriverStep::Cleanup,
        _ => return None,
    };
    Some(step)
}

impl TransferManager {
    pub(super) fn protocol(&self, line: &str) {
        let msg: Message<TmMessage> = match line.parse() {
            Ok(msg) => msg,
            Err(e) => {
                warn!(self.log, "malformed transfer driver message";
                    "line" => line, "error" => %e);
                return;
            }
        };

        match msg.kind {
            TmMessage::Transfer => self.transfer_reply(&msg),
            TmMessage::DriverCancel => {
                debug!(self.log, "driver cancel acknowledged"; "vm_id" => msg.oid);
            }
            TmMessage::Log => {
                let text = msg.payload.as_str();
                match &msg.status {
                    Status::Other(s) if s == "E" => {
                        error!(self.log, "{}", text; "vm_id" => msg.oid)
                    }
                    Status::Other(s) if s == "D" => {
                        debug!(self.log, "{}", text; "vm_id" => msg.oid)
                    }
                    _ => info!(self.log, "{}", text; "vm_id" => msg.oid),
                }
            }
        }
    }

    fn transfer_reply(&self, msg: &Message<TmMessage>) {
        let vid = msg.oid;
        let Some(mut vm) = self.pools.vms.get(vid) else {
            warn!(self.log, "transfer reply for unknown VM"; "vm_id" => vid);
            return;
        };

        let state = vm.lcm_state();
        if state == LcmState::LcmInit {
            info!(self.log, "Ignored: TRANSFER {}", msg.status; "vm_id" => vid);
            return;
        }
        let Some(step) = transfer_step(state) else {
            warn!(self.log, "Wrong state in transfer reply";
                "vm_id" => vid, "state" => %state);
            return;
        };

        let success = msg.is_success();
        if !success {
            if let Some(diag) = msg.diagnostic() {
                vm.set_template_error_message(&format!(
                    "Error executing image transfer script: {diag}"
                ));
                self.persist(&vm);
            }
            error!(self.log, "transfer failed"; "vm_id" => vid,
                "state" => %state, "reason" => msg.diagnostic().unwrap_or("-"));
        }
        drop(vm);

        if success {
            self.lcm.success(step, vid);
        } else {
            self.lcm.failure(step, vid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_steps_by_state() {
        assert_eq!(transfer_step(LcmState::PrologMigrateUnknown), Some(DriverStep::Prolog));
        assert_eq!(transfer_step(LcmState::EpilogUndeploy), Some(DriverStep::Epilog));
        assert_eq!(transfer_step(LcmState::HotplugEpilogPoweroff), Some(DriverStep::Detach));
        assert_eq!(transfer_step(LcmState::DiskSnapshotDelete), Some(DriverStep::DiskSnapshot));
        assert_eq!(transfer_step(LcmState::CleanupResubmit), Some(DriverStep::Cleanup));
        assert_eq!(transfer_step(LcmState::Running), None);
        assert_eq!(transfer_step(LcmState::LcmInit), None);
    }
}
