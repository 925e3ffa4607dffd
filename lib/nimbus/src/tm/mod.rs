// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The transfer manager: turns lifecycle transitions into transfer scripts
//! and submits them to the transfer driver.
//!
//! Every operation first runs the same guard. A VM without history is a
//! consistency violation and fails the step at once. A VM on a public cloud
//! host has no storage to move, so the step succeeds at once. Otherwise the
//! whole script is generated, written to
//! `<var>/vms/<vid>/transfer.<seq>.<suffix>` and submitted as one `TRANSFER`
//! message. Any generation error fails the step without contacting the
//! driver.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nimbus_config::Config;
use nimbus_types::{ObjectId, PendingOp, VirtualMachine};
use slog::{error, info, o, Logger};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::driver::{DriverChannel, DriverError, Message};
use crate::lcm::{DriverStep, LcmHandle};
use crate::listener::{ActionHandler, ActionQueue};
use crate::pool::Pools;

pub(crate) mod commands;
mod protocol;

pub use commands::{DeleteTarget, SnapshotCommand};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("VM has no history")]
    NoHistory,

    #[error("missing {attr} in {what}")]
    MissingAttribute { what: String, attr: &'static str },

    #[error("no transfer driver set for system datastore {0}")]
    NoDriverName(ObjectId),

    #[error("no disk with a pending {0} operation")]
    NoPendingDisk(PendingOp),

    #[error("no restore request")]
    NoRestore,

    #[error("could not write {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Transfer operations, one per script kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferOp {
    Prolog,
    PrologMigrate,
    PrologResume,
    PrologAttach,
    /// Runs on the front-end with `local`, for VMs already moved there.
    Epilog { local: bool },
    EpilogStop,
    EpilogDelete(DeleteTarget),
    EpilogDetach,
    SaveasHot,
    Snapshot(SnapshotCommand),
    ResizeDisk,
    Restore,
}

impl TransferOp {
    /// File suffix of the script, also used as the stage name in logs.
    pub fn suffix(self) -> &'static str {
        match self {
            TransferOp::Prolog => "prolog",
            TransferOp::PrologMigrate => "migrate",
            TransferOp::PrologResume => "resume",
            TransferOp::PrologAttach => "prolog_attach",
            TransferOp::Epilog { .. } => "epilog",
            TransferOp::EpilogStop => "stop",
            TransferOp::EpilogDelete(DeleteTarget::Previous) => "delete_prev",
            TransferOp::EpilogDelete(DeleteTarget::Both) => "delete_both",
            TransferOp::EpilogDelete(_) => "delete",
            TransferOp::EpilogDetach => "epilog_detach",
            TransferOp::SaveasHot => "disk_saveas",
            TransferOp::Snapshot(_) => "disk_snapshot",
            TransferOp::ResizeDisk => "disk_resize",
            TransferOp::Restore => "restore",
        }
    }

    /// The lifecycle step reported when the operation short-circuits.
    pub fn step(self) -> DriverStep {
        match self {
            TransferOp::Prolog
            | TransferOp::PrologMigrate
            | TransferOp::PrologResume => DriverStep::Prolog,
            TransferOp::PrologAttach => DriverStep::Attach,
            TransferOp::Epilog { .. } | TransferOp::EpilogStop => DriverStep::Epilog,
            TransferOp::EpilogDelete(_) => DriverStep::Cleanup,
            TransferOp::EpilogDetach => DriverStep::Detach,
            TransferOp::SaveasHot => DriverStep::Saveas,
            TransferOp::Snapshot(_) => DriverStep::DiskSnapshot,
            TransferOp::ResizeDisk => DriverStep::DiskResize,
            TransferOp::Restore => DriverStep::DiskRestore,
        }
    }
}

pub enum TmAction {
    Transfer { vid: ObjectId, op: TransferOp },
    DriverCancel(ObjectId),
    /// A line read from the transfer driver.
    DriverMessage(String),
}

/// Message types on the transfer driver channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TmMessage {
    Transfer,
    DriverCancel,
    Log,
}

/// Enqueues work for the transfer manager.
#[derive(Clone)]
pub struct TmHandle {
    queue: Arc<ActionQueue<TmAction>>,
}

impl TmHandle {
    pub fn new(queue: Arc<ActionQueue<TmAction>>) -> Self {
        Self { queue }
    }

    pub fn trigger(&self, vid: ObjectId, op: TransferOp) {
        self.queue.push(TmAction::Transfer { vid, op });
    }

    pub fn driver_cancel(&self, vid: ObjectId) {
        self.queue.push(TmAction::DriverCancel(vid));
    }

    pub fn driver_message(&self, line: String) {
        self.queue.push(TmAction::DriverMessage(line));
    }
}

pub struct TransferManager {
    queue: Arc<ActionQueue<TmAction>>,
    pools: Arc<Pools>,
    lcm: LcmHandle,
    driver: Arc<dyn DriverChannel>,
    config: Arc<Config>,
    log: Logger,
}

impl TransferManager {
    pub fn new(
        queue: Arc<ActionQueue<TmAction>>,
        pools: Arc<Pools>,
        lcm: LcmHandle,
        driver: Arc<dyn DriverChannel>,
        config: Arc<Config>,
        log: &Logger,
    ) -> Self {
        Self {
            queue,
            pools,
            lcm,
            driver,
            config,
            log: log.new(o!("component" => "tm")),
        }
    }

    fn script_path(&self, vm: &VirtualMachine, suffix: &str) -> PathBuf {
        let seq = vm.history().map_or(0, |h| h.seq);
        self.config
            .vm_dir(vm.oid)
            .join(format!("transfer.{seq}.{suffix}"))
    }

    fn write_file(path: &Path, body: &str) -> Result<(), TransferError> {
        let io_err = |source| TransferError::Io { path: path.to_path_buf(), source };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }
        std::fs::write(path, body).map_err(io_err)
    }

    /// Generates the commands of `op`. Prolog also writes the context file
    /// and records the staged kernel and initrd paths on the VM.
    fn generate(
        &self,
        vm: &mut VirtualMachine,
        op: TransferOp,
    ) -> Result<Vec<String>, TransferError> {
        let fe = self.config.hostname.as_str();
        match op {
            TransferOp::Prolog => {
                let context_path = self.config.vm_dir(vm.oid).join("context.sh");
                if let Some(body) = commands::context_file(vm) {
                    Self::write_file(&context_path, &body)?;
                }
                let script =
                    commands::prolog(vm, fe, &context_path.to_string_lossy())?;
                if let Some(os) = vm.os.as_mut() {
                    if let Some(kernel) = &script.kernel {
                        os.replace("KERNEL", kernel.as_str());
                    }
                    if let Some(initrd) = &script.initrd {
                        os.replace("INITRD", initrd.as_str());
                    }
                }
                Ok(script.commands)
            }
            TransferOp::PrologMigrate => commands::prolog_migrate(vm),
            TransferOp::PrologResume => commands::prolog_resume(vm, fe),
            TransferOp::PrologAttach => commands::prolog_attach(vm, fe),
            TransferOp::Epilog { local } => commands::epilog(vm, fe, local),
            TransferOp::EpilogStop => commands::epilog_stop(vm, fe),
            TransferOp::EpilogDelete(target) => {
                commands::epilog_delete(vm, fe, target)
            }
            TransferOp::EpilogDetach => commands::epilog_detach(vm),
            TransferOp::SaveasHot => {
                let req = vm
                    .saveas_disk()
                    .ok_or(TransferError::NoPendingDisk(PendingOp::SaveAs))?;
                commands::saveas(vm, &req)
            }
            TransferOp::Snapshot(cmd) => commands::disk_snapshot(vm, cmd),
            TransferOp::ResizeDisk => commands::disk_resize(vm),
            TransferOp::Restore => commands::restore(vm),
        }
    }

    fn submit(
        &self,
        vm: &mut VirtualMachine,
        op: TransferOp,
    ) -> Result<PathBuf, TransferError> {
        let cmds = self.generate(vm, op)?;
        let path = self.script_path(vm, op.suffix());
        let mut body = cmds.join("\n");
        body.push('\n');
        Self::write_file(&path, &body)?;
        Ok(path)
    }

    fn transfer(&self, vid: ObjectId, op: TransferOp) {
        let Some(mut vm) = self.pools.vms.get(vid) else {
            error!(self.log, "VM does not exist"; "vm_id" => vid,
                "stage" => op.suffix());
            return;
        };

        if !vm.has_history() {
            error!(self.log, "VM has no history"; "vm_id" => vid,
                "stage" => op.suffix());
            drop(vm);
            self.lcm.failure(op.step(), vid);
            return;
        }
        if vm.is_public_cloud() {
            drop(vm);
            self.lcm.success(op.step(), vid);
            return;
        }

        let path = match self.submit(&mut vm, op) {
            Ok(path) => path,
            Err(e) => {
                error!(self.log, "transfer script generation failed";
                    "vm_id" => vid, "stage" => op.suffix(), "error" => %e);
                vm.set_template_error_message(&format!(
                    "Error generating {} transfer script: {e}",
                    op.suffix()
                ));
                self.persist(&vm);
                drop(vm);
                self.lcm.failure(op.step(), vid);
                return;
            }
        };
        if matches!(op, TransferOp::Prolog) {
            self.persist(&vm);
        }
        drop(vm);

        let msg = Message::request(
            TmMessage::Transfer,
            vid,
            path.to_string_lossy().into_owned(),
        );
        if let Err(e) = self.driver.write(&msg.to_string()) {
            error!(self.log, "could not send transfer request";
                "vm_id" => vid, "stage" => op.suffix(), "error" => %e);
            self.lcm.failure(op.step(), vid);
            return;
        }
        info!(self.log, "transfer submitted"; "vm_id" => vid,
            "stage" => op.suffix(), "script" => %path.display());
    }

    fn driver_cancel(&self, vid: ObjectId) {
        let msg = Message::request(TmMessage::DriverCancel, vid, "");
        if let Err(e) = self.driver.write(&msg.to_string()) {
            error!(self.log, "could not cancel transfer"; "vm_id" => vid,
                "error" => %e);
        }
    }

    fn persist(&self, vm: &VirtualMachine) {
        if let Err(e) = self.pools.vms.update(vm) {
            error!(self.log, "failed to persist VM"; "vm_id" => vm.oid,
                "error" => %e);
        }
    }
}

impl ActionHandler for TransferManager {
    type Action = TmAction;

    fn queue(&self) -> &ActionQueue<TmAction> {
        &self.queue
    }

    fn handle(&self, action: TmAction) {
        match action {
            TmAction::Transfer { vid, op } => self.transfer(vid, op),
            TmAction::DriverCancel(vid) => self.driver_cancel(vid),
            TmAction::DriverMessage(line) => self.protocol(&line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RecordingDriver;
    use crate::lcm::LcmAction;
    use crate::test_util::test_logger;
    use nimbus_types::{History, Host, VectorAttribute};

    struct Fixture {
        tm: TransferManager,
        lcm_queue: Arc<ActionQueue<LcmAction>>,
        driver: Arc<RecordingDriver>,
        pools: Arc<Pools>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let log = test_logger();
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            hostname: "fe".to_string(),
            var_location: dir.path().to_path_buf(),
            ..Default::default()
        };
        let pools = Arc::new(Pools::in_memory(&log));
        let lcm_queue = Arc::new(ActionQueue::new());
        let driver = Arc::new(RecordingDriver::new());
        let tm = TransferManager::new(
            Arc::new(ActionQueue::new()),
            Arc::clone(&pools),
            LcmHandle::new(Arc::clone(&lcm_queue)),
            driver.clone(),
            Arc::new(config),
            &log,
        );
        Fixture { tm, lcm_queue, driver, pools, _dir: dir }
    }

    fn add_vm(pools: &Pools, public_cloud: bool) -> ObjectId {
        pools.hosts.allocate(Host::new(0, "node1", "kvm")).unwrap();
        let mut vm = VirtualMachine::new(0, 0, 0, "vm");
        vm.add_history(History {
            hostname: "node1".to_string(),
            tm_mad: "ssh".to_string(),
            system_dir: "/ds/0/0".to_string(),
            public_cloud,
            ..Default::default()
        });
        vm.disks.push(
            VectorAttribute::from_pairs(
                "DISK",
                [("DISK_ID", "0"), ("TYPE", "SWAP"), ("SIZE", "64")],
            )
            .into(),
        );
        pools.vms.allocate(vm).unwrap()
    }

    fn lcm_step(f: &Fixture) -> Option<(DriverStep, bool)> {
        match f.lcm_queue.try_pop()? {
            LcmAction::Driver { step, success, .. } => Some((step, success)),
            _ => None,
        }
    }

    #[test]
    fn prolog_writes_script_and_submits() {
        let f = fixture();
        let vid = add_vm(&f.pools, false);
        f.tm.handle(TmAction::Transfer { vid, op: TransferOp::Prolog });

        let sent = f.driver.take();
        assert_eq!(sent.len(), 1);
        let path = sent[0].strip_prefix("TRANSFER - 0 ").unwrap();
        assert!(path.ends_with("vms/0/transfer.0.prolog"));
        let body = std::fs::read_to_string(path).unwrap();
        assert_eq!(body, "MKSWAP ssh 64 node1:/ds/0/0/disk.0 0 0\n");
        assert!(f.lcm_queue.is_empty());
    }

    #[test]
    fn public_cloud_short_circuits_to_success() {
        let f = fixture();
        let vid = add_vm(&f.pools, true);
        f.tm.handle(TmAction::Transfer {
            vid,
            op: TransferOp::Epilog { local: false },
        });
        assert!(f.driver.messages().is_empty());
        assert_eq!(lcm_step(&f), Some((DriverStep::Epilog, true)));
    }

    #[test]
    fn generation_error_fails_without_contacting_driver() {
        let f = fixture();
        let vid = add_vm(&f.pools, false);
        f.tm.handle(TmAction::Transfer { vid, op: TransferOp::PrologMigrate });
        assert!(f.driver.messages().is_empty());
        assert_eq!(lcm_step(&f), Some((DriverStep::Prolog, false)));

        let vm = VirtualMachine::new(5, 0, 0, "bare");
        f.pools.vms.allocate(vm).unwrap();
        f.tm.handle(TmAction::Transfer { vid: 5, op: TransferOp::Prolog });
        assert_eq!(lcm_step(&f), Some((DriverStep::Prolog, false)));
    }

    #[test]
    fn driver_write_failure_fails_the_step() {
        let log = test_logger();
        let pools = Arc::new(Pools::in_memory(&log));
        let lcm_queue = Arc::new(ActionQueue::new());
        let mut driver = crate::driver::MockDriverChannel::new();
        driver
            .expect_write()
            .times(1)
            .returning(|_| Err(DriverError::Closed("tm".to_string())));
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            var_location: dir.path().to_path_buf(),
            ..Default::default()
        };
        let tm = TransferManager::new(
            Arc::new(ActionQueue::new()),
            Arc::clone(&pools),
            LcmHandle::new(Arc::clone(&lcm_queue)),
            Arc::new(driver),
            Arc::new(config),
            &log,
        );
        let vid = add_vm(&pools, false);
        tm.handle(TmAction::Transfer { vid, op: TransferOp::EpilogStop });
        assert!(matches!(
            lcm_queue.try_pop(),
            Some(LcmAction::Driver { step: DriverStep::Epilog, success: false, .. })
        ));
    }
}
