// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use nimbus::driver::{DriverChannel, RecordingDriver};
use nimbus::pool::Pools;
use nimbus::quota::{QuotaLedger, Quotas};
use nimbus::{Drivers, Orchestrator, RequestAttributes};
use nimbus_config::{Config, VmmDriverConfig};
use nimbus_types::{
    Cluster, Datastore, DatastoreType, Host, LcmState, ObjectId, VectorAttribute,
    VirtualMachine, VmState,
};
use slog::Drain;

pub fn test_logger() -> slog::Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

pub fn ra() -> RequestAttributes {
    RequestAttributes::new(0, 0, 1)
}

/// An orchestrator in manual mode, with recording drivers for storage and
/// the `kvm` hypervisor, which resizes running VMs.
pub struct Harness {
    pub orch: Orchestrator,
    pub transfer: Arc<RecordingDriver>,
    pub kvm: Arc<RecordingDriver>,
    pub quotas: Arc<QuotaLedger>,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let log = test_logger();
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            hostname: "frontend".to_string(),
            var_location: dir.path().to_path_buf(),
            datastore_location: "/ds".into(),
            ..Default::default()
        };
        config.vmm_drivers.insert(
            "kvm".to_string(),
            VmmDriverConfig { live_resize: true, ..Default::default() },
        );

        let pools = Arc::new(Pools::in_memory(&log));
        pools.hosts.allocate(Host::new(0, "node0", "kvm")).unwrap();
        pools.hosts.allocate(Host::new(1, "node1", "kvm")).unwrap();
        pools
            .datastores
            .allocate(Datastore::new(0, "system", DatastoreType::System, "ssh"))
            .unwrap();
        pools
            .datastores
            .allocate(Datastore::new(1, "default", DatastoreType::Image, "ssh"))
            .unwrap();
        pools.clusters.allocate(Cluster::default()).unwrap();

        let transfer = Arc::new(RecordingDriver::new());
        let kvm = Arc::new(RecordingDriver::new());
        let mut vmm: BTreeMap<String, Arc<dyn DriverChannel>> = BTreeMap::new();
        vmm.insert("kvm".to_string(), kvm.clone());
        let drivers = Drivers { transfer: transfer.clone(), vmm };

        let quotas = Arc::new(QuotaLedger::new());
        let orch = Orchestrator::new(config, pools, quotas.clone(), drivers, &log);
        Self { orch, transfer, kvm, quotas, _dir: dir }
    }

    pub fn pools(&self) -> &Pools {
        self.orch.pools()
    }

    pub fn state(&self, vid: ObjectId) -> (VmState, LcmState) {
        let vm = self.pools().vms.get_ro(vid).unwrap();
        (vm.state(), vm.lcm_state())
    }

    pub fn run(&self) -> usize {
        self.orch.run_until_idle()
    }

    /// Answers the transfer driver and runs until idle.
    pub fn transfer_reply(&self, vid: ObjectId, success: bool) {
        let status = if success { "SUCCESS" } else { "FAILURE" };
        self.orch.tm_handle().driver_message(format!("TRANSFER {status} {vid} -"));
        self.run();
    }

    /// Answers the hypervisor driver and runs until idle.
    pub fn kvm_reply(&self, kind: &str, vid: ObjectId, success: bool, payload: &str) {
        let status = if success { "SUCCESS" } else { "FAILURE" };
        self.orch
            .vmm_handle()
            .driver_message("kvm", format!("{kind} {status} {vid} {payload}"));
        self.run();
    }

    /// Answers every recorded driver request, and the requests those
    /// answers produce, until both drivers are quiet. Each answer takes its
    /// outcome from `outcomes`, succeeding once it runs out.
    pub fn answer_all(&self, outcomes: &mut impl Iterator<Item = bool>) {
        for _ in 0..64 {
            let transfer = self.transfer.take();
            let kvm = self.kvm.take();
            if transfer.is_empty() && kvm.is_empty() {
                return;
            }
            for line in transfer {
                let (kind, vid) = request(&line);
                let status = if outcomes.next().unwrap_or(true) { "SUCCESS" } else { "FAILURE" };
                self.orch.tm_handle().driver_message(format!("{kind} {status} {vid} -"));
                self.run();
            }
            for line in kvm {
                let (kind, vid) = request(&line);
                let payload = match kind {
                    "DEPLOY" => format!("one-{vid}"),
                    "BACKUP" => format!("/backups/{vid} 0"),
                    _ => "-".to_string(),
                };
                self.kvm_reply(kind, vid, outcomes.next().unwrap_or(true), &payload);
            }
        }
        panic!("drivers kept receiving requests");
    }

    /// Allocates a 1 CPU, 512 MiB VM with one volatile disk.
    pub fn allocate(&self) -> ObjectId {
        let mut vm = VirtualMachine::new(0, 0, 0, "vm");
        vm.cpu = 1.0;
        vm.memory = 512;
        vm.disks.push(
            VectorAttribute::from_pairs(
                "DISK",
                [("TYPE", "FS"), ("SIZE", "1024"), ("FORMAT", "raw")],
            )
                .into(),
        );
        self.orch.dm().allocate(vm, false).unwrap()
    }

    /// Allocates a VM with a second, image-backed 2 GiB disk on datastore
    /// 1 and charges that disk to the owner's datastore quota.
    pub fn allocate_with_image(&self) -> ObjectId {
        let vid = self.allocate();
        self.pools().vms.get(vid).unwrap().disks.push(
            VectorAttribute::from_pairs(
                "DISK",
                [
                    ("DISK_ID", "1"),
                    ("IMAGE_ID", "7"),
                    ("SOURCE", "/img/base"),
                    ("CLONE", "YES"),
                    ("TM_MAD", "ssh"),
                    ("DATASTORE_ID", "1"),
                    ("SIZE", "2048"),
                    ("FORMAT", "qcow2"),
                ],
            )
            .into(),
        );
        self.quotas.ds_add(0, 0, 1, 2048);
        vid
    }

    /// Allocates a VM and drives it to RUNNING on host 0.
    pub fn running_vm(&self) -> ObjectId {
        let vid = self.allocate();
        self.boot(vid);
        vid
    }

    /// Deploys pending VM `vid` on host 0 and answers every driver request
    /// with success.
    pub fn boot(&self, vid: ObjectId) {
        self.orch.dm().deploy(vid, 0, 0, &ra()).unwrap();
        self.run();
        self.transfer_reply(vid, true);
        self.kvm_reply("DEPLOY", vid, true, &format!("one-{vid}"));
        assert_eq!(self.state(vid), (VmState::Active, LcmState::Running));
        self.transfer.take();
        self.kvm.take();
    }
}

/// Splits a recorded driver request into its type and object id.
pub fn request(line: &str) -> (&str, ObjectId) {
    let mut parts = line.split_whitespace();
    let kind = parts.next().unwrap();
    assert_eq!(parts.next(), Some("-"));
    let oid = parts.next().unwrap().parse().unwrap();
    (kind, oid)
}
