// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host capacity, quota and lease bookkeeping must return to zero once
//! every VM released what it reserved, whatever the interleaving.

mod common;

use common::{ra, Harness};
use nimbus::pool::Pools;
use nimbus::quota::VmUsage;
use nimbus_types::{
    Datastore, DatastoreType, Host, HostCapacity, HostShare, ImageState, ObjectId,
    VectorAttribute, VirtualNetwork, VmAction, VmState,
};
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Op {
    Add { vid: u32, cpu: u64, memory: u64 },
    Del { vid: u32 },
    Resize { vid: u32, cpu: i64, memory: i64 },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u32..6, 1u64..800, 1u64..1 << 22)
            .prop_map(|(vid, cpu, memory)| Op::Add { vid, cpu, memory }),
        (0u32..6).prop_map(|vid| Op::Del { vid }),
        (0u32..6, -50i64..50, -1024i64..1024)
            .prop_map(|(vid, cpu, memory)| Op::Resize { vid, cpu, memory }),
    ]
}

fn totals(share: &HostShare) -> (u64, u64) {
    share.vms.values().fold((0, 0), |(c, m), cap| (c + cap.cpu, m + cap.memory))
}

proptest! {
    #[test]
    fn releasing_every_vm_empties_the_host(ops in prop::collection::vec(op(), 0..40)) {
        let pools = Pools::in_memory(&common::test_logger());
        pools.hosts.allocate(Host::new(0, "node0", "kvm")).unwrap();

        for op in &ops {
            match *op {
                Op::Add { vid, cpu, memory } => {
                    let cap = HostCapacity { vm_id: vid, cpu, memory, disk: 0 };
                    pools.hosts.add_capacity(0, &cap).unwrap();
                }
                Op::Del { vid } => pools.hosts.del_capacity(0, vid),
                Op::Resize { vid, cpu, memory } => {
                    let share = pools.hosts.get_ro(0).unwrap().share;
                    // Keep the reservation positive so usage never clamps.
                    if let Some(cap) = share.vms.get(&vid) {
                        if cap.cpu as i64 + cpu > 0 && cap.memory as i64 + memory > 0 {
                            pools.hosts.update_capacity(0, vid, cpu, memory).unwrap();
                        }
                    }
                }
            }
            let share = pools.hosts.get_ro(0).unwrap().share;
            prop_assert_eq!(totals(&share), (share.cpu_usage, share.mem_usage));
        }

        for vid in 0..6 {
            pools.hosts.del_capacity(0, vid);
            // Releasing twice is harmless.
            pools.hosts.del_capacity(0, vid);
        }
        let share = pools.hosts.get_ro(0).unwrap().share;
        prop_assert_eq!(share, HostShare::default());
    }
}

/// A user action against one VM.
#[derive(Clone, Copy, Debug)]
enum Step {
    Deploy(ObjectId),
    Migrate(VmAction),
    LiveMigrate,
    Poweroff(bool),
    Suspend,
    Stop,
    Undeploy(bool),
    Resume,
    Terminate(bool),
    Recover(bool),
    Retry,
    DeleteRecreate,
    Attach,
    Detach(u32),
    AttachNic,
    DiskResize(u32),
    Resize(bool),
    DiskSnapshotCreate,
    DiskSaveas,
    Backup(bool),
}

/// Objects the steps refer to besides the VM.
struct Targets {
    vnet: ObjectId,
    backup_ds: ObjectId,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0u32..2).prop_map(Step::Deploy),
        prop_oneof![
            Just(VmAction::Migrate),
            Just(VmAction::PoffMigrate),
            Just(VmAction::PoffHardMigrate),
        ]
        .prop_map(Step::Migrate),
        Just(Step::LiveMigrate),
        any::<bool>().prop_map(Step::Poweroff),
        Just(Step::Suspend),
        Just(Step::Stop),
        any::<bool>().prop_map(Step::Undeploy),
        Just(Step::Resume),
        any::<bool>().prop_map(Step::Terminate),
        any::<bool>().prop_map(Step::Recover),
        Just(Step::Retry),
        Just(Step::DeleteRecreate),
        Just(Step::Attach),
        (0u32..3).prop_map(Step::Detach),
        Just(Step::AttachNic),
        (0u32..2).prop_map(Step::DiskResize),
        any::<bool>().prop_map(Step::Resize),
        Just(Step::DiskSnapshotCreate),
        Just(Step::DiskSaveas),
        any::<bool>().prop_map(Step::Backup),
    ]
}

/// Runs `step` through the dispatch manager. Rejected actions are part of
/// the sequence too.
fn apply(h: &Harness, vid: ObjectId, targets: &Targets, step: Step) -> bool {
    let dm = h.orch.dm();
    let vm = h.pools().vms.get_ro(vid).unwrap();
    // The other host, for migrations.
    let target = vm.hid().map_or(0, |hid| 1 - hid);
    let disk_size = |disk_id| vm.disk(disk_id).and_then(|d| d.size()).unwrap_or(0);
    let grown = |disk_id| disk_size(disk_id) + 1024;
    let (disk0, disk1) = (grown(0), grown(1));
    drop(vm);
    let outcome = match step {
        Step::Deploy(hid) => dm.deploy(vid, hid, 0, &ra()),
        Step::Migrate(action) => dm.migrate(vid, target, 0, action, &ra()),
        Step::LiveMigrate => dm.live_migrate(vid, target, &ra()),
        Step::Poweroff(hard) => dm.poweroff(vid, hard, &ra()),
        Step::Suspend => dm.suspend(vid, &ra()),
        Step::Stop => dm.stop(vid, &ra()),
        Step::Undeploy(hard) => dm.undeploy(vid, hard, &ra()),
        Step::Resume => dm.resume(vid, &ra()),
        Step::Terminate(hard) => dm.terminate(vid, hard, &ra()),
        Step::Recover(success) => dm.recover(vid, success, &ra()),
        Step::Retry => dm.retry(vid, &ra()),
        Step::DeleteRecreate => dm.delete_recreate(vid, &ra()),
        Step::Attach => {
            let disk = VectorAttribute::from_pairs("DISK", [("TYPE", "SWAP"), ("SIZE", "256")]);
            dm.attach(vid, disk, &ra())
        }
        Step::Detach(disk_id) => dm.detach(vid, disk_id, &ra()),
        Step::AttachNic => {
            let nic = VectorAttribute::from_pairs("NIC", [("NETWORK_ID", targets.vnet.to_string())]);
            dm.attach_nic(vid, nic, &ra())
        }
        Step::DiskResize(disk_id) => {
            let size = if disk_id == 0 { disk0 } else { disk1 };
            dm.disk_resize(vid, disk_id, size, &ra())
        }
        Step::Resize(grow) => {
            let (cpu, vcpu, memory) = if grow { (2.0, 2, 1024) } else { (0.5, 1, 256) };
            dm.resize(vid, cpu, vcpu, memory, &ra())
        }
        Step::DiskSnapshotCreate => dm.disk_snapshot_create(vid, 1, "snap", &ra()).map(drop),
        Step::DiskSaveas => dm.disk_saveas(vid, 1, "copy", -1, &ra()).map(drop),
        Step::Backup(reset) => dm.backup(vid, targets.backup_ds, reset, &ra()),
    };
    h.run();
    outcome.is_ok()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn lifecycle_sequences_release_everything(
        steps in prop::collection::vec(step(), 0..24),
        replies in prop::collection::vec(prop::bool::weighted(0.8), 1..32),
    ) {
        let h = Harness::new();
        let targets = Targets {
            vnet: h.pools().vnets.allocate(VirtualNetwork::default()).unwrap(),
            backup_ds: h
                .pools()
                .datastores
                .allocate(Datastore::new(2, "backups", DatastoreType::Backup, "restic"))
                .unwrap(),
        };
        let vid = h.allocate_with_image();
        let mut outcomes = replies.iter().copied().cycle();
        let mut deployed = false;

        for step in steps {
            let accepted = apply(&h, vid, &targets, step);
            deployed |= accepted && matches!(step, Step::Deploy(_));
            h.answer_all(&mut outcomes);

            let vm = h.pools().vms.get_ro(vid).unwrap();
            if deployed {
                prop_assert!(vm.has_history(), "no history in {}", vm.state_str());
            }
            if vm.state() == VmState::Done {
                break;
            }
        }

        // Whatever the VM is doing, deleting it must give everything back.
        for _ in 0..4 {
            if h.state(vid).0 == VmState::Done {
                break;
            }
            h.orch.dm().delete(vid, &ra()).unwrap();
            h.run();
            h.answer_all(&mut std::iter::repeat(true));
        }
        prop_assert_eq!(h.state(vid).0, VmState::Done);

        for hid in 0..2 {
            let share = h.pools().hosts.get_ro(hid).unwrap().share;
            prop_assert!(share.vms.is_empty(), "host {} still holds {:?}", hid, share.vms);
            prop_assert_eq!((share.cpu_usage, share.mem_usage), (0, 0));
        }
        prop_assert_eq!(h.quotas.vm_usage(0), VmUsage::default());

        // Only images saved from the VM's disks keep datastore usage.
        let kept: i64 = h
            .pools()
            .images
            .ids()
            .into_iter()
            .filter_map(|oid| h.pools().images.get_ro(oid))
            .filter(|image| image.datastore_id == 1 && image.state != ImageState::Error)
            .map(|image| image.size as i64)
            .sum();
        prop_assert_eq!(h.quotas.ds_usage(0, 1), kept);
        prop_assert!(h.pools().vnets.get_ro(targets.vnet).unwrap().leases.is_empty());
    }
}
