// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cold and live migrations, their retries and their teardown.

mod common;

use common::{ra, request, Harness};
use nimbus::quota::VmUsage;
use nimbus_types::{LcmState, ObjectId, VmAction, VmState};

fn kinds(lines: &[String]) -> Vec<(&str, ObjectId)> {
    lines.iter().map(|l| request(l)).collect()
}

/// Drives a running VM through a saved migration to host 1 until the
/// checkpoint is about to be restored there.
fn migrate_to_restore(h: &Harness, vid: ObjectId) {
    h.orch.dm().migrate(vid, 1, 0, VmAction::Migrate, &ra()).unwrap();
    h.run();
    assert_eq!(kinds(&h.kvm.take()), [("SAVE", vid)]);
    h.kvm_reply("SAVE", vid, true, "-");
    assert_eq!(h.state(vid), (VmState::Active, LcmState::PrologMigrate));
    assert_eq!(kinds(&h.transfer.take()), [("TRANSFER", vid)]);
    h.transfer_reply(vid, true);
}

#[test]
fn saved_migration_restores_the_checkpoint() {
    let h = Harness::new();
    let vid = h.running_vm();

    migrate_to_restore(&h, vid);

    assert_eq!(h.state(vid), (VmState::Active, LcmState::BootMigrate));
    assert_eq!(kinds(&h.kvm.take()), [("RESTORE", vid)]);
    h.kvm_reply("RESTORE", vid, true, &format!("one-{vid}"));

    let vm = h.pools().vms.get_ro(vid).unwrap();
    assert_eq!(vm.lcm_state(), LcmState::Running);
    assert_eq!(vm.hid(), Some(1));
    assert!(h.pools().hosts.get_ro(0).unwrap().share.vms.is_empty());
    assert!(h.pools().hosts.get_ro(1).unwrap().share.vms.contains_key(&vid));
}

#[test]
fn retry_after_failed_restore_keeps_the_checkpoint() {
    let h = Harness::new();
    let vid = h.running_vm();

    migrate_to_restore(&h, vid);
    h.kvm.take();
    h.kvm_reply("RESTORE", vid, false, "checkpoint unreadable");
    assert_eq!(h.state(vid), (VmState::Active, LcmState::BootMigrateFailure));

    h.orch.dm().retry(vid, &ra()).unwrap();
    h.run();
    assert_eq!(h.state(vid), (VmState::Active, LcmState::BootMigrate));
    assert_eq!(kinds(&h.kvm.take()), [("RESTORE", vid)]);

    h.kvm_reply("RESTORE", vid, true, &format!("one-{vid}"));
    assert_eq!(h.state(vid), (VmState::Active, LcmState::Running));
}

#[test]
fn retry_of_poweroff_migration_shuts_down_again() {
    let h = Harness::new();
    let vid = h.running_vm();

    h.orch.dm().migrate(vid, 1, 0, VmAction::PoffMigrate, &ra()).unwrap();
    h.run();
    assert_eq!(h.state(vid), (VmState::Active, LcmState::SaveMigrate));
    assert_eq!(kinds(&h.kvm.take()), [("SHUTDOWN", vid)]);

    h.orch.dm().retry(vid, &ra()).unwrap();
    h.run();
    assert_eq!(kinds(&h.kvm.take()), [("SHUTDOWN", vid)]);

    h.kvm_reply("SHUTDOWN", vid, true, "-");
    assert_eq!(h.state(vid), (VmState::Active, LcmState::PrologMigratePoweroff));
    assert_eq!(kinds(&h.transfer.take()), [("TRANSFER", vid)]);
    h.transfer_reply(vid, true);

    let vm = h.pools().vms.get_ro(vid).unwrap();
    assert_eq!((vm.state(), vm.lcm_state()), (VmState::Poweroff, LcmState::LcmInit));
    assert_eq!(vm.hid(), Some(1));
    assert_eq!(h.quotas.vm_usage(0).running_vms, 0);
    assert!(h.pools().hosts.get_ro(0).unwrap().share.vms.is_empty());
}

#[test]
fn retry_of_hard_poweroff_migration_cancels() {
    let h = Harness::new();
    let vid = h.running_vm();

    h.orch.dm().migrate(vid, 1, 0, VmAction::PoffHardMigrate, &ra()).unwrap();
    h.run();
    assert_eq!(kinds(&h.kvm.take()), [("CANCEL", vid)]);

    h.orch.dm().retry(vid, &ra()).unwrap();
    h.run();
    assert_eq!(kinds(&h.kvm.take()), [("CANCEL", vid)]);
}

#[test]
fn failed_save_returns_to_the_source_host() {
    let h = Harness::new();
    let vid = h.running_vm();
    let source_seq = h.pools().vms.get_ro(vid).unwrap().history().unwrap().seq;

    h.orch.dm().migrate(vid, 1, 0, VmAction::Migrate, &ra()).unwrap();
    h.run();
    h.kvm.take();
    h.kvm_reply("SAVE", vid, false, "-");

    let vm = h.pools().vms.get_ro(vid).unwrap();
    assert_eq!(vm.lcm_state(), LcmState::Running);
    assert_eq!(vm.hid(), Some(0));
    assert!(h.pools().hosts.get_ro(1).unwrap().share.vms.is_empty());
    assert!(h.pools().hosts.get_ro(0).unwrap().share.vms.contains_key(&vid));

    let source = h.pools().vms.history_record(vid, source_seq).unwrap();
    assert!(source.etime > 0);
    assert_ne!(vm.history().unwrap().seq, source_seq);
}

#[test]
fn previous_history_follows_the_migration() {
    let h = Harness::new();
    let vid = h.allocate();
    assert!(h.pools().vms.get_ro(vid).unwrap().history().is_none());

    h.boot(vid);
    let vm = h.pools().vms.get_ro(vid).unwrap();
    assert!(vm.history().is_some());
    assert!(vm.previous_history().is_none());

    h.orch.dm().migrate(vid, 1, 0, VmAction::Migrate, &ra()).unwrap();
    h.run();
    for expected in [LcmState::SaveMigrate, LcmState::PrologMigrate, LcmState::BootMigrate] {
        let vm = h.pools().vms.get_ro(vid).unwrap();
        assert_eq!(vm.lcm_state(), expected);
        assert_eq!(vm.previous_hid(), Some(0));
        assert_eq!(vm.hid(), Some(1));
        match expected {
            LcmState::SaveMigrate => h.kvm_reply("SAVE", vid, true, "-"),
            LcmState::PrologMigrate => h.transfer_reply(vid, true),
            _ => h.kvm_reply("RESTORE", vid, true, "-"),
        }
    }

    let vm = h.pools().vms.get_ro(vid).unwrap();
    assert_eq!(vm.lcm_state(), LcmState::Running);
    assert_eq!(vm.previous_hid(), Some(0));
}

#[test]
fn deleting_during_live_migration_cleans_both_hosts() {
    let h = Harness::new();
    let vid = h.running_vm();

    h.orch.dm().live_migrate(vid, 1, &ra()).unwrap();
    h.run();
    assert_eq!(h.state(vid), (VmState::Active, LcmState::Migrate));
    assert_eq!(kinds(&h.kvm.take()), [("MIGRATE", vid)]);

    h.orch.dm().delete(vid, &ra()).unwrap();
    h.run();

    assert_eq!(h.state(vid), (VmState::Done, LcmState::LcmInit));
    assert_eq!(kinds(&h.kvm.take()), [("DRIVER_CANCEL", vid), ("CLEANUP", vid)]);
    assert!(h.transfer.take().is_empty());
    assert!(h.pools().hosts.get_ro(0).unwrap().share.vms.is_empty());
    assert!(h.pools().hosts.get_ro(1).unwrap().share.vms.is_empty());
    assert_eq!(h.quotas.vm_usage(0), VmUsage::default());

    let vm = h.pools().vms.get_ro(vid).unwrap();
    assert!(vm.previous_history().is_some_and(|p| p.etime > 0));

    // The migration answering late changes nothing.
    h.kvm_reply("MIGRATE", vid, true, "-");
    assert_eq!(h.state(vid), (VmState::Done, LcmState::LcmInit));
}

#[test]
fn deleting_during_save_migrate_cleans_both_hosts() {
    let h = Harness::new();
    let vid = h.running_vm();

    h.orch.dm().migrate(vid, 1, 0, VmAction::Migrate, &ra()).unwrap();
    h.run();
    h.kvm.take();

    h.orch.dm().delete(vid, &ra()).unwrap();
    h.run();

    assert_eq!(h.state(vid), (VmState::Done, LcmState::LcmInit));
    assert_eq!(kinds(&h.kvm.take()), [("DRIVER_CANCEL", vid), ("CLEANUP", vid)]);
    assert!(h.pools().hosts.get_ro(0).unwrap().share.vms.is_empty());
    assert!(h.pools().hosts.get_ro(1).unwrap().share.vms.is_empty());
    assert_eq!(h.quotas.vm_usage(0), VmUsage::default());
}

#[test]
fn deleting_after_failed_prolog_migrate_removes_files_on_both_hosts() {
    let h = Harness::new();
    let vid = h.running_vm();

    h.orch.dm().migrate(vid, 1, 0, VmAction::Migrate, &ra()).unwrap();
    h.run();
    h.kvm.take();
    h.kvm_reply("SAVE", vid, true, "-");
    h.transfer.take();
    h.transfer_reply(vid, false);
    assert_eq!(h.state(vid), (VmState::Active, LcmState::PrologMigrateFailure));

    h.orch.dm().delete(vid, &ra()).unwrap();
    h.run();

    assert_eq!(h.state(vid), (VmState::Done, LcmState::LcmInit));
    assert!(h.kvm.take().is_empty());
    let sent = h.transfer.take();
    assert_eq!(kinds(&sent), [("DRIVER_CANCEL", vid), ("TRANSFER", vid)]);

    let path = sent[1].strip_prefix(&format!("TRANSFER - {vid} ")).unwrap();
    let script = std::fs::read_to_string(path).unwrap();
    assert!(script.contains(&format!("node0:/ds/0/{vid}")), "{script}");
    assert!(script.contains(&format!("node1:/ds/0/{vid}")), "{script}");

    assert!(h.pools().hosts.get_ro(0).unwrap().share.vms.is_empty());
    assert!(h.pools().hosts.get_ro(1).unwrap().share.vms.is_empty());
    assert_eq!(h.quotas.vm_usage(0), VmUsage::default());
}
