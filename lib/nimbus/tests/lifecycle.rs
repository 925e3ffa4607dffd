// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end flows through all four managers with recording drivers.

mod common;

use common::{ra, request, Harness};
use nimbus::dm::{BackupConfig, ConfUpdate};
use nimbus::lcm::LcmAction;
use nimbus::quota::VmUsage;
use nimbus_types::{
    Datastore, DatastoreType, ImageState, LcmState, VectorAttribute, VmAction, VmState,
};

#[test]
fn prolog_script_lists_disk_commands_in_order() {
    let h = Harness::new();
    let vid = h.allocate();
    h.pools().vms.get(vid).unwrap().disks.push(
        VectorAttribute::from_pairs(
            "DISK",
            [
                ("DISK_ID", "1"),
                ("SOURCE", "/img/a"),
                ("CLONE", "YES"),
                ("TM_MAD", "ssh"),
                ("DATASTORE_ID", "1"),
            ],
        )
        .into(),
    );

    h.orch.dm().deploy(vid, 0, 0, &ra()).unwrap();
    h.run();

    assert_eq!(h.state(vid), (VmState::Active, LcmState::Prolog));
    let sent = h.transfer.take();
    assert_eq!(sent.len(), 1);
    let path = sent[0].strip_prefix(&format!("TRANSFER - {vid} ")).unwrap();
    let script = std::fs::read_to_string(path).unwrap();
    let lines: Vec<&str> = script.lines().collect();
    assert_eq!(lines[0], format!("MKIMAGE ssh 1024 raw node0:/ds/0/{vid}/disk.0 {vid} 0"));
    assert_eq!(lines[1], format!("CLONE ssh frontend:/img/a node0:/ds/0/{vid}/disk.1 {vid} 1"));
}

#[test]
fn deploy_reaches_running_and_reserves_capacity() {
    let h = Harness::new();
    let vid = h.running_vm();

    let vm = h.pools().vms.get_ro(vid).unwrap();
    assert_eq!(vm.deploy_id.as_deref(), Some(format!("one-{vid}").as_str()));
    assert_eq!(h.pools().vms.get_by_deploy_id(&format!("one-{vid}")), Some(vid));

    let host = h.pools().hosts.get_ro(0).unwrap();
    assert_eq!(host.share.cpu_usage, 100);
    assert_eq!(host.share.mem_usage, 512 * 1024);
    assert_eq!(h.quotas.vm_usage(0).running_vms, 1);
}

#[test]
fn cold_migration_saves_on_the_source_host() {
    let h = Harness::new();
    let vid = h.running_vm();

    h.orch.dm().migrate(vid, 1, 0, VmAction::Migrate, &ra()).unwrap();
    h.run();

    assert_eq!(h.state(vid), (VmState::Active, LcmState::SaveMigrate));
    let vm = h.pools().vms.get_ro(vid).unwrap();
    assert_eq!(vm.hid(), Some(1));
    assert_eq!(vm.previous_hid(), Some(0));
    assert_eq!(vm.previous_history().map(|p| p.action), Some(VmAction::Migrate));

    let stored = h.pools().vms.history_record(vid, vm.history().unwrap().seq).unwrap();
    assert_eq!(stored.hid, 1);
    assert!(h.pools().vms.history_record(vid, vm.previous_history().unwrap().seq).is_some());

    assert!(h.pools().hosts.get_ro(0).unwrap().share.vms.contains_key(&vid));
    assert!(h.pools().hosts.get_ro(1).unwrap().share.vms.contains_key(&vid));

    let sent = h.kvm.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(request(&sent[0]), ("SAVE", vid));
}

#[test]
fn deleting_a_suspended_vm_cleans_its_host() {
    let h = Harness::new();
    let vid = h.running_vm();

    h.orch.dm().suspend(vid, &ra()).unwrap();
    h.run();
    assert_eq!(request(&h.kvm.take()[0]), ("SAVE", vid));
    h.kvm_reply("SAVE", vid, true, "-");
    assert_eq!(h.state(vid), (VmState::Suspended, LcmState::LcmInit));

    h.orch.dm().delete(vid, &ra()).unwrap();
    h.run();

    assert_eq!(h.state(vid), (VmState::Done, LcmState::LcmInit));
    let vm = h.pools().vms.get_ro(vid).unwrap();
    assert!(vm.etime > 0);
    assert!(h.pools().hosts.get_ro(0).unwrap().share.vms.is_empty());
    assert_eq!(h.quotas.vm_usage(0), VmUsage::default());

    let sent = h.transfer.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(request(&sent[0]), ("TRANSFER", vid));
}

#[test]
fn stale_transfer_reply_is_ignored() {
    let h = Harness::new();
    let vid = h.allocate();

    h.transfer_reply(vid, true);

    assert_eq!(h.state(vid), (VmState::Pending, LcmState::LcmInit));
    assert!(h.transfer.messages().is_empty());
    assert!(h.kvm.messages().is_empty());
}

#[test]
fn retry_reissues_the_failed_prolog() {
    let h = Harness::new();
    let vid = h.allocate();
    h.orch.dm().deploy(vid, 0, 0, &ra()).unwrap();
    h.run();
    h.transfer.take();
    h.transfer_reply(vid, false);
    assert_eq!(h.state(vid), (VmState::Active, LcmState::PrologFailure));

    let before = h.pools().vms.get_ro(vid).unwrap();
    let share = h.pools().hosts.get_ro(0).unwrap().share;

    h.orch.dm().retry(vid, &ra()).unwrap();
    h.run();

    let vm = h.pools().vms.get_ro(vid).unwrap();
    assert_eq!(vm.lcm_state(), LcmState::Prolog);
    assert_eq!(vm.history(), before.history());
    assert_eq!(h.pools().hosts.get_ro(0).unwrap().share, share);
    let sent = h.transfer.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(request(&sent[0]), ("TRANSFER", vid));
}

#[test]
fn failed_disk_attach_leaves_running_vm_untouched() {
    let h = Harness::new();
    let vid = h.running_vm();
    let before = h.pools().vms.get_ro(vid).unwrap();

    let disk = VectorAttribute::from_pairs("DISK", [("IMAGE_ID", "404")]);
    assert!(h.orch.dm().attach(vid, disk, &ra()).is_err());
    h.run();

    assert_eq!(h.pools().vms.get_ro(vid).unwrap(), before);
    assert!(h.kvm.messages().is_empty());
    assert!(h.transfer.messages().is_empty());
}

#[test]
fn disk_attach_round_trip() {
    let h = Harness::new();
    let vid = h.running_vm();

    let disk = VectorAttribute::from_pairs("DISK", [("TYPE", "SWAP"), ("SIZE", "256")]);
    h.orch.dm().attach(vid, disk, &ra()).unwrap();
    h.run();
    assert_eq!(h.state(vid), (VmState::Active, LcmState::Hotplug));
    assert_eq!(request(&h.kvm.take()[0]), ("ATTACHDISK", vid));

    h.kvm_reply("ATTACHDISK", vid, true, "-");
    let vm = h.pools().vms.get_ro(vid).unwrap();
    assert_eq!(vm.lcm_state(), LcmState::Running);
    assert_eq!(vm.disks.len(), 2);
    assert!(vm.disk(1).is_some_and(|d| !d.is_attaching()));
}

#[test]
fn recover_on_running_vm_is_a_no_op() {
    let h = Harness::new();
    let vid = h.running_vm();
    let before = h.pools().vms.get_ro(vid).unwrap();

    h.orch.dm().recover(vid, true, &ra()).unwrap();
    h.run();

    assert_eq!(h.pools().vms.get_ro(vid).unwrap(), before);
    assert!(h.kvm.messages().is_empty());
    assert!(h.transfer.messages().is_empty());
}

#[test]
fn rejected_action_changes_nothing() {
    let h = Harness::new();
    let vid = h.allocate();
    let before = h.pools().vms.get_ro(vid).unwrap();

    let err = h.orch.dm().poweroff(vid, false, &ra()).unwrap_err();
    assert_eq!(err.code(), -2);
    assert_eq!(h.run(), 0);
    assert_eq!(h.pools().vms.get_ro(vid).unwrap(), before);
}

#[test]
fn poweroff_then_resume_keeps_running_quota_balanced() {
    let h = Harness::new();
    let vid = h.running_vm();

    h.orch.dm().poweroff(vid, false, &ra()).unwrap();
    h.run();
    assert_eq!(request(&h.kvm.take()[0]), ("SHUTDOWN", vid));
    h.kvm_reply("SHUTDOWN", vid, true, "-");
    assert_eq!(h.state(vid), (VmState::Poweroff, LcmState::LcmInit));
    assert_eq!(h.quotas.vm_usage(0).running_vms, 0);
    assert_eq!(h.quotas.vm_usage(0).vms, 1);

    h.orch.dm().resume(vid, &ra()).unwrap();
    h.run();
    assert_eq!(h.quotas.vm_usage(0).running_vms, 1);
    assert_eq!(request(&h.kvm.take()[0]), ("DEPLOY", vid));
    h.kvm_reply("DEPLOY", vid, true, "-");
    assert_eq!(h.state(vid), (VmState::Active, LcmState::Running));
}

#[test]
fn monitor_events_follow_the_hypervisor() {
    let h = Harness::new();
    let vid = h.running_vm();
    let lcm = h.orch.lcm_handle();

    lcm.trigger(LcmAction::MonitorUnknown(vid));
    h.run();
    assert_eq!(h.state(vid), (VmState::Active, LcmState::Unknown));

    lcm.trigger(LcmAction::MonitorRunning(vid));
    h.run();
    assert_eq!(h.state(vid), (VmState::Active, LcmState::Running));

    lcm.trigger(LcmAction::MonitorPoweroff(vid));
    h.run();
    assert_eq!(h.state(vid), (VmState::Poweroff, LcmState::LcmInit));
    assert_eq!(h.quotas.vm_usage(0).running_vms, 0);
    assert!(h.kvm.messages().is_empty());

    lcm.trigger(LcmAction::MonitorRunning(vid));
    h.run();
    assert_eq!(h.state(vid), (VmState::Active, LcmState::Running));
    assert_eq!(h.quotas.vm_usage(0).running_vms, 1);
}

#[test]
fn deleting_during_hotplug_cancels_the_hypervisor_operation() {
    let h = Harness::new();
    let vid = h.running_vm();

    let disk = VectorAttribute::from_pairs("DISK", [("TYPE", "SWAP"), ("SIZE", "256")]);
    h.orch.dm().attach(vid, disk, &ra()).unwrap();
    h.run();
    assert_eq!(request(&h.kvm.take()[0]), ("ATTACHDISK", vid));

    h.orch.dm().delete(vid, &ra()).unwrap();
    h.run();

    assert_eq!(h.state(vid), (VmState::Done, LcmState::LcmInit));
    let sent: Vec<_> = h.kvm.take();
    let sent: Vec<_> = sent.iter().map(|l| request(l)).collect();
    assert_eq!(sent, [("DRIVER_CANCEL", vid), ("CLEANUP", vid)]);
    assert!(h.pools().hosts.get_ro(0).unwrap().share.vms.is_empty());
    assert_eq!(h.quotas.vm_usage(0), VmUsage::default());

    h.kvm_reply("ATTACHDISK", vid, true, "-");
    assert_eq!(h.state(vid), (VmState::Done, LcmState::LcmInit));
}

#[test]
fn deleting_during_disk_saveas_fails_the_new_image() {
    let h = Harness::new();
    let vid = h.allocate_with_image();
    h.boot(vid);

    let image_id = h.orch.dm().disk_saveas(vid, 1, "copy", -1, &ra()).unwrap();
    h.run();
    assert_eq!(h.state(vid), (VmState::Active, LcmState::HotplugSaveas));
    assert_eq!(request(&h.transfer.take()[0]), ("TRANSFER", vid));
    assert_eq!(h.pools().images.get_ro(image_id).unwrap().state, ImageState::Locked);
    assert_eq!(h.quotas.ds_usage(0, 1), 2 * 2048);

    h.orch.dm().delete(vid, &ra()).unwrap();
    h.run();

    assert_eq!(h.state(vid), (VmState::Done, LcmState::LcmInit));
    assert_eq!(h.pools().images.get_ro(image_id).unwrap().state, ImageState::Error);
    assert_eq!(h.quotas.ds_usage(0, 1), 0);
    assert!(h.pools().vms.get_ro(vid).unwrap().saveas_disk().is_none());
}

#[test]
fn failed_disk_saveas_releases_its_datastore_usage() {
    let h = Harness::new();
    let vid = h.allocate_with_image();
    h.boot(vid);

    let image_id = h.orch.dm().disk_saveas(vid, 1, "copy", -1, &ra()).unwrap();
    h.run();
    h.transfer.take();
    h.transfer_reply(vid, false);

    assert_eq!(h.state(vid), (VmState::Active, LcmState::Running));
    assert_eq!(h.pools().images.get_ro(image_id).unwrap().state, ImageState::Error);
    assert_eq!(h.quotas.ds_usage(0, 1), 2048);
}

#[test]
fn keep_last_flattens_the_backup_chain() {
    let h = Harness::new();
    let backup_ds = h
        .pools()
        .datastores
        .allocate(Datastore::new(2, "backups", DatastoreType::Backup, "restic"))
        .unwrap();
    let vid = h.allocate_with_image();
    h.boot(vid);

    let conf = ConfUpdate {
        backup: Some(BackupConfig { incremental: true, keep_last: Some(2) }),
        ..Default::default()
    };
    h.orch.dm().update_conf(vid, conf, &ra()).unwrap();
    h.run();
    assert_eq!(h.state(vid), (VmState::Active, LcmState::Running));

    for n in 0..3 {
        h.orch.dm().backup(vid, backup_ds, false, &ra()).unwrap();
        h.run();
        assert_eq!(request(&h.kvm.take()[0]), ("BACKUP", vid));
        h.kvm_reply("BACKUP", vid, true, &format!("/backups/{vid}/{n} 100"));
        assert_eq!(h.state(vid), (VmState::Active, LcmState::Running));
    }

    let vm = h.pools().vms.get_ro(vid).unwrap();
    assert!(!vm.backups.active_flatten);
    assert_eq!(vm.backups.last_increment_id, 2);
    let image_id = vm.backups.last_backup_id.unwrap();
    let image = h.pools().images.get_ro(image_id).unwrap();
    let chain: Vec<_> = image.increments.iter().map(|i| (i.id, i.size)).collect();
    assert_eq!(chain, [(1, 200), (2, 100)]);
    assert_eq!(h.quotas.ds_usage(0, backup_ds), 300);
}

#[test]
fn deleting_during_disk_resize_refunds_the_growth() {
    let h = Harness::new();
    let vid = h.allocate_with_image();
    h.boot(vid);

    h.orch.dm().disk_resize(vid, 1, 4096, &ra()).unwrap();
    h.run();
    assert_eq!(h.state(vid), (VmState::Active, LcmState::DiskResize));
    assert_eq!(request(&h.kvm.take()[0]), ("RESIZEDISK", vid));
    assert_eq!(h.quotas.ds_usage(0, 1), 4096);

    h.orch.dm().delete(vid, &ra()).unwrap();
    h.run();

    assert_eq!(h.state(vid), (VmState::Done, LcmState::LcmInit));
    assert_eq!(h.quotas.ds_usage(0, 1), 0);
    assert_eq!(h.quotas.vm_usage(0), VmUsage::default());
}

#[test]
fn deleting_powered_off_vm_during_disk_resize_refunds_the_growth() {
    let h = Harness::new();
    let vid = h.allocate_with_image();
    h.boot(vid);
    h.orch.dm().poweroff(vid, false, &ra()).unwrap();
    h.run();
    h.answer_all(&mut std::iter::repeat(true));
    assert_eq!(h.state(vid).0, VmState::Poweroff);

    h.orch.dm().disk_resize(vid, 1, 3072, &ra()).unwrap();
    h.run();
    assert_eq!(h.state(vid), (VmState::Active, LcmState::DiskResizePoweroff));
    assert_eq!(h.quotas.ds_usage(0, 1), 3072);

    h.orch.dm().delete(vid, &ra()).unwrap();
    h.run();
    h.answer_all(&mut std::iter::repeat(true));

    assert_eq!(h.state(vid).0, VmState::Done);
    assert_eq!(h.quotas.ds_usage(0, 1), 0);
    assert_eq!(h.quotas.vm_usage(0), VmUsage::default());
}

#[test]
fn deleting_during_live_resize_refunds_the_charge() {
    let h = Harness::new();
    let vid = h.running_vm();

    h.orch.dm().resize(vid, 2.0, 2, 1024, &ra()).unwrap();
    h.run();
    assert_eq!(h.state(vid), (VmState::Active, LcmState::HotplugResize));
    assert_eq!(request(&h.kvm.take()[0]), ("RESIZE", vid));
    assert_eq!(h.quotas.vm_usage(0).running_memory, 1024);

    h.orch.dm().delete(vid, &ra()).unwrap();
    h.run();

    assert_eq!(h.state(vid), (VmState::Done, LcmState::LcmInit));
    assert_eq!(h.quotas.vm_usage(0), VmUsage::default());

    // The resize answering late changes nothing.
    h.kvm_reply("RESIZE", vid, true, "-");
    assert_eq!(h.quotas.vm_usage(0), VmUsage::default());
}

#[test]
fn recreating_during_live_resize_keeps_the_original_size() {
    let h = Harness::new();
    let vid = h.running_vm();
    let before = h.quotas.vm_usage(0);

    h.orch.dm().resize(vid, 2.0, 2, 1024, &ra()).unwrap();
    h.run();
    h.kvm.take();

    h.orch.dm().delete_recreate(vid, &ra()).unwrap();
    h.run();
    h.answer_all(&mut std::iter::repeat(true));

    assert_eq!(h.state(vid), (VmState::Pending, LcmState::LcmInit));
    let vm = h.pools().vms.get_ro(vid).unwrap();
    assert_eq!((vm.cpu, vm.memory), (1.0, 512));
    assert!(vm.pending_resize.is_none());
    assert_eq!(h.quotas.vm_usage(0), before);
}
