// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-line operator commands, e.g. `deploy 0 1 0` or `poweroff 3 hard`.

use anyhow::{anyhow, bail, Context};
use nimbus::dm::DispatchManager;
use nimbus::RequestAttributes;
use nimbus_types::{ObjectId, VectorAttribute, VmAction};

/// What a command produced, if anything worth printing.
pub enum Outcome {
    Done,
    Allocated(ObjectId),
    Show(String),
}

struct Args<'a> {
    words: std::str::SplitWhitespace<'a>,
    cmd: &'a str,
}

impl<'a> Args<'a> {
    fn id(&mut self, what: &str) -> anyhow::Result<ObjectId> {
        self.num(what)
    }

    fn num<T: std::str::FromStr>(&mut self, what: &str) -> anyhow::Result<T> {
        let word = self
            .words
            .next()
            .ok_or_else(|| anyhow!("{}: missing {what}", self.cmd))?;
        word.parse().map_err(|_| anyhow!("{}: bad {what} {word:?}", self.cmd))
    }

    /// True if the next word equals `flag`.
    fn flag(&mut self, flag: &str) -> bool {
        self.words.clone().next() == Some(flag) && self.words.next().is_some()
    }

    fn rest(&mut self) -> String {
        self.words.by_ref().collect::<Vec<_>>().join(" ")
    }

    /// Parses the remaining `KEY=VALUE` words into a vector attribute.
    fn vector(&mut self, name: &str) -> anyhow::Result<VectorAttribute> {
        let mut attr = VectorAttribute::new(name);
        for word in self.words.by_ref() {
            let (k, v) = word
                .split_once('=')
                .ok_or_else(|| anyhow!("{}: expected KEY=VALUE, got {word:?}", self.cmd))?;
            attr.replace(k, v);
        }
        Ok(attr)
    }
}

pub fn run(dm: &DispatchManager, line: &str, ra: &RequestAttributes) -> anyhow::Result<Outcome> {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return Ok(Outcome::Done);
    };
    let mut a = Args { words, cmd };

    match cmd {
        "deploy" => dm.deploy(a.id("vm")?, a.id("host")?, a.id("datastore")?, ra)?,
        "migrate" => {
            let (vid, hid, ds) = (a.id("vm")?, a.id("host")?, a.id("datastore")?);
            let action = if a.flag("poff") {
                VmAction::PoffMigrate
            } else if a.flag("poff-hard") {
                VmAction::PoffHardMigrate
            } else {
                VmAction::Migrate
            };
            dm.migrate(vid, hid, ds, action, ra)?
        }
        "live-migrate" => dm.live_migrate(a.id("vm")?, a.id("host")?, ra)?,
        "terminate" => dm.terminate(a.id("vm")?, a.flag("hard"), ra)?,
        "undeploy" => dm.undeploy(a.id("vm")?, a.flag("hard"), ra)?,
        "poweroff" => dm.poweroff(a.id("vm")?, a.flag("hard"), ra)?,
        "reboot" => dm.reboot(a.id("vm")?, a.flag("hard"), ra)?,
        "hold" => dm.hold(a.id("vm")?, ra)?,
        "release" => dm.release(a.id("vm")?, ra)?,
        "stop" => dm.stop(a.id("vm")?, ra)?,
        "suspend" => dm.suspend(a.id("vm")?, ra)?,
        "resume" => dm.resume(a.id("vm")?, ra)?,
        "resched" => dm.resched(a.id("vm")?, !a.flag("off"), ra)?,
        "retry" => dm.retry(a.id("vm")?, ra)?,
        "recover" => {
            let vid = a.id("vm")?;
            let success = match a.rest().as_str() {
                "success" => true,
                "failure" => false,
                other => bail!("recover: expected success or failure, got {other:?}"),
            };
            dm.recover(vid, success, ra)?
        }
        "delete" => dm.delete(a.id("vm")?, ra)?,
        "delete-recreate" => dm.delete_recreate(a.id("vm")?, ra)?,
        "resize" => {
            let vid = a.id("vm")?;
            dm.resize(vid, a.num("cpu")?, a.num("vcpu")?, a.num("memory")?, ra)?
        }
        "disk-attach" => {
            let vid = a.id("vm")?;
            dm.attach(vid, a.vector("DISK")?, ra)?
        }
        "disk-detach" => dm.detach(a.id("vm")?, a.num("disk")?, ra)?,
        "disk-resize" => dm.disk_resize(a.id("vm")?, a.num("disk")?, a.num("size")?, ra)?,
        "disk-saveas" => {
            let (vid, disk) = (a.id("vm")?, a.num("disk")?);
            let name = a.rest();
            let image = dm.disk_saveas(vid, disk, &name, -1, ra)?;
            return Ok(Outcome::Allocated(image));
        }
        "nic-attach" => {
            let vid = a.id("vm")?;
            dm.attach_nic(vid, a.vector("NIC")?, ra)?
        }
        "nic-detach" => dm.detach_nic(a.id("vm")?, a.num("nic")?, ra)?,
        "sg-attach" => dm.attach_sg(a.id("vm")?, a.num("nic")?, a.id("security group")?, ra)?,
        "sg-detach" => dm.detach_sg(a.id("vm")?, a.num("nic")?, a.id("security group")?, ra)?,
        "snapshot-create" => {
            let vid = a.id("vm")?;
            dm.snapshot_create(vid, &a.rest(), ra)?;
        }
        "snapshot-revert" => dm.snapshot_revert(a.id("vm")?, a.num("snapshot")?, ra)?,
        "snapshot-delete" => dm.snapshot_delete(a.id("vm")?, a.num("snapshot")?, ra)?,
        "disk-snapshot-create" => {
            let (vid, disk) = (a.id("vm")?, a.num("disk")?);
            dm.disk_snapshot_create(vid, disk, &a.rest(), ra)?;
        }
        "disk-snapshot-revert" => {
            dm.disk_snapshot_revert(a.id("vm")?, a.num("disk")?, a.num("snapshot")?, ra)?
        }
        "disk-snapshot-delete" => {
            dm.disk_snapshot_delete(a.id("vm")?, a.num("disk")?, a.num("snapshot")?, ra)?
        }
        "backup" => dm.backup(a.id("vm")?, a.id("datastore")?, a.flag("reset"), ra)?,
        "backup-cancel" => dm.backup_cancel(a.id("vm")?, ra)?,
        "show" => {
            let vid = a.id("vm")?;
            let vm = dm
                .pools()
                .vms
                .get_ro(vid)
                .ok_or_else(|| anyhow!("show: VM {vid} does not exist"))?;
            let json = serde_json::to_string_pretty(&vm).context("encoding VM")?;
            return Ok(Outcome::Show(json));
        }
        other => bail!("unknown command {other:?}"),
    }
    Ok(Outcome::Done)
}
