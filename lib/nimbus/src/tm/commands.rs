// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transfer script generation.
//!
//! Each function turns the state of a VM into the ordered command lines of
//! one transfer script. Arguments are positional and their order is fixed by
//! the transfer drivers. Any missing attribute aborts the whole script.

use itertools::Itertools;
use nimbus_types::{
    History, ObjectId, PendingOp, SaveAsRequest, VirtualMachine,
    VirtualMachineDisk,
};

use super::TransferError;

/// Where a VM's system directory lives and which driver manages it.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Placement<'a> {
    pub host: &'a str,
    pub dir: &'a str,
    pub tm_mad: &'a str,
    pub ds_id: ObjectId,
    pub vid: ObjectId,
}

impl<'a> Placement<'a> {
    fn from_history(
        vid: ObjectId,
        h: Option<&'a History>,
    ) -> Result<Self, TransferError> {
        let h = h.ok_or(TransferError::NoHistory)?;
        if h.tm_mad.is_empty() {
            return Err(TransferError::NoDriverName(h.ds_id));
        }
        Ok(Self {
            host: &h.hostname,
            dir: &h.system_dir,
            tm_mad: &h.tm_mad,
            ds_id: h.ds_id,
            vid,
        })
    }

    pub fn current(vm: &'a VirtualMachine) -> Result<Self, TransferError> {
        Self::from_history(vm.oid, vm.history())
    }

    pub fn previous(vm: &'a VirtualMachine) -> Result<Self, TransferError> {
        Self::from_history(vm.oid, vm.previous_history())
    }

    /// The same directory, seen from host `host`.
    pub fn on(self, host: &'a str) -> Self {
        Self { host, ..self }
    }

    fn disk_path(&self, disk_id: u32) -> String {
        format!("{}:{}/disk.{}", self.host, self.dir, disk_id)
    }

    fn dir_path(&self) -> String {
        format!("{}:{}", self.host, self.dir)
    }
}

fn missing(what: &str, attr: &'static str) -> TransferError {
    TransferError::MissingAttribute { what: what.to_string(), attr }
}

fn disk_id(disk: &VirtualMachineDisk) -> Result<u32, TransferError> {
    disk.disk_id().ok_or_else(|| missing("DISK", "DISK_ID"))
}

/// Transfer driver and datastore that manage `disk`. Volatile disks live in
/// the system datastore.
fn disk_driver(
    disk: &VirtualMachineDisk,
    sys: &Placement<'_>,
) -> Result<(String, ObjectId), TransferError> {
    if disk.is_volatile() {
        return Ok((sys.tm_mad.to_string(), sys.ds_id));
    }
    let what = format!("DISK {}", disk.disk_id().unwrap_or_default());
    let tm_mad = disk.tm_mad().ok_or_else(|| missing(&what, "TM_MAD"))?;
    let ds_id = disk.datastore_id().ok_or_else(|| missing(&what, "DATASTORE_ID"))?;
    Ok((tm_mad.to_string(), ds_id))
}

/// Prefixes local front-end paths with the front-end host name. Sources
/// containing `:` are opaque driver URIs.
fn frontend_source(fe: &str, source: &str) -> String {
    if source.contains(':') {
        source.to_string()
    } else {
        format!("{fe}:{source}")
    }
}

/// Stages one disk onto the host.
pub(crate) fn prolog_disk(
    disk: &VirtualMachineDisk,
    sys: &Placement<'_>,
    fe: &str,
) -> Result<String, TransferError> {
    let id = disk_id(disk)?;
    let what = format!("DISK {id}");
    let dst = sys.disk_path(id);

    match disk.disk_type().as_str() {
        "SWAP" => {
            let size = disk.size().ok_or_else(|| missing(&what, "SIZE"))?;
            Ok(format!("MKSWAP {} {size} {dst} {} {}", sys.tm_mad, sys.vid, sys.ds_id))
        }
        "FS" => {
            let size = disk.size().ok_or_else(|| missing(&what, "SIZE"))?;
            let format = disk.format().ok_or_else(|| missing(&what, "FORMAT"))?;
            Ok(format!(
                "MKIMAGE {} {size} {format} {dst} {} {}",
                sys.tm_mad, sys.vid, sys.ds_id
            ))
        }
        _ => {
            let source = disk.source().ok_or_else(|| missing(&what, "SOURCE"))?;
            let tm_mad = disk.tm_mad().ok_or_else(|| missing(&what, "TM_MAD"))?;
            let ds_id = disk
                .datastore_id()
                .ok_or_else(|| missing(&what, "DATASTORE_ID"))?;
            if !disk.attrs.contains("CLONE") {
                return Err(missing(&what, "CLONE"));
            }
            let cmd = if disk.is_clone() { "CLONE" } else { "LN" };
            let tm_mad = match disk.tm_mad_system() {
                Some(sys_mad) => format!("{tm_mad}.{sys_mad}"),
                None => tm_mad.to_string(),
            };
            Ok(format!(
                "{cmd} {tm_mad} {} {dst} {} {ds_id}",
                frontend_source(fe, source),
                sys.vid
            ))
        }
    }
}

/// Output of [`prolog`]: the commands plus the host paths of the staged
/// kernel and initrd, if any.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct PrologScript {
    pub commands: Vec<String>,
    pub kernel: Option<String>,
    pub initrd: Option<String>,
}

/// Stages an OS file (`KERNEL` or `INITRD`) from a file datastore.
fn prolog_os_file(
    vm: &VirtualMachine,
    sys: &Placement<'_>,
    fe: &str,
    kind: &'static str,
) -> Result<Option<(String, String)>, TransferError> {
    let Some(os) = vm.os.as_ref() else {
        return Ok(None);
    };
    let Some(source) = os.vector_value(&format!("{kind}_DS_SOURCE")) else {
        return Ok(None);
    };
    let tm_mad = os
        .vector_value(&format!("{kind}_DS_TM_MAD"))
        .ok_or_else(|| missing("OS", "DS_TM_MAD"))?;
    let ds_id: ObjectId = os
        .get(&format!("{kind}_DS_ID"))
        .ok_or_else(|| missing("OS", "DS_ID"))?;
    let name = kind.to_lowercase();
    let cmd = format!(
        "CLONE {tm_mad} {} {}:{}/{name} {} {ds_id}",
        frontend_source(fe, source),
        sys.host,
        sys.dir,
        sys.vid
    );
    Ok(Some((cmd, format!("{}/{name}", sys.dir))))
}

fn context_cmd(
    vm: &VirtualMachine,
    sys: &Placement<'_>,
    context_file: &str,
) -> Option<String> {
    let ctx = vm.context.as_ref()?;
    let disk_id = ctx.get::<u32>("DISK_ID").unwrap_or_else(|| vm.next_disk_id());
    let mut files = context_file.to_string();
    if let Some(extra) = ctx.vector_value("FILES") {
        files.push(' ');
        files.push_str(extra);
    }
    Some(format!(
        "CONTEXT {} {files} {} {} {}",
        sys.tm_mad,
        sys.disk_path(disk_id),
        sys.vid,
        sys.ds_id
    ))
}

/// Full prolog: every disk, kernel and initrd, then the context disk.
pub(crate) fn prolog(
    vm: &VirtualMachine,
    fe: &str,
    context_file: &str,
) -> Result<PrologScript, TransferError> {
    let sys = Placement::current(vm)?;
    let mut script = PrologScript::default();

    for disk in &vm.disks {
        script.commands.push(prolog_disk(disk, &sys, fe)?);
    }
    if let Some((cmd, path)) = prolog_os_file(vm, &sys, fe, "KERNEL")? {
        script.commands.push(cmd);
        script.kernel = Some(path);
    }
    if let Some((cmd, path)) = prolog_os_file(vm, &sys, fe, "INITRD")? {
        script.commands.push(cmd);
        script.initrd = Some(path);
    }
    script.commands.extend(context_cmd(vm, &sys, context_file));
    Ok(script)
}

/// Moves every disk and the system directory between two placements.
fn move_all(
    vm: &VirtualMachine,
    from: &Placement<'_>,
    to: &Placement<'_>,
) -> Result<Vec<String>, TransferError> {
    let mut cmds = Vec::with_capacity(vm.disks.len() + 1);
    for disk in &vm.disks {
        let id = disk_id(disk)?;
        let (tm_mad, ds_id) = disk_driver(disk, to)?;
        cmds.push(format!(
            "MV {tm_mad} {} {} {} {ds_id}",
            from.disk_path(id),
            to.disk_path(id),
            to.vid
        ));
    }
    cmds.push(format!(
        "MV {} {} {} {} {}",
        to.tm_mad,
        from.dir_path(),
        to.dir_path(),
        to.vid,
        to.ds_id
    ));
    Ok(cmds)
}

/// Cold migration: from the previous host to the current one.
pub(crate) fn prolog_migrate(vm: &VirtualMachine) -> Result<Vec<String>, TransferError> {
    let prev = Placement::previous(vm)?;
    let sys = Placement::current(vm)?;
    move_all(vm, &prev, &sys)
}

/// Resume from the front-end after a stop or undeploy.
pub(crate) fn prolog_resume(
    vm: &VirtualMachine,
    fe: &str,
) -> Result<Vec<String>, TransferError> {
    let sys = Placement::current(vm)?;
    move_all(vm, &sys.on(fe), &sys)
}

/// Stop or undeploy: from the host to the front-end.
pub(crate) fn epilog_stop(
    vm: &VirtualMachine,
    fe: &str,
) -> Result<Vec<String>, TransferError> {
    let sys = Placement::current(vm)?;
    move_all(vm, &sys, &sys.on(fe))
}

/// Saves one disk back to its image or deletes it.
fn epilog_disk(
    disk: &VirtualMachineDisk,
    sys: &Placement<'_>,
) -> Result<String, TransferError> {
    let id = disk_id(disk)?;
    let (tm_mad, ds_id) = disk_driver(disk, sys)?;
    if disk.is_save() && !disk.is_volatile() {
        let source = disk
            .source()
            .ok_or_else(|| missing(&format!("DISK {id}"), "SOURCE"))?;
        Ok(format!("MVDS {tm_mad} {} {source} {} {ds_id}", sys.disk_path(id), sys.vid))
    } else {
        Ok(format!("DELETE {tm_mad} {} {} {ds_id}", sys.disk_path(id), sys.vid))
    }
}

fn delete_dir(sys: &Placement<'_>) -> String {
    format!("DELETE {} {} {} {}", sys.tm_mad, sys.dir_path(), sys.vid, sys.ds_id)
}

/// Termination: persistent disks are saved, the rest deleted. With `local`
/// the commands run on the front-end.
pub(crate) fn epilog(
    vm: &VirtualMachine,
    fe: &str,
    local: bool,
) -> Result<Vec<String>, TransferError> {
    let mut sys = Placement::current(vm)?;
    if local {
        sys = sys.on(fe);
    }
    let mut cmds = vm
        .disks
        .iter()
        .map(|d| epilog_disk(d, &sys))
        .collect::<Result<Vec<_>, _>>()?;
    cmds.push(delete_dir(&sys));
    Ok(cmds)
}

/// Deletes every disk and the system directory at `sys`, saving nothing.
fn delete_all(
    vm: &VirtualMachine,
    sys: &Placement<'_>,
) -> Result<Vec<String>, TransferError> {
    let mut cmds = Vec::with_capacity(vm.disks.len() + 1);
    for disk in &vm.disks {
        let id = disk_id(disk)?;
        let (tm_mad, ds_id) = disk_driver(disk, sys)?;
        cmds.push(format!("DELETE {tm_mad} {} {} {ds_id}", sys.disk_path(id), sys.vid));
    }
    cmds.push(delete_dir(sys));
    Ok(cmds)
}

/// Which copies of the VM files a delete script removes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteTarget {
    Current,
    /// Current placement, seen from the front-end.
    Local,
    Previous,
    Both,
}

pub(crate) fn epilog_delete(
    vm: &VirtualMachine,
    fe: &str,
    target: DeleteTarget,
) -> Result<Vec<String>, TransferError> {
    match target {
        DeleteTarget::Current => delete_all(vm, &Placement::current(vm)?),
        DeleteTarget::Local => delete_all(vm, &Placement::current(vm)?.on(fe)),
        DeleteTarget::Previous => delete_all(vm, &Placement::previous(vm)?),
        DeleteTarget::Both => {
            let mut cmds = delete_all(vm, &Placement::previous(vm)?)?;
            cmds.extend(delete_all(vm, &Placement::current(vm)?)?);
            Ok(cmds)
        }
    }
}

fn pending_disk(
    vm: &VirtualMachine,
    op: PendingOp,
) -> Result<&VirtualMachineDisk, TransferError> {
    vm.pending_disk(op).ok_or(TransferError::NoPendingDisk(op))
}

/// Stages the disk being attached.
pub(crate) fn prolog_attach(
    vm: &VirtualMachine,
    fe: &str,
) -> Result<Vec<String>, TransferError> {
    let sys = Placement::current(vm)?;
    Ok(vec![prolog_disk(pending_disk(vm, PendingOp::Attach)?, &sys, fe)?])
}

/// Saves or deletes the disk being detached.
pub(crate) fn epilog_detach(vm: &VirtualMachine) -> Result<Vec<String>, TransferError> {
    let sys = Placement::current(vm)?;
    Ok(vec![epilog_disk(pending_disk(vm, PendingOp::Detach)?, &sys)?])
}

/// Copies a disk (or one of its snapshots) to a new image.
pub(crate) fn saveas(
    vm: &VirtualMachine,
    req: &SaveAsRequest,
) -> Result<Vec<String>, TransferError> {
    let sys = Placement::current(vm)?;
    let disk = vm.disk(req.disk_id).ok_or(TransferError::NoPendingDisk(PendingOp::SaveAs))?;
    let (tm_mad, ds_id) = disk_driver(disk, &sys)?;
    Ok(vec![format!(
        "CPDS {tm_mad} {} {} {} {} {ds_id}",
        sys.disk_path(req.disk_id),
        req.source,
        req.snapshot_id,
        sys.vid
    )])
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotCommand {
    Create,
    Revert,
    Delete,
}

impl SnapshotCommand {
    fn verb(self) -> &'static str {
        match self {
            SnapshotCommand::Create => "SNAP_CREATE",
            SnapshotCommand::Revert => "SNAP_REVERT",
            SnapshotCommand::Delete => "SNAP_DELETE",
        }
    }
}

pub(crate) fn disk_snapshot(
    vm: &VirtualMachine,
    cmd: SnapshotCommand,
) -> Result<Vec<String>, TransferError> {
    let sys = Placement::current(vm)?;
    let (id, snap_id) = vm
        .snapshot_disk()
        .ok_or(TransferError::NoPendingDisk(PendingOp::Snapshot))?;
    let disk = pending_disk(vm, PendingOp::Snapshot)?;
    let (tm_mad, ds_id) = disk_driver(disk, &sys)?;
    Ok(vec![format!(
        "{} {tm_mad} {} {snap_id} {} {ds_id}",
        cmd.verb(),
        sys.disk_path(id),
        sys.vid
    )])
}

pub(crate) fn disk_resize(vm: &VirtualMachine) -> Result<Vec<String>, TransferError> {
    let sys = Placement::current(vm)?;
    let disk = pending_disk(vm, PendingOp::Resize)?;
    let id = disk_id(disk)?;
    let size = disk
        .size()
        .ok_or_else(|| missing(&format!("DISK {id}"), "SIZE"))?;
    let (tm_mad, ds_id) = disk_driver(disk, &sys)?;
    Ok(vec![format!("RESIZE {tm_mad} {} {size} {} {ds_id}", sys.disk_path(id), sys.vid)])
}

pub(crate) fn restore(vm: &VirtualMachine) -> Result<Vec<String>, TransferError> {
    let sys = Placement::current(vm)?;
    let req = vm.backups.pending_restore.ok_or(TransferError::NoRestore)?;
    Ok(vec![format!(
        "RESTORE {} {} {} {} {} {} {}",
        sys.tm_mad,
        sys.dir_path(),
        sys.vid,
        req.image_id,
        req.increment_id,
        req.disk_id,
        sys.ds_id
    )])
}

/// Live migration: lets the system datastore driver prepare the target
/// host before the hypervisor moves the VM.
pub(crate) fn migrate(vm: &VirtualMachine) -> Result<Vec<String>, TransferError> {
    let prev = Placement::previous(vm)?;
    let sys = Placement::current(vm)?;
    Ok(vec![format!(
        "MIGRATE {} {} {} {} {} {}",
        sys.tm_mad, prev.host, sys.host, sys.dir, sys.vid, sys.ds_id
    )])
}

/// Disks included in a backup: every disk with an image.
pub(crate) fn backup(
    vm: &VirtualMachine,
    backup_ds: ObjectId,
) -> Result<Vec<String>, TransferError> {
    let sys = Placement::current(vm)?;
    let disks = vm
        .disks
        .iter()
        .filter(|d| !d.is_volatile())
        .filter_map(VirtualMachineDisk::disk_id)
        .join(":");
    if disks.is_empty() {
        return Err(missing("VM", "DISK"));
    }
    Ok(vec![format!(
        "BACKUP {} {} {disks} {} {} {backup_ds}",
        sys.tm_mad,
        sys.dir_path(),
        sys.vid,
        sys.ds_id
    )])
}

pub(crate) fn backup_cancel(vm: &VirtualMachine) -> Result<Vec<String>, TransferError> {
    let sys = Placement::current(vm)?;
    Ok(vec![format!(
        "BACKUPCANCEL {} {} {} {}",
        sys.tm_mad,
        sys.dir_path(),
        sys.vid,
        sys.ds_id
    )])
}

/// Contents of `context.sh` for a VM with a `CONTEXT` section.
pub(crate) fn context_file(vm: &VirtualMachine) -> Option<String> {
    let ctx = vm.context.as_ref()?;
    let mut out = String::from("# Context variables generated by nimbus\n");
    for (key, value) in ctx.iter() {
        if key == "DISK_ID" || key == "FILES" {
            continue;
        }
        out.push_str(&format!("{key}='{}'\n", value.replace('\'', "'\\''")));
    }
    Some(out)
}
