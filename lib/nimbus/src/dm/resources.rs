// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Acquisition and release of the shared objects a VM references: images,
//! network leases, security groups, VM groups and virtual routers.
//!
//! None of these take the VM lock. Callers pass the VM (or a detached disk
//! or NIC) by reference, usually after dropping its guard.

use std::collections::BTreeSet;

use nimbus_types::{
    ObjectId, VectorAttribute, VirtualMachine, VirtualMachineDisk, VirtualMachineNic,
};
use slog::{error, warn, Logger};

use crate::pool::{MemberSets, Pool, PoolObject, Pools};

fn persist<T: PoolObject>(pool: &Pool<T>, obj: &T, log: &Logger) {
    if let Err(e) = pool.update(obj) {
        error!(log, "failed to persist {}", T::TABLE; "oid" => obj.oid(), "error" => %e);
    }
}

/// Fills a `DISK` section that references an image with the attributes the
/// transfer scripts need, and registers the VM as a user of the image.
pub(crate) fn acquire_disk_image(
    pools: &Pools,
    vid: ObjectId,
    disk: &mut VectorAttribute,
) -> Result<(), String> {
    let Some(image_id) = disk.get::<ObjectId>("IMAGE_ID") else {
        return Ok(());
    };
    let mut image = pools
        .images
        .get(image_id)
        .ok_or_else(|| format!("Image {image_id} does not exist"))?;
    let ds = pools
        .datastores
        .get_ro(image.datastore_id)
        .ok_or_else(|| format!("Datastore {} does not exist", image.datastore_id))?;

    image.acquire(vid)?;
    pools.images.update(&image).map_err(|e| e.to_string())?;

    disk.replace("SOURCE", image.source.clone());
    disk.replace("DATASTORE_ID", image.datastore_id.to_string());
    disk.replace("TM_MAD", ds.tm_mad.clone());
    disk.replace("SIZE", image.size.to_string());
    if !image.format.is_empty() {
        disk.replace("FORMAT", image.format.clone());
    }
    disk.replace("CLONE", if image.persistent { "NO" } else { "YES" });
    disk.replace("SAVE", if image.persistent { "YES" } else { "NO" });
    disk.replace("PERSISTENT", if image.persistent { "YES" } else { "NO" });
    Ok(())
}

/// Datastore usage charged for an image disk: its size plus its snapshots.
pub(crate) fn disk_ds_usage(disk: &VirtualMachineDisk) -> Option<(ObjectId, u64)> {
    disk.image_id()?;
    let size = disk.size().unwrap_or(0) + disk.snapshots.total_size();
    Some((disk.datastore_id()?, size))
}

pub(crate) fn release_disk_image(
    pools: &Pools,
    vid: ObjectId,
    disk: &VirtualMachineDisk,
    failed: bool,
    log: &Logger,
) {
    let Some(image_id) = disk.image_id() else {
        return;
    };
    let Some(mut image) = pools.images.get(image_id) else {
        warn!(log, "image is gone, nothing to release"; "vm_id" => vid,
            "image_id" => image_id);
        return;
    };
    image.release(vid, failed);
    persist(&pools.images, &image, log);
}

/// Leases an address on the NIC's network, copies the network attributes
/// into the NIC and joins the network's and groups' member sets.
pub(crate) fn acquire_nic(
    pools: &Pools,
    vid: ObjectId,
    nic: &mut VectorAttribute,
) -> Result<BTreeSet<ObjectId>, String> {
    let vnid = nic
        .get::<ObjectId>("NETWORK_ID")
        .ok_or_else(|| "NIC has no NETWORK_ID".to_string())?;
    let mut vnet = pools
        .vnets
        .get(vnid)
        .ok_or_else(|| format!("Virtual network {vnid} does not exist"))?;
    let (ip, mac) = vnet
        .allocate_lease(vid)
        .ok_or_else(|| format!("No free address in virtual network {vnid}"))?;
    vnet.members.add_vm(vid);
    pools.vnets.update(&vnet).map_err(|e| e.to_string())?;

    for (k, v) in &vnet.attributes {
        nic.replace(k, v.clone());
    }
    nic.replace("IP", ip.to_string());
    nic.replace("MAC", mac);

    let mut sgs: BTreeSet<ObjectId> = VirtualMachineNic::from(nic.clone()).security_groups();
    sgs.extend(vnet.security_groups.iter().copied());
    drop(vnet);
    if !sgs.is_empty() {
        let list: Vec<String> = sgs.iter().map(ObjectId::to_string).collect();
        nic.replace("SECURITY_GROUPS", list.join(","));
    }
    Ok(sgs)
}

/// Returns the NIC's lease to its network.
pub(crate) fn release_nic(pools: &Pools, vid: ObjectId, nic: &VirtualMachineNic, log: &Logger) {
    let (Some(vnid), Some(ip)) = (nic.network_id(), nic.ip()) else {
        return;
    };
    let Some(mut vnet) = pools.vnets.get(vnid) else {
        warn!(log, "virtual network is gone, lease not released"; "vm_id" => vid,
            "vnet_id" => vnid);
        return;
    };
    vnet.release_lease(ip, vid);
    if !vnet.leases.values().any(|&owner| owner == vid) {
        vnet.members.del_vm(vid);
    }
    persist(&pools.vnets, &vnet, log);
}

fn set_membership<T: PoolObject + MemberSets>(
    pool: &Pool<T>,
    ids: &[ObjectId],
    vid: ObjectId,
    join: bool,
    log: &Logger,
) {
    for &id in ids {
        let Some(mut obj) = pool.get(id) else {
            warn!(log, "{} {} does not exist", T::TABLE, id; "vm_id" => vid);
            continue;
        };
        if join {
            obj.members_mut().add_vm(vid);
        } else {
            obj.members_mut().del_vm(vid);
        }
        persist(pool, &obj, log);
    }
}

/// Joins the member sets of `sgids` and returns their rules, ready to be
/// copied into the VM.
pub(crate) fn join_security_groups(
    pools: &Pools,
    vid: ObjectId,
    sgids: &BTreeSet<ObjectId>,
    log: &Logger,
) -> Vec<(ObjectId, Vec<VectorAttribute>)> {
    let ids: Vec<ObjectId> = sgids.iter().copied().collect();
    set_membership(&pools.secgroups, &ids, vid, true, log);
    ids.iter()
        .filter_map(|&id| pools.secgroups.get_ro(id).map(|sg| (id, sg.vm_rules())))
        .collect()
}

pub(crate) fn leave_security_groups(
    pools: &Pools,
    vid: ObjectId,
    sgids: &[ObjectId],
    log: &Logger,
) {
    set_membership(&pools.secgroups, sgids, vid, false, log);
}

/// Releases everything a finished VM holds outside the host. Returns the
/// datastore usage to give back, as `(datastore, MiB)` pairs.
pub(crate) fn release_vm(pools: &Pools, vm: &VirtualMachine, log: &Logger) -> Vec<(ObjectId, u64)> {
    let vid = vm.oid;
    let mut ds_usage = Vec::new();

    for disk in &vm.disks {
        release_disk_image(pools, vid, disk, false, log);
        ds_usage.extend(disk_ds_usage(disk));
    }

    for nic in &vm.nics {
        release_nic(pools, vid, nic, log);
    }
    let sgids: Vec<ObjectId> = vm.security_groups().into_iter().collect();
    leave_security_groups(pools, vid, &sgids, log);

    if let Some((group_id, role)) = &vm.vmgroup {
        match pools.vmgroups.get(*group_id) {
            Some(mut group) => {
                group.del_vm(role, vid);
                persist(&pools.vmgroups, &group, log);
            }
            None => warn!(log, "VM group is gone"; "vm_id" => vid,
                "vmgroup_id" => *group_id),
        }
    }

    if let Some(vrouter_id) = vm.vrouter_id {
        if let Some(mut vrouter) = pools.vrouters.get(vrouter_id) {
            vrouter.vms.remove(&vid);
            persist(&pools.vrouters, &vrouter, log);
        }
    }

    ds_usage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_logger;
    use nimbus_types::{Datastore, DatastoreType, Image, ImageState, VirtualNetwork};

    #[test]
    fn image_disk_is_filled_and_released() {
        let log = test_logger();
        let pools = Pools::in_memory(&log);
        pools
            .datastores
            .allocate(Datastore::new(1, "default", DatastoreType::Image, "ssh"))
            .unwrap();
        let image_id = pools
            .images
            .allocate(Image {
                datastore_id: 1,
                source: "/img/a".to_string(),
                size: 512,
                state: ImageState::Ready,
                ..Default::default()
            })
            .unwrap();

        let mut attrs = VectorAttribute::from_pairs(
            "DISK",
            [("DISK_ID", "0".to_string()), ("IMAGE_ID", image_id.to_string())],
        );
        acquire_disk_image(&pools, 7, &mut attrs).unwrap();
        assert_eq!(attrs.vector_value("SOURCE"), Some("/img/a"));
        assert_eq!(attrs.vector_value("TM_MAD"), Some("ssh"));
        assert!(attrs.is_yes("CLONE"));
        assert_eq!(pools.images.get_ro(image_id).unwrap().state, ImageState::Used);

        release_disk_image(&pools, 7, &VirtualMachineDisk::from(attrs), false, &log);
        assert_eq!(pools.images.get_ro(image_id).unwrap().state, ImageState::Ready);
    }

    #[test]
    fn nic_lease_round_trip_updates_members() {
        let log = test_logger();
        let pools = Pools::in_memory(&log);
        let vnid = pools
            .vnets
            .allocate(VirtualNetwork { size: 4, ..Default::default() })
            .unwrap();

        let mut attrs = VectorAttribute::from_pairs(
            "NIC",
            [("NIC_ID", "0".to_string()), ("NETWORK_ID", vnid.to_string())],
        );
        acquire_nic(&pools, 3, &mut attrs).unwrap();
        assert_eq!(attrs.vector_value("IP"), Some("10.0.0.1"));
        assert!(pools.vnets.get_ro(vnid).unwrap().members.contains(3));

        release_nic(&pools, 3, &VirtualMachineNic::from(attrs), &log);
        let vnet = pools.vnets.get_ro(vnid).unwrap();
        assert!(vnet.leases.is_empty());
        assert!(!vnet.members.contains(3));
    }
}
