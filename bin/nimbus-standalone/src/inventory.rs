// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The objects a standalone run starts from, read from a TOML file.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{anyhow, Context};
use nimbus::pool::Pools;
use nimbus_types::{
    Cluster, Datastore, DatastoreType, Host, Image, ImageState, ObjectId, SecurityGroup,
    VectorAttribute, VirtualMachine, VirtualNetwork,
};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Inventory {
    #[serde(default, rename = "host")]
    pub hosts: Vec<HostEntry>,
    #[serde(default, rename = "datastore")]
    pub datastores: Vec<DatastoreEntry>,
    #[serde(default, rename = "image")]
    pub images: Vec<ImageEntry>,
    #[serde(default, rename = "security_group")]
    pub security_groups: Vec<SecurityGroupEntry>,
    #[serde(default, rename = "network")]
    pub networks: Vec<NetworkEntry>,
    #[serde(default, rename = "vm")]
    pub vms: Vec<VmEntry>,
    /// Commands run once every object exists, see [`crate::commands`].
    #[serde(default)]
    pub actions: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostEntry {
    pub id: ObjectId,
    pub name: String,
    pub vmm_mad: String,
    #[serde(default)]
    pub cluster_id: ObjectId,
    #[serde(default)]
    pub public_cloud: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatastoreEntry {
    pub id: ObjectId,
    pub name: String,
    /// `IMAGE`, `SYSTEM`, `FILE` or `BACKUP`.
    #[serde(rename = "type")]
    pub ds_type: String,
    pub tm_mad: String,
    #[serde(default)]
    pub base_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageEntry {
    pub id: ObjectId,
    pub name: String,
    pub datastore_id: ObjectId,
    pub source: String,
    /// MiB.
    pub size: u64,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub persistent: bool,
}

fn default_format() -> String {
    "raw".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityGroupEntry {
    pub id: ObjectId,
    pub name: String,
    #[serde(default)]
    pub rules: Vec<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkEntry {
    pub id: ObjectId,
    pub name: String,
    pub ip_start: Ipv4Addr,
    pub size: u32,
    #[serde(default)]
    pub security_groups: Vec<ObjectId>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VmEntry {
    pub name: String,
    #[serde(default)]
    pub uid: ObjectId,
    #[serde(default)]
    pub gid: ObjectId,
    pub cpu: f64,
    #[serde(default = "default_vcpu")]
    pub vcpu: u32,
    /// MiB.
    pub memory: u64,
    #[serde(default)]
    pub disks: Vec<BTreeMap<String, String>>,
    #[serde(default)]
    pub nics: Vec<BTreeMap<String, String>>,
    #[serde(default)]
    pub graphics: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub hold: bool,
}

fn default_vcpu() -> u32 {
    1
}

fn vector(name: &str, values: &BTreeMap<String, String>) -> VectorAttribute {
    VectorAttribute::from_pairs(name, values.iter().map(|(k, v)| (k, v.clone())))
}

impl VmEntry {
    pub fn to_vm(&self) -> VirtualMachine {
        let mut vm = VirtualMachine::new(0, self.uid, self.gid, &self.name);
        vm.cpu = self.cpu;
        vm.vcpu = self.vcpu;
        vm.memory = self.memory;
        vm.disks = self.disks.iter().map(|d| vector("DISK", d).into()).collect();
        vm.nics = self.nics.iter().map(|n| vector("NIC", n).into()).collect();
        vm.graphics = self.graphics.as_ref().map(|g| vector("GRAPHICS", g));
        vm
    }
}

impl Inventory {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading inventory {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("parsing inventory {}", path.display()))
    }

    /// Adds every object except the VMs to `pools`.
    pub fn populate(&self, pools: &Pools) -> anyhow::Result<()> {
        let clusters: std::collections::BTreeSet<ObjectId> =
            self.hosts.iter().map(|h| h.cluster_id).collect();
        for oid in clusters {
            pools.clusters.allocate(Cluster { oid, ..Default::default() })?;
        }
        for h in &self.hosts {
            let mut host = Host::new(h.id, &h.name, &h.vmm_mad);
            host.cluster_id = h.cluster_id;
            host.public_cloud = h.public_cloud;
            allocate_exact(pools.hosts.allocate(host)?, h.id, "host")?;
        }
        for d in &self.datastores {
            let ds_type: DatastoreType = d
                .ds_type
                .to_uppercase()
                .parse()
                .map_err(|_| anyhow!("datastore {}: unknown type {:?}", d.id, d.ds_type))?;
            let mut ds = Datastore::new(d.id, &d.name, ds_type, &d.tm_mad);
            ds.base_path = d.base_path.clone();
            allocate_exact(pools.datastores.allocate(ds)?, d.id, "datastore")?;
        }
        for i in &self.images {
            let image = Image {
                oid: i.id,
                name: i.name.clone(),
                datastore_id: i.datastore_id,
                source: i.source.clone(),
                size: i.size,
                format: i.format.clone(),
                persistent: i.persistent,
                state: ImageState::Ready,
                ..Default::default()
            };
            allocate_exact(pools.images.allocate(image)?, i.id, "image")?;
        }
        for s in &self.security_groups {
            let sg = SecurityGroup {
                oid: s.id,
                name: s.name.clone(),
                rules: s.rules.iter().map(|r| vector("RULE", r)).collect(),
                ..Default::default()
            };
            allocate_exact(pools.secgroups.allocate(sg)?, s.id, "security group")?;
        }
        for n in &self.networks {
            let vnet = VirtualNetwork {
                oid: n.id,
                name: n.name.clone(),
                ip_start: n.ip_start,
                size: n.size,
                security_groups: n.security_groups.clone(),
                attributes: n.attributes.clone(),
                ..Default::default()
            };
            allocate_exact(pools.vnets.allocate(vnet)?, n.id, "network")?;
        }
        Ok(())
    }
}

fn allocate_exact(got: ObjectId, wanted: ObjectId, kind: &str) -> anyhow::Result<()> {
    if got != wanted {
        return Err(anyhow!("duplicate {kind} id {wanted}"));
    }
    Ok(())
}
