// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual networks and security groups, plus the per-object queues used to
//! push their changes to member VMs one VM at a time.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::{ObjectId, VectorAttribute};

/// Tracks which member VMs have seen the latest version of a shared object.
///
/// A VM id lives in exactly one of the four sets.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSets {
    pub updated: BTreeSet<ObjectId>,
    pub outdated: BTreeSet<ObjectId>,
    pub updating: BTreeSet<ObjectId>,
    pub error: BTreeSet<ObjectId>,
}

impl UpdateSets {
    fn remove_everywhere(&mut self, vid: ObjectId) {
        self.updated.remove(&vid);
        self.outdated.remove(&vid);
        self.updating.remove(&vid);
        self.error.remove(&vid);
    }

    pub fn add_vm(&mut self, vid: ObjectId) {
        self.remove_everywhere(vid);
        self.updated.insert(vid);
    }

    pub fn del_vm(&mut self, vid: ObjectId) {
        self.remove_everywhere(vid);
    }

    pub fn add_updating(&mut self, vid: ObjectId) {
        self.remove_everywhere(vid);
        self.updating.insert(vid);
    }

    /// Queues `vid` for the next update round.
    pub fn add_outdated(&mut self, vid: ObjectId) {
        self.remove_everywhere(vid);
        self.outdated.insert(vid);
    }

    pub fn add_error(&mut self, vid: ObjectId) {
        self.remove_everywhere(vid);
        self.error.insert(vid);
    }

    /// Returns the lowest outdated VM id without removing it.
    pub fn get_outdated(&self) -> Option<ObjectId> {
        self.outdated.first().copied()
    }

    pub fn is_updating(&self) -> bool {
        !self.updating.is_empty()
    }

    pub fn contains(&self, vid: ObjectId) -> bool {
        self.updated.contains(&vid)
            || self.outdated.contains(&vid)
            || self.updating.contains(&vid)
            || self.error.contains(&vid)
    }

    /// Marks every member as outdated. With `recover` only the VMs in error
    /// (and any stuck in updating) are requeued.
    pub fn commit(&mut self, recover: bool) {
        if !recover {
            let updated = std::mem::take(&mut self.updated);
            self.outdated.extend(updated);
        }
        let error = std::mem::take(&mut self.error);
        let updating = std::mem::take(&mut self.updating);
        self.outdated.extend(error);
        self.outdated.extend(updating);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub oid: ObjectId,
    pub name: String,
    /// `RULE` vector attributes.
    pub rules: Vec<VectorAttribute>,
    pub members: UpdateSets,
}

impl SecurityGroup {
    /// Returns the rules as they are copied into a VM template, each tagged
    /// with the group id.
    pub fn vm_rules(&self) -> Vec<VectorAttribute> {
        self.rules
            .iter()
            .map(|rule| {
                let mut r = VectorAttribute::new("SECURITY_GROUP_RULE");
                for (k, v) in rule.iter() {
                    r.replace(k, v);
                }
                r.replace("SECURITY_GROUP_ID", self.oid.to_string());
                r.replace("SECURITY_GROUP_NAME", self.name.clone());
                r
            })
            .collect()
    }
}

/// A single IPv4 address range with sequential lease allocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VirtualNetwork {
    pub oid: ObjectId,
    pub name: String,
    /// Attributes every NIC on this network inherits (BRIDGE, VLAN_ID, ...).
    pub attributes: BTreeMap<String, String>,
    pub security_groups: Vec<ObjectId>,
    pub ip_start: Ipv4Addr,
    pub size: u32,
    pub leases: BTreeMap<Ipv4Addr, ObjectId>,
    pub members: UpdateSets,
}

impl Default for VirtualNetwork {
    fn default() -> Self {
        Self {
            oid: 0,
            name: String::new(),
            attributes: BTreeMap::new(),
            security_groups: Vec::new(),
            ip_start: Ipv4Addr::new(10, 0, 0, 1),
            size: 254,
            leases: BTreeMap::new(),
            members: UpdateSets::default(),
        }
    }
}

impl VirtualNetwork {
    /// Allocates the first free address for `vid`, returning the IP and the
    /// MAC derived from it.
    pub fn allocate_lease(&mut self, vid: ObjectId) -> Option<(Ipv4Addr, String)> {
        let start = u32::from(self.ip_start);
        let ip = (0..self.size)
            .map(|i| Ipv4Addr::from(start + i))
            .find(|ip| !self.leases.contains_key(ip))?;
        self.leases.insert(ip, vid);
        let o = ip.octets();
        let mac = format!("02:00:{:02x}:{:02x}:{:02x}:{:02x}", o[0], o[1], o[2], o[3]);
        Some((ip, mac))
    }

    pub fn release_lease(&mut self, ip: Ipv4Addr, vid: ObjectId) -> bool {
        if self.leases.get(&ip) == Some(&vid) {
            self.leases.remove(&ip);
            true
        } else {
            false
        }
    }
}
