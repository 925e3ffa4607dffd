// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ObjectId;

/// A cluster of hosts. VNC ports are unique per cluster.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub oid: ObjectId,
    pub name: String,
    pub vnc_ports: BTreeSet<u32>,
}

impl Cluster {
    pub fn reserve_vnc_port(&mut self, base: u32, vid: ObjectId) -> u32 {
        let mut port = base + vid;
        while self.vnc_ports.contains(&port) {
            port += 1;
        }
        self.vnc_ports.insert(port);
        port
    }

    pub fn release_vnc_port(&mut self, port: u32) {
        self.vnc_ports.remove(&port);
    }
}

/// An affinity group of VMs, organised by role.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VmGroup {
    pub oid: ObjectId,
    pub name: String,
    pub roles: BTreeMap<String, BTreeSet<ObjectId>>,
}

impl VmGroup {
    pub fn del_vm(&mut self, role: &str, vid: ObjectId) -> bool {
        self.roles.get_mut(role).is_some_and(|vms| vms.remove(&vid))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualRouter {
    pub oid: ObjectId,
    pub name: String,
    pub vms: BTreeSet<ObjectId>,
}
