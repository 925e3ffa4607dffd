// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ObjectId;

/// Resources a VM reserves on the host it occupies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCapacity {
    pub vm_id: ObjectId,
    /// CPU share in hundredths of a physical CPU.
    pub cpu: u64,
    /// Memory in KiB.
    pub memory: u64,
    /// System datastore disk in MiB.
    pub disk: u64,
}

/// Usage counters for a host, plus what each VM on it reserved.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostShare {
    pub cpu_usage: u64,
    pub mem_usage: u64,
    pub disk_usage: u64,
    pub vms: BTreeMap<ObjectId, HostCapacity>,
}

impl HostShare {
    pub fn add(&mut self, cap: &HostCapacity) {
        self.cpu_usage += cap.cpu;
        self.mem_usage += cap.memory;
        self.disk_usage += cap.disk;
        let entry = self
            .vms
            .entry(cap.vm_id)
            .or_insert(HostCapacity { vm_id: cap.vm_id, ..Default::default() });
        entry.cpu += cap.cpu;
        entry.memory += cap.memory;
        entry.disk += cap.disk;
    }

    /// Releases whatever VM `vm_id` reserved. Returns false if it held
    /// nothing on this host.
    pub fn del(&mut self, vm_id: ObjectId) -> bool {
        let Some(cap) = self.vms.remove(&vm_id) else {
            return false;
        };
        self.cpu_usage = self.cpu_usage.saturating_sub(cap.cpu);
        self.mem_usage = self.mem_usage.saturating_sub(cap.memory);
        self.disk_usage = self.disk_usage.saturating_sub(cap.disk);
        true
    }

    /// Applies a signed CPU/memory change for a VM already on the host.
    pub fn update(&mut self, vm_id: ObjectId, cpu_delta: i64, mem_delta: i64) {
        let Some(cap) = self.vms.get_mut(&vm_id) else {
            return;
        };
        cap.cpu = cap.cpu.saturating_add_signed(cpu_delta);
        cap.memory = cap.memory.saturating_add_signed(mem_delta);
        self.cpu_usage = self.cpu_usage.saturating_add_signed(cpu_delta);
        self.mem_usage = self.mem_usage.saturating_add_signed(mem_delta);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub oid: ObjectId,
    pub name: String,
    pub cluster_id: ObjectId,
    pub vmm_mad: String,
    /// Set for hosts that front a public cloud provider: storage is managed
    /// by the provider, so transfer operations are skipped.
    pub public_cloud: bool,
    pub share: HostShare,
}

impl Host {
    pub fn new(oid: ObjectId, name: &str, vmm_mad: &str) -> Self {
        Self {
            oid,
            name: name.to_string(),
            vmm_mad: vmm_mad.to_string(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn del_releases_what_was_reserved() {
        let mut share = HostShare::default();
        share.add(&HostCapacity { vm_id: 1, cpu: 100, memory: 1024, disk: 10 });
        share.add(&HostCapacity { vm_id: 2, cpu: 50, memory: 512, disk: 0 });
        share.update(1, 100, 1024);
        assert_eq!(share.cpu_usage, 250);

        assert!(share.del(1));
        assert!(!share.del(1));
        assert_eq!((share.cpu_usage, share.mem_usage, share.disk_usage), (50, 512, 0));
        share.update(9, 10, 10);
        assert_eq!(share.cpu_usage, 50);
    }
}
