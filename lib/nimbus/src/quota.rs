// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Quota accounting seam.
//!
//! The core only reports usage deltas. Callers must release every VM guard
//! before calling into a [`Quotas`] implementation.

use std::collections::BTreeMap;
use std::sync::Mutex;

use nimbus_types::ObjectId;

/// Signed change in the VM counters of a user and group.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct VmUsage {
    pub vms: i64,
    pub cpu: f64,
    pub memory: i64,
    pub running_vms: i64,
    pub running_cpu: f64,
    pub running_memory: i64,
}

impl VmUsage {
    /// Usage of a VM with `cpu` and `memory` (MiB) that is running.
    pub fn running(cpu: f64, memory: u64) -> Self {
        Self {
            running_vms: 1,
            running_cpu: cpu,
            running_memory: memory as i64,
            ..Default::default()
        }
    }

    /// Total and running usage of a VM that is running.
    pub fn whole(cpu: f64, memory: u64) -> Self {
        Self {
            vms: 1,
            cpu,
            memory: memory as i64,
            ..Self::running(cpu, memory)
        }
    }

    pub fn negate(self) -> Self {
        Self {
            vms: -self.vms,
            cpu: -self.cpu,
            memory: -self.memory,
            running_vms: -self.running_vms,
            running_cpu: -self.running_cpu,
            running_memory: -self.running_memory,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait Quotas: Send + Sync {
    /// Checks that `delta` fits the user and group quotas and reserves it.
    fn vm_check(
        &self,
        uid: ObjectId,
        gid: ObjectId,
        delta: &VmUsage,
    ) -> Result<(), String>;

    /// Applies `delta` without checking limits.
    fn vm_add(&self, uid: ObjectId, gid: ObjectId, delta: &VmUsage);

    /// Applies a datastore size change, in MiB.
    fn ds_add(&self, uid: ObjectId, gid: ObjectId, ds_id: ObjectId, size: i64);
}

/// Quotas that accept everything.
pub struct NoQuotas;

impl Quotas for NoQuotas {
    fn vm_check(&self, _: ObjectId, _: ObjectId, _: &VmUsage) -> Result<(), String> {
        Ok(())
    }

    fn vm_add(&self, _: ObjectId, _: ObjectId, _: &VmUsage) {}

    fn ds_add(&self, _: ObjectId, _: ObjectId, _: ObjectId, _: i64) {}
}

/// Per-user usage counters with optional limits on running memory.
#[derive(Default)]
pub struct QuotaLedger {
    vm: Mutex<BTreeMap<ObjectId, VmUsage>>,
    ds: Mutex<BTreeMap<(ObjectId, ObjectId), i64>>,
    memory_limit: Option<i64>,
}

impl QuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory_limit(limit: i64) -> Self {
        Self { memory_limit: Some(limit), ..Default::default() }
    }

    pub fn vm_usage(&self, uid: ObjectId) -> VmUsage {
        self.vm.lock().unwrap().get(&uid).copied().unwrap_or_default()
    }

    pub fn ds_usage(&self, uid: ObjectId, ds_id: ObjectId) -> i64 {
        self.ds.lock().unwrap().get(&(uid, ds_id)).copied().unwrap_or(0)
    }
}

fn apply(usage: &mut VmUsage, delta: &VmUsage) {
    usage.vms += delta.vms;
    usage.cpu += delta.cpu;
    usage.memory += delta.memory;
    usage.running_vms += delta.running_vms;
    usage.running_cpu += delta.running_cpu;
    usage.running_memory += delta.running_memory;
}

impl Quotas for QuotaLedger {
    fn vm_check(
        &self,
        uid: ObjectId,
        _gid: ObjectId,
        delta: &VmUsage,
    ) -> Result<(), String> {
        let mut vm = self.vm.lock().unwrap();
        let usage = vm.entry(uid).or_default();
        if let Some(limit) = self.memory_limit {
            if usage.memory + delta.memory > limit {
                return Err(format!(
                    "memory quota exceeded: {} + {} > {limit}",
                    usage.memory, delta.memory
                ));
            }
        }
        apply(usage, delta);
        Ok(())
    }

    fn vm_add(&self, uid: ObjectId, _gid: ObjectId, delta: &VmUsage) {
        apply(self.vm.lock().unwrap().entry(uid).or_default(), delta);
    }

    fn ds_add(&self, uid: ObjectId, _gid: ObjectId, ds_id: ObjectId, size: i64) {
        *self.ds.lock().unwrap().entry((uid, ds_id)).or_default() += size;
    }
}
