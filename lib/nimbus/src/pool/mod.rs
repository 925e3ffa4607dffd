// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Object pools.
//!
//! A [`Pool`] holds every object of one type behind its own mutex. `get`
//! hands out an owned exclusive guard; the lock is released when the guard
//! is dropped, so the drop point of a guard is the unlock point. Changes are
//! persisted explicitly with `update`.
//!
//! No code path may call `get` or `get_ro` for an object whose guard it
//! already holds: the per-object mutex is not reentrant.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use nimbus_types::{
    Cluster, Datastore, Host, Image, ObjectId, SecurityGroup, UpdateSets,
    VirtualMachine, VirtualNetwork, VirtualRouter, VmGroup,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::{o, Logger};
use thiserror::Error;

mod host;
mod store;
mod vm;

pub use host::HostPool;
pub use store::{MemoryStore, ObjectStore};
pub use vm::VmPool;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("{0} {1} does not exist")]
    NotFound(&'static str, ObjectId),

    #[error("failed to encode {0} {1}: {2}")]
    Encode(&'static str, ObjectId, serde_json::Error),

    #[error("object store error: {0}")]
    Store(String),
}

/// An object that can be kept in a [`Pool`].
pub trait PoolObject:
    Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const TABLE: &'static str;

    fn oid(&self) -> ObjectId;

    fn set_oid(&mut self, oid: ObjectId);
}

macro_rules! pool_object {
    ($ty:ty, $table:literal) => {
        impl PoolObject for $ty {
            const TABLE: &'static str = $table;

            fn oid(&self) -> ObjectId {
                self.oid
            }

            fn set_oid(&mut self, oid: ObjectId) {
                self.oid = oid;
            }
        }
    };
}

pool_object!(VirtualMachine, "vm");
pool_object!(Host, "host");
pool_object!(Datastore, "datastore");
pool_object!(Image, "image");
pool_object!(VirtualNetwork, "network");
pool_object!(SecurityGroup, "secgroup");
pool_object!(Cluster, "cluster");
pool_object!(VmGroup, "vmgroup");
pool_object!(VirtualRouter, "vrouter");

/// Exclusive access to a pooled object. Dropping it unlocks the object.
pub type PoolGuard<T> = tokio::sync::OwnedMutexGuard<T>;

/// Objects whose membership changes are pushed to member VMs one at a
/// time.
pub trait MemberSets {
    fn members(&self) -> &UpdateSets;

    fn members_mut(&mut self) -> &mut UpdateSets;
}

impl MemberSets for SecurityGroup {
    fn members(&self) -> &UpdateSets {
        &self.members
    }

    fn members_mut(&mut self) -> &mut UpdateSets {
        &mut self.members
    }
}

impl MemberSets for VirtualNetwork {
    fn members(&self) -> &UpdateSets {
        &self.members
    }

    fn members_mut(&mut self) -> &mut UpdateSets {
        &mut self.members
    }
}

pub struct Pool<T: PoolObject> {
    objects: Mutex<BTreeMap<ObjectId, Arc<tokio::sync::Mutex<T>>>>,
    store: Arc<dyn ObjectStore>,
    log: Logger,
}

impl<T: PoolObject> Pool<T> {
    pub fn new(store: Arc<dyn ObjectStore>, log: &Logger) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            store,
            log: log.new(o!("pool" => T::TABLE)),
        }
    }

    fn entry(&self, oid: ObjectId) -> Option<Arc<tokio::sync::Mutex<T>>> {
        self.objects.lock().unwrap().get(&oid).cloned()
    }

    /// Locks object `oid`, blocking until its current holder releases it.
    pub fn get(&self, oid: ObjectId) -> Option<PoolGuard<T>> {
        let entry = self.entry(oid)?;
        Some(entry.blocking_lock_owned())
    }

    /// Returns a snapshot of object `oid`.
    pub fn get_ro(&self, oid: ObjectId) -> Option<T> {
        let entry = self.entry(oid)?;
        let obj = entry.blocking_lock().clone();
        Some(obj)
    }

    /// Persists the object. The caller keeps holding its guard.
    pub fn update(&self, obj: &T) -> Result<(), PoolError> {
        let body = serde_json::to_string(obj)
            .map_err(|e| PoolError::Encode(T::TABLE, obj.oid(), e))?;
        self.store.put(T::TABLE, &obj.oid().to_string(), &body)
    }

    /// Adds an object under the next free id (or its own id, if that is
    /// still unused) and persists it.
    pub fn allocate(&self, mut obj: T) -> Result<ObjectId, PoolError> {
        let oid = {
            let mut objects = self.objects.lock().unwrap();
            let oid = if objects.contains_key(&obj.oid()) {
                objects.keys().next_back().map_or(0, |last| last + 1)
            } else {
                obj.oid()
            };
            obj.set_oid(oid);
            objects.insert(oid, Arc::new(tokio::sync::Mutex::new(obj.clone())));
            oid
        };
        self.update(&obj)?;
        slog::debug!(self.log, "allocated"; "oid" => oid);
        Ok(oid)
    }

    /// Removes an object from the pool and the store.
    pub fn drop_object(&self, oid: ObjectId) -> Result<(), PoolError> {
        self.objects.lock().unwrap().remove(&oid);
        self.store.delete(T::TABLE, &oid.to_string())
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.objects.lock().unwrap().keys().copied().collect()
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }
}

/// All pools the managers operate on.
pub struct Pools {
    pub vms: VmPool,
    pub hosts: HostPool,
    pub datastores: Pool<Datastore>,
    pub images: Pool<Image>,
    pub vnets: Pool<VirtualNetwork>,
    pub secgroups: Pool<SecurityGroup>,
    pub clusters: Pool<Cluster>,
    pub vmgroups: Pool<VmGroup>,
    pub vrouters: Pool<VirtualRouter>,
}

impl Pools {
    pub fn new(store: Arc<dyn ObjectStore>, log: &Logger) -> Self {
        Self {
            vms: VmPool::new(Arc::clone(&store), log),
            hosts: HostPool::new(Arc::clone(&store), log),
            datastores: Pool::new(Arc::clone(&store), log),
            images: Pool::new(Arc::clone(&store), log),
            vnets: Pool::new(Arc::clone(&store), log),
            secgroups: Pool::new(Arc::clone(&store), log),
            clusters: Pool::new(Arc::clone(&store), log),
            vmgroups: Pool::new(Arc::clone(&store), log),
            vrouters: Pool::new(store, log),
        }
    }

    /// Pools backed by a [`MemoryStore`].
    pub fn in_memory(log: &Logger) -> Self {
        Self::new(Arc::new(MemoryStore::new()), log)
    }
}
