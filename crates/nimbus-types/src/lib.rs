// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data model shared by the orchestrator core: virtual machines and their
//! lifecycle states, plus the hosts, datastores, images, networks and groups
//! that a VM references while it moves through its lifecycle.

pub mod cluster;
pub mod datastore;
pub mod host;
pub mod image;
pub mod network;
pub mod state;
pub mod template;
pub mod vm;

pub use cluster::{Cluster, VirtualRouter, VmGroup};
pub use datastore::{Datastore, DatastoreType};
pub use host::{Host, HostCapacity, HostShare};
pub use image::{BackupIncrement, Image, ImageState, ImageType};
pub use network::{SecurityGroup, UpdateSets, VirtualNetwork};
pub use state::{HistoryReason, LcmState, VmAction, VmState};
pub use template::VectorAttribute;
pub use vm::{
    Backups, DiskSnapshot, DiskSnapshots, History, PendingOp, PendingResize,
    RestoreRequest, SaveAsRequest, SnapshotOp, VirtualMachine, VirtualMachineDisk,
    VirtualMachineNic, VmSnapshot,
};

/// Object identifier used by every pooled object.
pub type ObjectId = u32;

/// Seconds since the UNIX epoch, as stored in history records.
pub type Timestamp = i64;
