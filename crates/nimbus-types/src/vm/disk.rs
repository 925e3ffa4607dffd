// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};

use crate::vm::DiskSnapshots;
use crate::{ObjectId, VectorAttribute};

/// A `DISK` section of a VM plus its snapshot tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineDisk {
    pub attrs: VectorAttribute,
    pub snapshots: DiskSnapshots,
}

impl From<VectorAttribute> for VirtualMachineDisk {
    fn from(attrs: VectorAttribute) -> Self {
        Self { attrs, snapshots: DiskSnapshots::default() }
    }
}

impl VirtualMachineDisk {
    pub fn disk_id(&self) -> Option<u32> {
        self.attrs.get("DISK_ID")
    }

    pub fn disk_type(&self) -> String {
        self.attrs.vector_value("TYPE").unwrap_or_default().to_uppercase()
    }

    /// Volatile disks are created on the host and have no backing image.
    pub fn is_volatile(&self) -> bool {
        !self.attrs.contains("IMAGE_ID")
            && matches!(self.disk_type().as_str(), "SWAP" | "FS")
    }

    pub fn image_id(&self) -> Option<ObjectId> {
        self.attrs.get("IMAGE_ID")
    }

    pub fn size(&self) -> Option<u64> {
        self.attrs.get("SIZE")
    }

    pub fn format(&self) -> Option<&str> {
        self.attrs.vector_value("FORMAT")
    }

    pub fn tm_mad(&self) -> Option<&str> {
        self.attrs.vector_value("TM_MAD")
    }

    pub fn tm_mad_system(&self) -> Option<&str> {
        self.attrs.vector_value("TM_MAD_SYSTEM")
    }

    pub fn datastore_id(&self) -> Option<ObjectId> {
        self.attrs.get("DATASTORE_ID")
    }

    pub fn source(&self) -> Option<&str> {
        self.attrs.vector_value("SOURCE")
    }

    pub fn is_clone(&self) -> bool {
        self.attrs.is_yes("CLONE")
    }

    /// Disks saved back to their image on epilog.
    pub fn is_save(&self) -> bool {
        self.attrs.is_yes("SAVE")
    }

    pub fn is_persistent(&self) -> bool {
        self.attrs.is_yes("PERSISTENT")
    }

    /// Disk space consumed on the system datastore, in MiB.
    pub fn system_size(&self) -> u64 {
        if self.is_volatile() || self.is_clone() {
            self.size().unwrap_or(0) + self.snapshots.total_size()
        } else {
            0
        }
    }

    pub fn is_attaching(&self) -> bool {
        self.attrs.is_yes("ATTACH")
    }

    pub fn is_detaching(&self) -> bool {
        self.attrs.is_yes("DETACH")
    }

    pub fn is_resizing(&self) -> bool {
        self.attrs.is_yes("RESIZE")
    }

    pub fn has_snapshot_pending(&self) -> bool {
        self.attrs.is_yes("DISK_SNAPSHOT_ACTIVE")
    }

    pub fn is_saving_as(&self) -> bool {
        self.attrs.is_yes("HOTPLUG_SAVE_AS_ACTIVE")
    }
}
