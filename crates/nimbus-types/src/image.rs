// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::ObjectId;

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageState {
    #[default]
    Init,
    Ready,
    Used,
    Disabled,
    Locked,
    Error,
    UsedPers,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageType {
    #[default]
    Os,
    Cdrom,
    Datablock,
    Kernel,
    Ramdisk,
    Context,
    Backup,
}

/// One increment of a backup image chain.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupIncrement {
    pub id: i64,
    pub source: String,
    pub size: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub oid: ObjectId,
    pub uid: ObjectId,
    pub gid: ObjectId,
    pub name: String,
    pub datastore_id: ObjectId,
    pub source: String,
    pub image_type: ImageType,
    pub state: ImageState,
    pub persistent: bool,
    /// Size in MiB.
    pub size: u64,
    pub format: String,
    pub running_vms: BTreeSet<ObjectId>,
    pub increments: Vec<BackupIncrement>,
}

impl Image {
    /// Registers `vid` as a user of the image.
    pub fn acquire(&mut self, vid: ObjectId) -> Result<(), String> {
        match self.state {
            ImageState::Ready | ImageState::Used if !self.persistent => {
                self.running_vms.insert(vid);
                self.state = ImageState::Used;
                Ok(())
            }
            ImageState::Ready if self.persistent => {
                self.running_vms.insert(vid);
                self.state = ImageState::UsedPers;
                Ok(())
            }
            ImageState::UsedPers => Err(format!(
                "Cannot acquire image {}, it is persistent and already in use",
                self.oid
            )),
            state => Err(format!(
                "Cannot acquire image {}, it is in state {state}",
                self.oid
            )),
        }
    }

    /// Drops `vid` as a user; the image returns to `Ready` once unused.
    pub fn release(&mut self, vid: ObjectId, failed: bool) {
        self.running_vms.remove(&vid);
        if failed && self.persistent {
            self.state = ImageState::Error;
        } else if self.running_vms.is_empty()
            && matches!(self.state, ImageState::Used | ImageState::UsedPers)
        {
            self.state = ImageState::Ready;
        }
    }

    /// Merges the oldest `count` increments into the one that follows
    /// them, which becomes the new full backup of the chain.
    pub fn flatten(&mut self, count: usize) {
        if count == 0 || count >= self.increments.len() {
            return;
        }
        let merged: u64 = self.increments.drain(..count).map(|i| i.size).sum();
        if let Some(base) = self.increments.first_mut() {
            base.size += merged;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistent_images_have_a_single_user() {
        let mut img = Image {
            oid: 4,
            persistent: true,
            state: ImageState::Ready,
            ..Default::default()
        };
        img.acquire(1).unwrap();
        assert_eq!(img.state, ImageState::UsedPers);
        assert!(img.acquire(2).is_err());
        img.release(1, false);
        assert_eq!(img.state, ImageState::Ready);
    }

    #[test]
    fn flatten_folds_old_increments_into_the_next_one() {
        let inc = |id, size| BackupIncrement { id, source: format!("inc{id}"), size };
        let mut img = Image {
            increments: vec![inc(0, 100), inc(1, 10), inc(2, 20), inc(3, 30)],
            ..Default::default()
        };
        img.flatten(2);
        assert_eq!(img.increments.len(), 2);
        assert_eq!(img.increments[0].id, 2);
        assert_eq!(img.increments[0].size, 130);
        assert_eq!(img.increments[0].source, "inc2");

        img.flatten(5);
        assert_eq!(img.increments.len(), 2);
    }
}
