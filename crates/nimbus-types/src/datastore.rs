// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::ObjectId;

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DatastoreType {
    #[default]
    Image,
    System,
    File,
    Backup,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Datastore {
    pub oid: ObjectId,
    pub name: String,
    pub ds_type: DatastoreType,
    /// Transfer driver used for disks staged from (or onto) this datastore.
    pub tm_mad: String,
    pub base_path: String,
}

impl Datastore {
    pub fn new(oid: ObjectId, name: &str, ds_type: DatastoreType, tm_mad: &str) -> Self {
        Self {
            oid,
            name: name.to_string(),
            ds_type,
            tm_mad: tm_mad.to_string(),
            base_path: String::new(),
        }
    }
}
