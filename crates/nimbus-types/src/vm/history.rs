// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};

use crate::{HistoryReason, ObjectId, Timestamp, VmAction};

/// Accounting record for one execution episode of a VM on one host.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    pub seq: u32,
    pub hid: ObjectId,
    pub hostname: String,
    pub cluster_id: ObjectId,
    pub vmm_mad: String,
    /// Transfer driver of the system datastore.
    pub tm_mad: String,
    pub ds_id: ObjectId,
    /// VM directory inside the system datastore, identical on the host and
    /// on the front-end.
    pub system_dir: String,
    pub public_cloud: bool,
    /// The VM files were moved back to the front-end (stopped or
    /// undeployed).
    pub on_frontend: bool,

    pub stime: Timestamp,
    pub etime: Timestamp,
    pub prolog_stime: Timestamp,
    pub prolog_etime: Timestamp,
    pub running_stime: Timestamp,
    pub running_etime: Timestamp,
    pub epilog_stime: Timestamp,
    pub epilog_etime: Timestamp,

    pub action: VmAction,
    pub uid: Option<ObjectId>,
    pub gid: Option<ObjectId>,
    pub req_id: Option<i64>,
    pub reason: HistoryReason,
}

impl History {
    /// Copies host placement into a fresh record with sequence `seq`, with
    /// all timestamps and the action reset.
    ///
    /// A reopened record always starts with the files on the host.
    pub fn reopen(&self, seq: u32) -> Self {
        Self {
            seq,
            hid: self.hid,
            hostname: self.hostname.clone(),
            cluster_id: self.cluster_id,
            vmm_mad: self.vmm_mad.clone(),
            tm_mad: self.tm_mad.clone(),
            ds_id: self.ds_id,
            system_dir: self.system_dir.clone(),
            public_cloud: self.public_cloud,
            ..Default::default()
        }
    }
}
