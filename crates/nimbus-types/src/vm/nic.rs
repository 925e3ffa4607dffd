// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::{ObjectId, VectorAttribute};

/// A `NIC` section of a VM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineNic {
    pub attrs: VectorAttribute,
}

impl From<VectorAttribute> for VirtualMachineNic {
    fn from(attrs: VectorAttribute) -> Self {
        Self { attrs }
    }
}

impl VirtualMachineNic {
    pub fn nic_id(&self) -> Option<u32> {
        self.attrs.get("NIC_ID")
    }

    pub fn network_id(&self) -> Option<ObjectId> {
        self.attrs.get("NETWORK_ID")
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.attrs.get("IP")
    }

    /// Security groups listed in the comma separated `SECURITY_GROUPS`.
    pub fn security_groups(&self) -> BTreeSet<ObjectId> {
        self.attrs
            .vector_value("SECURITY_GROUPS")
            .map(|v| v.split(',').filter_map(|s| s.trim().parse().ok()).collect())
            .unwrap_or_default()
    }

    pub fn set_security_groups(&mut self, sgs: &BTreeSet<ObjectId>) {
        let list: Vec<String> = sgs.iter().map(|id| id.to_string()).collect();
        self.attrs.replace("SECURITY_GROUPS", list.join(","));
    }

    pub fn is_attaching(&self) -> bool {
        self.attrs.is_yes("ATTACH")
    }

    pub fn is_detaching(&self) -> bool {
        self.attrs.is_yes("DETACH")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_group_list() {
        let mut nic = VirtualMachineNic::from(VectorAttribute::from_pairs(
            "NIC",
            [("NIC_ID", "0"), ("SECURITY_GROUPS", "0, 3,bad")],
        ));
        assert_eq!(nic.security_groups(), BTreeSet::from([0, 3]));
        nic.set_security_groups(&BTreeSet::from([4, 1]));
        assert_eq!(nic.attrs.vector_value("SECURITY_GROUPS"), Some("1,4"));
    }
}
