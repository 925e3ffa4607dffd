// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Propagation of security group and virtual network changes to member
//! VMs, one running VM at a time.

use nimbus_types::{LcmState, ObjectId, VirtualMachine, VmState};
use slog::{error, warn};

use super::LifeCycleManager;
use crate::pool::{MemberSets, Pool, PoolObject};
use crate::vmm::VmmOp;

/// Where a member VM ends up after one propagation step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MemberOutcome {
    /// The VM is gone or no longer references the object.
    Gone,
    /// The VM is busy with another operation.
    Error,
    /// Only the stored template needed the change.
    Template,
    /// The running VM needs a driver update.
    Updating,
}

impl LifeCycleManager {
    pub(super) fn updatesg_action(&self, sgid: ObjectId) {
        loop {
            let (vid, rules) = {
                let Some(sg) = self.pools.secgroups.get(sgid) else {
                    warn!(self.log, "security group does not exist"; "sg_id" => sgid);
                    return;
                };
                if sg.members.is_updating() {
                    return;
                }
                let Some(vid) = sg.members.get_outdated() else {
                    return;
                };
                (vid, sg.vm_rules())
            };

            let outcome = self.refresh_member(
                vid,
                |vm| vm.security_groups().contains(&sgid),
                |vm| vm.set_sg_rules(sgid, rules),
            );
            // Marked updating before the driver is asked, so its reply
            // always finds the VM in the updating set.
            if self.settle_member(&self.pools.secgroups, sgid, vid, outcome) {
                self.vmm.trigger(vid, VmmOp::UpdateSg { sgid });
                return;
            }
        }
    }

    pub(super) fn updatevnet_action(&self, vnid: ObjectId) {
        loop {
            let (vid, attributes) = {
                let Some(vnet) = self.pools.vnets.get(vnid) else {
                    warn!(self.log, "virtual network does not exist"; "vnet_id" => vnid);
                    return;
                };
                if vnet.members.is_updating() {
                    return;
                }
                let Some(vid) = vnet.members.get_outdated() else {
                    return;
                };
                (vid, vnet.attributes.clone())
            };

            let outcome = self.refresh_member(
                vid,
                |vm| vm.nics.iter().any(|n| n.network_id() == Some(vnid)),
                |vm| {
                    for nic in vm.nics.iter_mut().filter(|n| n.network_id() == Some(vnid)) {
                        for (k, v) in &attributes {
                            nic.attrs.replace(k, v.clone());
                        }
                    }
                },
            );
            if self.settle_member(&self.pools.vnets, vnid, vid, outcome) {
                self.vmm.trigger(vid, VmmOp::UpdateNic { vnid });
                return;
            }
        }
    }

    /// Applies the change to one member VM. Running VMs still need the
    /// matching driver update.
    fn refresh_member(
        &self,
        vid: ObjectId,
        is_member: impl Fn(&VirtualMachine) -> bool,
        apply: impl FnOnce(&mut VirtualMachine),
    ) -> MemberOutcome {
        let Some(mut vm) = self.pools.vms.get(vid) else {
            return MemberOutcome::Gone;
        };
        if vm.state() == VmState::Done || !is_member(&vm) {
            return MemberOutcome::Gone;
        }

        match (vm.state(), vm.lcm_state()) {
            (VmState::Active, LcmState::Running) => {
                apply(&mut vm);
                self.update(&vm);
                MemberOutcome::Updating
            }
            (VmState::Active, _) => {
                self.wrong_state("update", &vm);
                MemberOutcome::Error
            }
            _ => {
                apply(&mut vm);
                self.update(&vm);
                MemberOutcome::Template
            }
        }
    }

    /// Records the outcome in the object's member sets. Returns true when a
    /// driver update has to be sent, which ends this round.
    fn settle_member<T: PoolObject + MemberSets>(
        &self,
        pool: &Pool<T>,
        id: ObjectId,
        vid: ObjectId,
        outcome: MemberOutcome,
    ) -> bool {
        let Some(mut obj) = pool.get(id) else {
            return false;
        };
        let members = obj.members_mut();
        match outcome {
            MemberOutcome::Gone => members.del_vm(vid),
            MemberOutcome::Error => members.add_error(vid),
            MemberOutcome::Template => members.add_vm(vid),
            MemberOutcome::Updating => members.add_updating(vid),
        }
        if let Err(e) = pool.update(&obj) {
            error!(self.log, "failed to persist member sets"; "oid" => id,
                "error" => %e);
        }
        outcome == MemberOutcome::Updating
    }
}
