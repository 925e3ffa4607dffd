// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-process stand-ins for the external drivers. Every request succeeds.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use nimbus::driver::{DriverChannel, Message, RecordingDriver};
use nimbus::tm::TmMessage;
use nimbus::vmm::{VmmMessage, VmmRequest};
use nimbus::{Drivers, Orchestrator};
use slog::{debug, warn, Logger};

pub struct Simulator {
    transfer: Arc<RecordingDriver>,
    vmm: BTreeMap<String, Arc<RecordingDriver>>,
    log: Logger,
}

impl Simulator {
    /// Creates recording drivers for storage and for every hypervisor
    /// driver in `vmm_mads`.
    pub fn new(vmm_mads: BTreeSet<String>, log: &Logger) -> Self {
        Self {
            transfer: Arc::new(RecordingDriver::new()),
            vmm: vmm_mads
                .into_iter()
                .map(|name| (name, Arc::new(RecordingDriver::new())))
                .collect(),
            log: log.new(slog::o!("component" => "simulator")),
        }
    }

    pub fn drivers(&self) -> Drivers {
        Drivers {
            transfer: self.transfer.clone(),
            vmm: self
                .vmm
                .iter()
                .map(|(name, d)| (name.clone(), d.clone() as Arc<dyn DriverChannel>))
                .collect(),
        }
    }

    /// Runs the managers and answers driver requests until nothing is left
    /// to do. Returns the number of requests answered.
    pub fn settle(&self, orch: &Orchestrator) -> usize {
        let mut answered = 0;
        loop {
            orch.run_until_idle();
            let mut replies = 0;
            for line in self.transfer.take() {
                if let Some(reply) = self.transfer_reply(&line) {
                    orch.tm_handle().driver_message(reply);
                    replies += 1;
                }
            }
            for (name, driver) in &self.vmm {
                for line in driver.take() {
                    if let Some(reply) = self.vmm_reply(&line) {
                        orch.vmm_handle().driver_message(name, reply);
                        replies += 1;
                    }
                }
            }
            if replies == 0 {
                return answered;
            }
            answered += replies;
        }
    }

    fn transfer_reply(&self, line: &str) -> Option<String> {
        let msg: Message<TmMessage> = match line.parse() {
            Ok(msg) => msg,
            Err(e) => {
                warn!(self.log, "unparsable transfer request"; "line" => line, "error" => %e);
                return None;
            }
        };
        debug!(self.log, "transfer request"; "vm_id" => msg.oid, "script" => &msg.payload);
        match msg.kind {
            TmMessage::Transfer => Some(format!("TRANSFER SUCCESS {} -", msg.oid)),
            _ => None,
        }
    }

    fn vmm_reply(&self, line: &str) -> Option<String> {
        let msg: Message<VmmMessage> = match line.parse() {
            Ok(msg) => msg,
            Err(e) => {
                warn!(self.log, "unparsable hypervisor request"; "line" => line, "error" => %e);
                return None;
            }
        };
        let vid = msg.oid;
        let arg = |key: &str| {
            VmmRequest::decode(&msg.payload)
                .ok()
                .and_then(|req| req.args.get(key).cloned())
                .unwrap_or_else(|| "-".to_string())
        };
        let payload = match msg.kind {
            VmmMessage::Deploy => format!("sim-{vid}"),
            VmmMessage::SnapshotCreate => format!("sim-snap-{vid}"),
            VmmMessage::Backup => format!("/backups/{vid} 0"),
            VmmMessage::UpdateSg => arg("sg_id"),
            VmmMessage::UpdateNic => arg("vnet_id"),
            VmmMessage::Poll | VmmMessage::Log | VmmMessage::DriverCancel => return None,
            _ => "-".to_string(),
        };
        Some(format!("{} SUCCESS {vid} {payload}", msg.kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim() -> Simulator {
        let log = slog::Logger::root(slog::Discard, slog::o!());
        Simulator::new(["kvm".to_string()].into(), &log)
    }

    #[test]
    fn transfer_requests_succeed() {
        let s = sim();
        assert_eq!(
            s.transfer_reply("TRANSFER - 4 /var/lib/nimbus/vms/4/transfer.0.prolog"),
            Some("TRANSFER SUCCESS 4 -".to_string())
        );
        assert_eq!(s.transfer_reply("DRIVER_CANCEL - 4"), None);
    }

    #[test]
    fn deploy_gets_a_deploy_id() {
        let s = sim();
        assert_eq!(s.vmm_reply("DEPLOY - 2 e30="), Some("DEPLOY SUCCESS 2 sim-2".to_string()));
        assert_eq!(s.vmm_reply("SHUTDOWN - 2 e30="), Some("SHUTDOWN SUCCESS 2 -".to_string()));
    }
}
