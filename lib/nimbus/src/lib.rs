// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control core of the VM orchestrator.
//!
//! Four managers cooperate to move virtual machines through their lifecycle:
//!
//! - [`dm::DispatchManager`] validates user actions against the VM state and
//!   starts them.
//! - [`lcm::LifeCycleManager`] owns the VM state machine.
//! - [`tm::TransferManager`] turns transitions into transfer scripts for the
//!   storage driver.
//! - [`vmm::VirtualMachineManager`] sends hypervisor operations to the
//!   virtualization drivers.
//!
//! Each manager consumes its own FIFO action queue on a single thread (see
//! [`listener`]); managers talk to each other only by pushing onto those
//! queues, through the cheap handle types each module exports. Driver
//! completions re-enter the state machine the same way.

pub mod dm;
pub mod driver;
pub mod lcm;
pub mod listener;
pub mod orchestrator;
pub mod pool;
pub mod quota;
pub mod tm;
pub mod vmm;

pub use orchestrator::{Drivers, Orchestrator};

use nimbus_types::{ObjectId, Timestamp};

/// Identity of the user behind a request, recorded in history records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestAttributes {
    pub uid: Option<ObjectId>,
    pub gid: Option<ObjectId>,
    pub req_id: Option<i64>,
}

impl RequestAttributes {
    pub fn new(uid: ObjectId, gid: ObjectId, req_id: i64) -> Self {
        Self { uid: Some(uid), gid: Some(gid), req_id: Some(req_id) }
    }
}

pub(crate) fn now() -> Timestamp {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
pub(crate) mod test_util {
    /// A logger for tests that writes to the captured test output.
    pub fn test_logger() -> slog::Logger {
        use slog::Drain;
        let decorator = slog_term::PlainSyncDecorator::new(
            slog_term::TestStdoutWriter,
        );
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog::Logger::root(drain, slog::o!())
    }
}
