// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wires the four managers together around their action queues.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use nimbus_config::Config;
use slog::{info, o, warn, Logger};

use crate::dm::{DispatchManager, DmHandle};
use crate::driver::DriverChannel;
use crate::lcm::{LcmHandle, LifeCycleManager};
use crate::listener::{self, ActionHandler, ActionQueue};
use crate::pool::Pools;
use crate::quota::Quotas;
use crate::tm::{TmHandle, TransferManager};
use crate::vmm::{VirtualMachineManager, VmmHandle};

/// Outbound driver channels.
pub struct Drivers {
    pub transfer: Arc<dyn DriverChannel>,
    /// Hypervisor drivers, keyed by the `vmm_mad` hosts refer to.
    pub vmm: BTreeMap<String, Arc<dyn DriverChannel>>,
}

pub struct Orchestrator {
    dm: Arc<DispatchManager>,
    lcm: Arc<LifeCycleManager>,
    tm: Arc<TransferManager>,
    vmm: Arc<VirtualMachineManager>,
    queues: Queues,
    threads: Mutex<Vec<JoinHandle<()>>>,
    log: Logger,
}

struct Queues {
    dm: Arc<ActionQueue<crate::dm::DmAction>>,
    lcm: Arc<ActionQueue<crate::lcm::LcmAction>>,
    tm: Arc<ActionQueue<crate::tm::TmAction>>,
    vmm: Arc<ActionQueue<crate::vmm::VmmAction>>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        pools: Arc<Pools>,
        quotas: Arc<dyn Quotas>,
        drivers: Drivers,
        log: &Logger,
    ) -> Self {
        let config = Arc::new(config);
        let queues = Queues {
            dm: Arc::new(ActionQueue::new()),
            lcm: Arc::new(ActionQueue::new()),
            tm: Arc::new(ActionQueue::new()),
            vmm: Arc::new(ActionQueue::new()),
        };
        let lcm_handle = LcmHandle::new(Arc::clone(&queues.lcm));
        let tm_handle = TmHandle::new(Arc::clone(&queues.tm));
        let vmm_handle = VmmHandle::new(Arc::clone(&queues.vmm));

        let dm = DispatchManager::new(
            Arc::clone(&queues.dm),
            Arc::clone(&pools),
            lcm_handle.clone(),
            tm_handle.clone(),
            vmm_handle.clone(),
            Arc::clone(&quotas),
            Arc::clone(&config),
            log,
        );
        let lcm = LifeCycleManager::new(
            Arc::clone(&queues.lcm),
            Arc::clone(&pools),
            tm_handle,
            vmm_handle,
            DmHandle::new(Arc::clone(&queues.dm)),
            quotas,
            Arc::clone(&config),
            log,
        );
        let tm = TransferManager::new(
            Arc::clone(&queues.tm),
            Arc::clone(&pools),
            lcm_handle.clone(),
            drivers.transfer,
            Arc::clone(&config),
            log,
        );
        let vmm = VirtualMachineManager::new(
            Arc::clone(&queues.vmm),
            pools,
            lcm_handle,
            drivers.vmm,
            config,
            log,
        );

        Self {
            dm: Arc::new(dm),
            lcm: Arc::new(lcm),
            tm: Arc::new(tm),
            vmm: Arc::new(vmm),
            queues,
            threads: Mutex::new(Vec::new()),
            log: log.new(o!("component" => "orchestrator")),
        }
    }

    /// Starts one consumer thread per manager.
    pub fn start(&self) -> std::io::Result<()> {
        let mut threads = self.threads.lock().unwrap();
        threads.push(listener::spawn("dm", Arc::clone(&self.dm), self.log.clone())?);
        threads.push(listener::spawn("lcm", Arc::clone(&self.lcm), self.log.clone())?);
        threads.push(listener::spawn("tm", Arc::clone(&self.tm), self.log.clone())?);
        threads.push(listener::spawn("vmm", Arc::clone(&self.vmm), self.log.clone())?);
        info!(self.log, "managers started");
        Ok(())
    }

    /// Runs queued actions on the calling thread until every queue is
    /// empty. Only meaningful when [`Orchestrator::start`] was not called.
    /// Returns the number of actions executed.
    pub fn run_until_idle(&self) -> usize {
        let mut executed = 0;
        loop {
            let before = executed;
            while self.dm.pump() {
                executed += 1;
            }
            while self.lcm.pump() {
                executed += 1;
            }
            while self.tm.pump() {
                executed += 1;
            }
            while self.vmm.pump() {
                executed += 1;
            }
            if executed == before {
                return executed;
            }
        }
    }

    pub fn dm(&self) -> &DispatchManager {
        &self.dm
    }

    pub fn pools(&self) -> &Arc<Pools> {
        self.dm.pools()
    }

    /// Entry point for monitoring events and queued group updates.
    pub fn lcm_handle(&self) -> LcmHandle {
        LcmHandle::new(Arc::clone(&self.queues.lcm))
    }

    /// Where replies of the transfer driver are delivered.
    pub fn tm_handle(&self) -> TmHandle {
        TmHandle::new(Arc::clone(&self.queues.tm))
    }

    /// Where replies of the hypervisor drivers are delivered.
    pub fn vmm_handle(&self) -> VmmHandle {
        VmmHandle::new(Arc::clone(&self.queues.vmm))
    }

    /// Finalizes every queue and waits for the consumer threads to drain
    /// them.
    pub fn shutdown(&self) {
        self.queues.dm.finalize();
        self.queues.lcm.finalize();
        self.queues.tm.finalize();
        self.queues.vmm.finalize();
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for thread in threads {
            let name = thread.thread().name().unwrap_or_default().to_string();
            if thread.join().is_err() {
                warn!(self.log, "manager thread panicked"; "manager" => name);
            }
        }
        info!(self.log, "managers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RecordingDriver;
    use crate::quota::QuotaLedger;
    use crate::test_util::test_logger;

    #[test]
    fn threads_drain_and_stop() {
        let log = test_logger();
        let pools = Arc::new(Pools::in_memory(&log));
        let drivers = Drivers {
            transfer: Arc::new(RecordingDriver::new()),
            vmm: BTreeMap::new(),
        };
        let orch = Orchestrator::new(
            Config::default(),
            pools,
            Arc::new(QuotaLedger::new()),
            drivers,
            &log,
        );
        orch.start().unwrap();
        orch.lcm_handle().updatesg(42);
        orch.shutdown();
        assert_eq!(orch.run_until_idle(), 0);
    }
}
