// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{BTreeMap, BTreeSet};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use nimbus::driver::{DriverChannel, ProcessDriver};
use nimbus::pool::Pools;
use nimbus::quota::QuotaLedger;
use nimbus::{Drivers, Orchestrator, RequestAttributes};
use nimbus_config::Config;
use slog::{error, info, o, Drain};

mod commands;
mod inventory;
mod simulator;

use commands::Outcome;
use inventory::Inventory;
use simulator::Simulator;

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Runs the orchestrator core against a static inventory
struct Args {
    /// Orchestrator configuration (TOML).
    #[clap(action)]
    config: PathBuf,

    /// Hosts, datastores, images, networks and VMs to load (TOML).
    #[clap(action)]
    inventory: PathBuf,

    /// Answer every driver request in-process instead of spawning the
    /// configured drivers.
    #[clap(long, action)]
    simulate: bool,
}

fn build_logger(level: slog::Level) -> slog::Logger {
    let main_drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain =
            slog_bunyan::with_name("nimbus-standalone", std::io::stdout())
                .build()
                .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let filtered_main = slog::LevelFilter::new(main_drain, level);
    slog::Logger::root(filtered_main.fuse(), o!())
}

fn print_outcome(line: &str, outcome: anyhow::Result<Outcome>) {
    match outcome {
        Ok(Outcome::Done) => println!("{line}: ok"),
        Ok(Outcome::Allocated(id)) => println!("{line}: {id}"),
        Ok(Outcome::Show(text)) => println!("{text}"),
        Err(e) => println!("{line}: error: {e:#}"),
    }
}

/// Allocates the inventory's VMs and returns an orchestrator ready to run.
fn build(
    config: &Config,
    inventory: &Inventory,
    drivers: Drivers,
    log: &slog::Logger,
) -> anyhow::Result<Orchestrator> {
    let pools = Arc::new(Pools::in_memory(log));
    inventory.populate(&pools)?;

    let orch = Orchestrator::new(
        config.clone(),
        pools,
        Arc::new(QuotaLedger::new()),
        drivers,
        log,
    );
    for entry in &inventory.vms {
        let vid = orch
            .dm()
            .allocate(entry.to_vm(), entry.hold)
            .with_context(|| format!("failed to allocate VM {}", entry.name))?;
        info!(log, "allocated VM"; "vm_id" => vid, "name" => &entry.name);
    }
    Ok(orch)
}

fn run_simulated(
    config: &Config,
    inventory: &Inventory,
    log: &slog::Logger,
) -> anyhow::Result<()> {
    let mut mads: BTreeSet<String> =
        inventory.hosts.iter().map(|h| h.vmm_mad.clone()).collect();
    mads.extend(config.vmm_drivers.keys().cloned());

    let sim = Simulator::new(mads, log);
    let orch = build(config, inventory, sim.drivers(), log)?;
    let ra = RequestAttributes::default();

    sim.settle(&orch);
    for line in &inventory.actions {
        print_outcome(line, commands::run(orch.dm(), line, &ra));
        let answered = sim.settle(&orch);
        info!(log, "settled"; "action" => line, "driver_replies" => answered);
    }
    Ok(())
}

struct Spawned {
    transfer: Arc<ProcessDriver>,
    vmm: BTreeMap<String, Arc<ProcessDriver>>,
}

impl Spawned {
    fn spawn(config: &Config, log: &slog::Logger) -> anyhow::Result<Self> {
        let exe = config
            .transfer_driver
            .executable
            .as_ref()
            .ok_or_else(|| anyhow!("transfer_driver.executable is not set"))?;
        let transfer = ProcessDriver::spawn(
            "transfer",
            exe,
            &config.transfer_driver.arguments,
            log,
        )
        .context("failed to start the transfer driver")?;

        let mut vmm = BTreeMap::new();
        for (name, driver) in &config.vmm_drivers {
            let exe = driver.driver.executable.as_ref().ok_or_else(|| {
                anyhow!("vmm_driver.{name}.executable is not set")
            })?;
            let d = ProcessDriver::spawn(name, exe, &driver.driver.arguments, log)
                .with_context(|| format!("failed to start driver {name}"))?;
            vmm.insert(name.clone(), Arc::new(d));
        }
        Ok(Self { transfer: Arc::new(transfer), vmm })
    }

    fn drivers(&self) -> Drivers {
        Drivers {
            transfer: self.transfer.clone(),
            vmm: self
                .vmm
                .iter()
                .map(|(name, d)| (name.clone(), d.clone() as Arc<dyn DriverChannel>))
                .collect(),
        }
    }

    /// Routes driver output into the managers' queues.
    fn connect(&self, orch: &Orchestrator) -> anyhow::Result<()> {
        let tm = orch.tm_handle();
        self.transfer.start(move |line| tm.driver_message(line))?;
        for (name, driver) in &self.vmm {
            let vmm = orch.vmm_handle();
            let name = name.clone();
            driver.start(move |line| vmm.driver_message(&name, line))?;
        }
        Ok(())
    }

    fn stop(&self) {
        self.transfer.stop();
        for driver in self.vmm.values() {
            driver.stop();
        }
    }
}

fn run_with_drivers(
    config: &Config,
    inventory: &Inventory,
    log: &slog::Logger,
) -> anyhow::Result<()> {
    let spawned = Spawned::spawn(config, log)?;
    let orch = build(config, inventory, spawned.drivers(), log)?;
    spawned.connect(&orch)?;
    orch.start().context("failed to start managers")?;

    let ra = RequestAttributes::default();
    for line in &inventory.actions {
        print_outcome(line, commands::run(orch.dm(), line, &ra));
    }

    // Further commands come from stdin until EOF.
    for line in std::io::stdin().lock().lines() {
        let line = line.context("failed to read command")?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        print_outcome(line, commands::run(orch.dm(), line, &ra));
    }

    orch.shutdown();
    spawned.stop();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = nimbus_config::parse(&args.config).with_context(|| {
        format!("failed to read config {}", args.config.display())
    })?;
    let level = config
        .log_level
        .parse::<slog::Level>()
        .map_err(|_| anyhow!("invalid log level {:?}", config.log_level))?;
    let log = build_logger(level);

    let inventory = Inventory::load(&args.inventory)?;

    let res = if args.simulate {
        run_simulated(&config, &inventory, &log)
    } else {
        run_with_drivers(&config, &inventory, &log)
    };
    if let Err(e) = &res {
        error!(log, "nimbus-standalone failed"; "error" => format!("{e:#}"));
    }
    res
}
