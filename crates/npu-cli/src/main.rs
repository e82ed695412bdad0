// SPDX-License-Identifier: AGPL-3.0-only

//! `npu`: command-line front end for the NPU driver core.
//!
//! ```text
//! USAGE:
//!   npu query [--cores N | --device /dev/uioN]   Device database snapshot
//!   npu run   [--cores N] [--tasks K] ...        Synthetic workload on the simulator
//!   npu power [--cores N] [--core C]             Walk one unit through its power states
//! ```

use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand};
use npu_chip::variant::ChipVariant;
use npu_driver::prelude::*;
use npu_driver::{Database, DeviceConfig, NpuError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Submit attempts before giving up on a retryable error
const SUBMIT_ATTEMPTS: u32 = 8;

#[derive(Parser)]
#[command(name = "npu", about = "Multi-core NPU driver CLI", version)]
struct Cli {
    /// Log at debug level (overrides RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Args)]
struct Sim {
    /// Simulated core count (1-4).
    #[arg(long, default_value_t = 4)]
    cores: u8,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the device database.
    Query {
        #[command(flatten)]
        sim: Sim,
        /// Open a register-window device node instead of the simulator.
        #[arg(long)]
        device: Option<std::path::PathBuf>,
    },
    /// Drive a synthetic workload through the simulated device.
    Run {
        #[command(flatten)]
        sim: Sim,
        /// Number of tasks.
        #[arg(long, default_value_t = 32)]
        tasks: u32,
        /// Cores per task.
        #[arg(long, default_value_t = 1)]
        width: u8,
        /// Simulated run time per task (ms).
        #[arg(long, default_value_t = 2)]
        exec_ms: u64,
        /// Let the scheduler place every task.
        #[arg(long)]
        auto: bool,
    },
    /// Walk one unit through its power states.
    Power {
        #[command(flatten)]
        sim: Sim,
        /// Core to drive.
        #[arg(long, default_value_t = 0)]
        core: u8,
        /// Clock rate to request while running (kHz).
        #[arg(long)]
        freq_khz: Option<u32>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into())
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Cmd::Query { sim, device } => cmd_query(&sim, device.as_deref())?,
        Cmd::Run {
            sim,
            tasks,
            width,
            exec_ms,
            auto,
        } => cmd_run(&sim, tasks, width, Duration::from_millis(exec_ms), auto)?,
        Cmd::Power {
            sim,
            core,
            freq_khz,
        } => cmd_power(&sim, core, freq_khz)?,
    }

    Ok(())
}

fn simulator(sim: &Sim, behavior: JobBehavior) -> Result<Arc<SimulatedNpu>> {
    let variant = ChipVariant::with_cores(sim.cores)
        .ok_or_else(|| anyhow!("no part with {} cores", sim.cores))?;
    debug!("Simulating {variant}");
    Ok(Arc::new(SimulatedNpu::new(sim.cores).with_default_behavior(behavior)))
}

fn open(sim: &Sim, device: Option<&std::path::Path>) -> Result<Device> {
    let cfg = DeviceConfig::from_env();
    let hw: Arc<dyn NpuHardware> = match device {
        #[cfg(target_os = "linux")]
        Some(path) => Arc::new(npu_driver::backends::MmioNpu::open(path)?),
        #[cfg(not(target_os = "linux"))]
        Some(_) => bail!("--device is only supported on Linux"),
        None => simulator(sim, JobBehavior::Complete(Duration::from_millis(1)))?,
    };
    Ok(Device::new(hw, cfg)?)
}

fn print_database(db: &Database) {
    println!("Variant      : {} ({} cores)", db.variant, db.core_count);
    println!("Slots        : {} / {}", db.slots.len, db.slots.capacity);
    println!("Suspended    : {}", db.suspended);
    println!("History      : {} descriptors", db.history_len);
    println!();
    println!("Core  Power   Clock(kHz)  In-flight  IRQs      Failed");
    for u in &db.units {
        println!(
            "{:<5} {:<7} {:<11} {:<10} {:<9} {}",
            u.core,
            format!("{}{}", u.power_state, if u.suspended { "*" } else { "" }),
            u.freq_khz,
            format!("{}/{}", u.in_flight, u.wait_link_depth),
            u.irq_count,
            if u.failed { "yes" } else { "no" }
        );
    }
    println!();
    println!("Shape     Queued  Estimated");
    for s in db.shapes.iter().filter(|s| s.task_count > 0) {
        println!("{:<9} {:<7} {:?}", s.shape.to_string(), s.task_count, s.estimated_time);
    }
    let c = &db.counters;
    println!();
    println!(
        "Submitted {}  completed {}  canceled {}  recovered {}  faulted {}  timed out {}  recoveries {}",
        c.submitted, c.completed, c.canceled, c.recovered, c.faulted, c.timed_out, c.recoveries
    );
}

fn cmd_query(sim: &Sim, device: Option<&std::path::Path>) -> Result<()> {
    let dev = open(sim, device)?;
    print_database(&dev.query_database());
    Ok(())
}

/// Submit, backing off while the queue or slot map is full
fn submit_with_retry(dev: &Device, task: &Task) -> Result<TaskHandle> {
    let mut backoff = Duration::from_millis(1);
    for attempt in 1..=SUBMIT_ATTEMPTS {
        match dev.submit(task.clone()) {
            Ok(handle) => return Ok(handle),
            Err(e) if e.is_retryable() && attempt < SUBMIT_ATTEMPTS => {
                warn!("Task {} attempt {attempt}: {e}, retrying in {backoff:?}", task.task_id);
                std::thread::sleep(backoff);
                backoff *= 2;
            }
            Err(e) => return Err(e.into()),
        }
    }
    bail!("task {} not accepted after {SUBMIT_ATTEMPTS} attempts", task.task_id)
}

fn cmd_run(sim: &Sim, tasks: u32, width: u8, exec: Duration, auto: bool) -> Result<()> {
    if width == 0 || width > sim.cores {
        bail!("--width must be within 1..={}", sim.cores);
    }
    let hw = simulator(sim, JobBehavior::Complete(exec))?;
    let dev = Device::new(hw, DeviceConfig::from_env())?;
    let windows = sim.cores - width + 1;

    let started = Instant::now();
    let mut handles = Vec::new();
    for id in 0..tasks {
        #[allow(clippy::cast_possible_truncation)]
        let start = if auto { 0 } else { (id % u32::from(windows)) as u8 };
        let base = 0x1000_0000 + u64::from(id) * 0x1000;
        let mut task = Task::new(id, CommandBuffer::for_window(base, start, width, &[0x100]))
            .with_cores(start, width)
            .with_descriptor(0xd0);
        if auto {
            task = task.auto_scheduled();
        }
        handles.push(submit_with_retry(&dev, &task)?);
    }
    info!("Submitted {tasks} tasks");

    let mut failed = 0u32;
    for handle in handles {
        match dev.wait_default(handle) {
            Ok(()) => {}
            Err(e @ (NpuError::Canceled | NpuError::Recovered)) => {
                warn!("Task {}: {e}", handle.task_id());
                failed += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    let elapsed = started.elapsed();

    print_database(&dev.query_database());
    println!();
    #[allow(clippy::cast_precision_loss)]
    let rate = f64::from(tasks) / elapsed.as_secs_f64().max(f64::EPSILON);
    println!("{tasks} tasks in {elapsed:?} ({rate:.0} tasks/s), {failed} not completed");
    Ok(())
}

fn cmd_power(sim: &Sim, core: u8, freq_khz: Option<u32>) -> Result<()> {
    let hw = simulator(sim, JobBehavior::Manual)?;
    let dev = Device::new(hw, DeviceConfig::from_env())?;
    println!("core {core}: {}", dev.power_state(core)?);

    let mut walk = vec![PowerEvent::TimerDisable, PowerEvent::ClockOn];
    if let Some(khz) = freq_khz {
        walk.push(PowerEvent::SetFrequency(khz));
    }
    walk.extend([
        PowerEvent::Run,
        PowerEvent::End,
        PowerEvent::Timeout,
        PowerEvent::ForceOff,
        PowerEvent::ForceOn,
        PowerEvent::TimerEnable,
    ]);
    for event in walk {
        let state = dev.power_event(core, event)?;
        println!("  {event:?} -> {state}");
    }
    Ok(())
}
