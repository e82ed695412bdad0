// SPDX-License-Identifier: AGPL-3.0-only

//! Device handle
//!
//! A [`Device`] groups the hardware units of one accelerator behind one
//! dispatch queue, one slot map and one pair of daemon threads.
//!
//! ```text
//! submit ─▶ SlotMap ─▶ DispatchQueue ─▶ submit daemon ─▶ power(on,run) ─▶ wait-link ─▶ hw
//!                                                                                     │
//! wait ◀── TCB release ◀── wait daemon (irq, deadlines, recovery) ◀──────────────────┘
//! ```
//!
//! Retirement is caller-driven: a TCB stays in the slot map until the
//! caller's `wait` observes its outcome, so a second submission of the same
//! task id cannot race the daemons for the slot.

use crate::config::DeviceConfig;
use crate::daemon::{self, SubmitMsg, WaitMsg};
use crate::database::{Database, ShapeInfo, SlotInfo, Stats, UnitInfo};
use crate::dispatch_queue::{CleanKind, DispatchQueue, QueuePayload};
use crate::error::{NpuError, Result};
use crate::hardware::{Hw, IrqCounters, IrqLine, NpuHardware};
use crate::power::{PowerEvent, PowerPolicy, PowerState, PowerUnit};
use crate::recovery::{CancelToken, RecoverGuard};
use crate::scheduler::{self, ExecHistory};
use crate::slot_map::{SlotId, SlotMap};
use crate::task::{Task, TaskHandle};
use crate::tcb::{TaskStatus, Tcb};
use crate::unit::HardwareUnit;
use crossbeam::channel::{self, Sender};
use npu_chip::topology::CoreTopology;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Poll interval while draining in-flight work
const DRAIN_POLL: Duration = Duration::from_millis(1);

/// State shared by the device handle and its daemons
#[derive(Debug)]
pub(crate) struct Shared {
    pub cfg: DeviceConfig,
    pub topo: CoreTopology,
    pub hw: Hw,
    pub epoch: Instant,
    pub slots: SlotMap<Tcb>,
    pub queue: DispatchQueue,
    pub units: Vec<HardwareUnit>,
    pub irqs: Arc<IrqCounters>,
    pub history: ExecHistory,
    pub submit_tx: Sender<SubmitMsg>,
    pub wait_tx: Sender<WaitMsg>,
    /// Dispatch takes it shared, recovery exclusive
    pub gate: RwLock<()>,
    pub recover: RecoverGuard,
    pub suspended: AtomicBool,
    pub shutting_down: AtomicBool,
    pub stats: Stats,
}

impl Shared {
    /// Time since device init
    pub(crate) fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// Cores marked permanently failed
    pub(crate) fn failed_mask(&self) -> u32 {
        self.units
            .iter()
            .filter(|u| u.is_failed())
            .fold(0, |m, u| m | (1 << u.core))
    }

    /// Lanes whose cores all have a free wait-link entry
    pub(crate) fn satisfiable_shapes(&self) -> u64 {
        self.queue.shape_mask_where(|shape| {
            shape
                .cores()
                .all(|c| self.units[usize::from(c)].has_capacity())
        })
    }

    /// Per-core outstanding work for the scheduler
    fn core_estimates(&self) -> Vec<Duration> {
        let now = self.now();
        let in_flight: Vec<Duration> = self.units.iter().map(|u| u.remaining(now)).collect();
        scheduler::core_estimates(&self.queue.per_core_load(), &in_flight)
    }

    fn unit(&self, core: u8) -> Result<&HardwareUnit> {
        self.units.get(usize::from(core)).ok_or_else(|| {
            NpuError::invalid_argument(format!("core {core} outside 0..{}", self.units.len()))
        })
    }

    /// Take a use of the TCB behind `handle`
    fn use_handle(&self, handle: TaskHandle) -> Option<Arc<Tcb>> {
        let tcb = self.slots.use_by_index(handle.slot)?;
        if tcb.task.key() == handle.key {
            Some(tcb)
        } else {
            self.slots.unuse(handle.slot, false);
            None
        }
    }

    /// Cores in `mask` whose oldest wait-link entry belongs to `slot`
    fn running_mask(&self, slot: SlotId, mask: u32) -> u32 {
        self.units
            .iter()
            .filter(|u| mask & (1 << u.core) != 0)
            .filter(|u| u.wait_link.head().is_some_and(|r| r.tag == slot))
            .fold(0, |m, u| m | (1 << u.core))
    }

    /// Remove and release a finished TCB; the caller's use is dropped too
    fn retire(&self, slot: SlotId, tcb: &Tcb) {
        if tcb.retire() {
            self.slots.remove_by_index(slot);
            // The submitter's use from insert.
            self.slots.unuse(slot, true);
        }
        self.slots.unuse(slot, true);
    }
}

/// One NPU with its daemons
#[derive(Debug)]
pub struct Device {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Device {
    /// Bring up every unit on `hardware` and start the daemons
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a bad configuration or core count, `Io` if a
    /// unit does not reach the idle pattern after reset.
    pub fn new(hardware: Arc<dyn NpuHardware>, cfg: DeviceConfig) -> Result<Self> {
        cfg.validate()?;
        let cores = hardware.core_count();
        let topo = CoreTopology::new(cores).ok_or_else(|| {
            NpuError::invalid_argument(format!("unsupported core count {cores}"))
        })?;

        let hw = Hw::new(Arc::clone(&hardware), cfg.io_retries);
        let policy = PowerPolicy {
            idle_timeout: cfg.idle_timeout,
            power_off_timeout: cfg.power_off_timeout,
            disable_clock_suspend: cfg.disable_clock_suspend,
        };
        let units: Vec<HardwareUnit> = (0..cores)
            .map(|c| {
                HardwareUnit::new(c, cfg.wait_link_depth, PowerUnit::new(c, hw.clone(), policy))
            })
            .collect();

        let (submit_tx, submit_rx) = channel::unbounded();
        let (wait_tx, wait_rx) = channel::unbounded();
        let irqs = Arc::new(IrqCounters::new(cores));
        hardware.attach_irq(IrqLine::new(Arc::clone(&irqs), wait_tx.clone()));

        for unit in &units {
            if let Err(e) = unit.power.send_event(PowerEvent::On) {
                warn!("Core {} failed bring-up: {e}", unit.core);
                for u in &units {
                    let _ = u.power.power_down();
                }
                return Err(e);
            }
        }

        let shared = Arc::new(Shared {
            slots: SlotMap::new(cfg.slot_capacity, cfg.slot_capacity_max, cfg.allow_expand),
            queue: DispatchQueue::new(topo, cfg.queue_depth),
            topo,
            hw,
            epoch: Instant::now(),
            units,
            irqs,
            history: ExecHistory::new(),
            submit_tx,
            wait_tx,
            gate: RwLock::new(()),
            recover: RecoverGuard::default(),
            suspended: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            stats: Stats::default(),
            cfg,
        });

        let threads = daemon::spawn(&shared, submit_rx, wait_rx).map_err(|e| {
            NpuError::invalid_state(format!("cannot start daemons: {e}"))
        })?;

        info!(
            "NPU {} ready: {} ({} cores, job cancel {})",
            shared.cfg.device_index,
            hardware.variant(),
            cores,
            if shared.hw.has_job_cancel() { "yes" } else { "no" }
        );
        Ok(Self {
            shared,
            threads: Mutex::new(threads),
        })
    }

    /// Device configuration
    pub fn config(&self) -> &DeviceConfig {
        &self.shared.cfg
    }

    /// Core topology
    pub fn topology(&self) -> CoreTopology {
        self.shared.topo
    }

    /// Queue `task` for execution
    ///
    /// With `flags.auto_schedule` the scheduler picks the least-loaded window
    /// of `core_cnt` healthy cores and patches the command buffer to match.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a malformed task, `AlreadyExists` if the same
    /// task id and subtask index is still in flight, `OutOfResource` when the
    /// slot map or the lane is full, `InvalidState` if the window contains a
    /// failed core, `ShuttingDown` after shutdown.
    pub fn submit(&self, mut task: Task) -> Result<TaskHandle> {
        let sh = &self.shared;
        if sh.shutting_down.load(Ordering::Acquire) {
            return Err(NpuError::ShuttingDown);
        }
        task.validate(&sh.topo)?;

        let failed = sh.failed_mask();
        if task.flags.auto_schedule {
            let estimates = sh.core_estimates();
            let start = scheduler::select_window(&estimates, usize::from(task.core_cnt), failed)
                .ok_or_else(|| {
                    NpuError::invalid_state(format!(
                        "no healthy window of {} cores",
                        task.core_cnt
                    ))
                })?;
            scheduler::place(&mut task, u8::try_from(start).unwrap_or(0));
        } else if task.shape().mask() & failed != 0 {
            return Err(NpuError::invalid_state(format!(
                "window {} contains a failed core",
                task.shape()
            )));
        }

        let key = task.key();
        let shape = task.shape();
        let priority = task.flags.priority;
        let estimate = sh.history.estimate(task.descriptor, sh.cfg.default_exec_estimate);
        let time_out = task.time_out.unwrap_or(sh.cfg.default_timeout);
        let (slot, tcb) = sh.slots.insert(key, Tcb::new(task, estimate, time_out))?;

        let payload = QueuePayload {
            slot,
            key,
            resource_mask: tcb.resource_mask,
            shape,
            estimate,
            priority,
        };
        if let Err(e) = sh.queue.write(payload) {
            tcb.retire();
            sh.slots.remove_by_index(slot);
            sh.slots.unuse(slot, true);
            return Err(e);
        }

        Stats::bump(&sh.stats.submitted);
        debug!("Submitted task {:#x} as slot {slot} on {shape}", key);
        sh.kick_submit();
        Ok(TaskHandle { key, slot })
    }

    /// Block until the task finishes or `timeout` elapses
    ///
    /// A finished task is retired and its handle becomes stale. If `timeout`
    /// elapses first the task stays in flight and the handle stays valid.
    ///
    /// # Errors
    ///
    /// The task's own failure (`Canceled`, `Recovered`, `Fault`, `Timeout`
    /// for a missed deadline), `WaitTimeout` if the wait itself gave up, or
    /// `InvalidHandle` for a stale handle (including one retired by
    /// `cancel`).
    pub fn wait(&self, handle: TaskHandle, timeout: Duration) -> Result<()> {
        let sh = &self.shared;
        let tcb = sh
            .use_handle(handle)
            .ok_or(NpuError::InvalidHandle { key: handle.key })?;
        match tcb.wait_done(timeout) {
            Some(outcome) => {
                sh.retire(handle.slot, &tcb);
                outcome
            }
            None => {
                sh.slots.unuse(handle.slot, true);
                Err(NpuError::wait_timeout(timeout))
            }
        }
    }

    /// Wait with the configured default timeout plus the software cancel cap
    ///
    /// # Errors
    ///
    /// As [`Device::wait`].
    pub fn wait_default(&self, handle: TaskHandle) -> Result<()> {
        let cfg = &self.shared.cfg;
        self.wait(handle, cfg.default_timeout + cfg.sw_cancel_cap)
    }

    /// Current status of a task, without waiting
    ///
    /// # Errors
    ///
    /// `InvalidHandle` for a stale handle.
    pub fn status(&self, handle: TaskHandle) -> Result<TaskStatus> {
        let sh = &self.shared;
        let tcb = sh
            .use_handle(handle)
            .ok_or(NpuError::InvalidHandle { key: handle.key })?;
        let status = tcb.status();
        sh.slots.unuse(handle.slot, true);
        Ok(status)
    }

    /// Cancel a task
    ///
    /// A queued task is dropped from its lane. A dispatched task that is not
    /// yet running on any of its cores is canceled on the spot; its
    /// wait-link entries drain later and their results are dropped. A running
    /// task is aborted through the job-cancel register when the hardware has
    /// one; otherwise (or if the abort does not land) the call waits for the
    /// task to drain for at most `sw_cancel_cap`, then has its cores
    /// recovered.
    ///
    /// A task canceled here is retired: its slot is freed and the handle
    /// goes stale. Canceling a finished or retired task is a no-op.
    ///
    /// # Errors
    ///
    /// `Fault` if the hardware faulted the task before it could be canceled.
    pub fn cancel(&self, handle: TaskHandle) -> Result<()> {
        let sh = &self.shared;
        let token = sh.recover.enter_cancel();
        let Some(tcb) = sh.use_handle(handle) else {
            return Ok(());
        };

        let mut state = tcb.lock();
        let status = state.status;
        let outcome = match status {
            TaskStatus::Ready => {
                sh.queue.clean(CleanKind::Slot(handle.slot));
                if tcb.finish_locked(&mut state, Err(NpuError::Canceled)) {
                    Stats::bump(&sh.stats.canceled);
                }
                drop(state);
                debug!("Canceled queued task {:#x}", handle.key);
                Some(Err(NpuError::Canceled))
            }
            TaskStatus::InferStart => {
                tcb.request_cancel();
                let running = sh.running_mask(handle.slot, tcb.resource_mask);
                if running == 0 {
                    if tcb.finish_locked(&mut state, Err(NpuError::Canceled)) {
                        Stats::bump(&sh.stats.canceled);
                    }
                    drop(state);
                    debug!("Canceled task {:#x} before it started", handle.key);
                    Some(Err(NpuError::Canceled))
                } else {
                    drop(state);
                    self.cancel_running(&tcb, handle, running, token)
                }
            }
            _ => {
                drop(state);
                None
            }
        };

        match outcome {
            Some(outcome) => {
                sh.retire(handle.slot, &tcb);
                match outcome {
                    Err(e @ NpuError::Fault { .. }) => Err(e),
                    _ => Ok(()),
                }
            }
            None => {
                sh.slots.unuse(handle.slot, true);
                Ok(())
            }
        }
    }

    /// Abort a task that heads the wait-link ring of the cores in `running`
    fn cancel_running(
        &self,
        tcb: &Tcb,
        handle: TaskHandle,
        running: u32,
        token: CancelToken<'_>,
    ) -> Option<Result<()>> {
        let sh = &self.shared;
        if sh.hw.has_job_cancel() {
            for core in tcb.task.shape().cores().filter(|c| running & (1 << c) != 0) {
                if let Err(e) = sh.hw.job_cancel(core) {
                    warn!("Job cancel on core {core} failed: {e}");
                }
            }
        }
        if let Some(outcome) = tcb.wait_done(sh.cfg.sw_cancel_cap) {
            return Some(outcome);
        }
        warn!(
            "Cancel of task {:#x} exceeded {:?}, recovering {}",
            handle.key,
            sh.cfg.sw_cancel_cap,
            tcb.task.shape()
        );
        drop(token);
        sh.request_recovery(tcb.resource_mask, Some(handle.slot));
        tcb.wait_done(sh.cfg.default_timeout + sh.cfg.sw_cancel_cap)
    }

    /// Snapshot of the device state
    pub fn query_database(&self) -> Database {
        let sh = &self.shared;
        let shapes = sh
            .topo
            .shapes()
            .zip(sh.queue.loads())
            .map(|(shape, load)| ShapeInfo {
                shape,
                task_count: load.task_count,
                estimated_time: load.estimated_time,
            })
            .collect();
        let units = sh
            .units
            .iter()
            .map(|u| UnitInfo {
                core: u.core,
                power_state: u.power.state(),
                suspended: u.power.is_suspended(),
                freq_khz: u.power.freq_khz(),
                irq_count: sh.irqs.total(u.core),
                in_flight: u.wait_link.len(),
                wait_link_depth: u.wait_link.depth(),
                failed: u.is_failed(),
            })
            .collect();
        Database {
            variant: sh.hw.inner().variant(),
            core_count: sh.topo.cores(),
            shapes,
            units,
            slots: SlotInfo {
                len: sh.slots.len(),
                capacity: sh.slots.capacity(),
            },
            counters: sh.stats.snapshot(),
            history_len: sh.history.len(),
            suspended: sh.suspended.load(Ordering::Acquire),
        }
    }

    /// Power state of `core`
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `core` does not exist.
    pub fn power_state(&self, core: u8) -> Result<PowerState> {
        Ok(self.shared.unit(core)?.power.state())
    }

    /// Deliver a power event to `core`
    ///
    /// Events that would stop or power down a core with work pending are
    /// refused.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an unknown core, `InvalidState` if the core is
    /// busy, `Io` if the hardware action fails.
    pub fn power_event(&self, core: u8, event: PowerEvent) -> Result<PowerState> {
        let unit = self.shared.unit(core)?;
        let _hold = unit.power.hold();
        let disruptive = matches!(
            event,
            PowerEvent::End
                | PowerEvent::Timeout
                | PowerEvent::Off
                | PowerEvent::ForceOff
                | PowerEvent::Suspend
        );
        if disruptive && !unit.is_idle() {
            return Err(NpuError::invalid_state(format!(
                "core {core} has {} entries in flight",
                unit.wait_link.len()
            )));
        }
        let state = unit.power.send_event(event)?;
        // Timers may have changed.
        self.shared.kick_wait();
        Ok(state)
    }

    /// Stop dispatching, drain in-flight work and suspend every unit
    ///
    /// # Errors
    ///
    /// `WaitTimeout` if in-flight work does not drain within the default task
    /// timeout (dispatch is resumed), `Io` if a unit cannot be suspended.
    pub fn suspend(&self) -> Result<()> {
        let sh = &self.shared;
        if sh.suspended.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.drain(sh.cfg.default_timeout) {
            sh.suspended.store(false, Ordering::Release);
            sh.kick_submit();
            return Err(NpuError::wait_timeout(sh.cfg.default_timeout));
        }
        for unit in &sh.units {
            let _hold = unit.power.hold();
            if unit.power.state() == PowerState::Run {
                unit.power.send_event(PowerEvent::End)?;
            }
            unit.power.send_event(PowerEvent::Suspend)?;
        }
        info!("NPU {} suspended", sh.cfg.device_index);
        Ok(())
    }

    /// Leave the suspend overlay and resume dispatch
    ///
    /// # Errors
    ///
    /// `Io` if a unit cannot be resumed.
    pub fn resume(&self) -> Result<()> {
        let sh = &self.shared;
        for unit in &sh.units {
            unit.power.send_event(PowerEvent::Resume)?;
        }
        if sh.suspended.swap(false, Ordering::AcqRel) {
            info!("NPU {} resumed", sh.cfg.device_index);
        }
        sh.kick_submit();
        sh.kick_wait();
        Ok(())
    }

    /// Stop the daemons, cancel outstanding work and power every unit off
    ///
    /// Idempotent; also run on drop.
    pub fn shutdown(&self) {
        let sh = &self.shared;
        if sh.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("NPU {} shutting down", sh.cfg.device_index);

        for p in sh.queue.clean(CleanKind::All) {
            if let Some(tcb) = sh.slots.use_by_index(p.slot) {
                if tcb.finish(Err(NpuError::Canceled)) {
                    Stats::bump(&sh.stats.canceled);
                }
                sh.slots.unuse(p.slot, true);
            }
        }

        if !sh.suspended.load(Ordering::Acquire) && !self.drain(sh.cfg.sw_cancel_cap) {
            warn!("In-flight work did not drain, canceling it");
        }

        let _ = sh.submit_tx.send(SubmitMsg::Shutdown);
        let _ = sh.wait_tx.send(WaitMsg::Shutdown);
        for thread in self.threads.lock().drain(..) {
            let _ = thread.join();
        }

        for unit in &sh.units {
            for rec in unit.wait_link.reset() {
                if let Some(tcb) = sh.slots.use_by_index(rec.tag) {
                    if tcb.finish(Err(NpuError::Canceled)) {
                        Stats::bump(&sh.stats.canceled);
                    }
                    sh.slots.unuse(rec.tag, true);
                }
            }
            if let Err(e) = unit.power.power_down() {
                warn!("Core {} power-down failed: {e}", unit.core);
            }
        }
        debug!("NPU {} stopped", sh.cfg.device_index);
    }

    /// Wait until no wait-link entry is occupied
    fn drain(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if self.shared.units.iter().all(HardwareUnit::is_idle) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(DRAIN_POLL);
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shutdown();
    }
}
