// SPDX-License-Identifier: AGPL-3.0-only

//! Submit and wait daemons
//!
//! Two named threads per device, driven by channels:
//!
//! ```text
//!  submit() ──Kick──▶ submit daemon ──trigger──▶ hardware
//!                          ▲                         │ irq
//!                          └────────Kick──────── wait daemon ◀──Irq
//! ```
//!
//! The submit daemon drains every lane whose cores have free wait-link
//! entries. The wait daemon sleeps until an interrupt, a message or the
//! soonest deadline (task timeout, power timer), retires completed entries,
//! detects expired tasks and faults, runs recovery and keeps the power state
//! machine ticking.

use crate::database::Stats;
use crate::device::Shared;
use crate::dispatch_queue::QueuePayload;
use crate::error::{NpuError, Result};
use crate::power::{PowerEvent, PowerState};
use crate::recovery::RecoveryPlan;
use crate::slot_map::SlotId;
use crate::tcb::{TaskStatus, Tcb};
use crate::unit::LinkRecord;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use npu_chip::regs::{self, irq, status};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Retry interval for a recovery deferred by an in-progress cancel
const RECOVERY_RETRY: Duration = Duration::from_millis(1);

/// Messages to the submit daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubmitMsg {
    /// New work queued or wait-link capacity freed
    Kick,
    /// Exit
    Shutdown,
}

/// Messages to the wait daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WaitMsg {
    /// Interrupt on a core
    Irq(u8),
    /// Re-evaluate deadlines and timers
    Kick,
    /// Recover these cores; `cancel` is a TCB whose software cancel ran out
    Recover {
        /// Implicated cores
        mask: u32,
        /// TCB whose cancel asked for the recovery
        cancel: Option<SlotId>,
    },
    /// Exit
    Shutdown,
}

pub(crate) fn submit_loop(shared: &Shared, rx: &Receiver<SubmitMsg>) {
    debug!("Submit daemon started");
    while let Ok(msg) = rx.recv() {
        if msg == SubmitMsg::Shutdown || rx.try_iter().any(|m| m == SubmitMsg::Shutdown) {
            break;
        }
        shared.dispatch_ready();
    }
    debug!("Submit daemon stopped");
}

pub(crate) fn wait_loop(shared: &Shared, rx: &Receiver<WaitMsg>) {
    debug!("Wait daemon started");
    let mut plan = RecoveryPlan::default();
    loop {
        let first = match shared.next_wake(!plan.is_empty()) {
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(msg) => Some(msg),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(msg) => Some(msg),
                Err(_) => break,
            },
        };

        let mut shutdown = false;
        for msg in first.into_iter().chain(rx.try_iter()) {
            match msg {
                WaitMsg::Shutdown => shutdown = true,
                WaitMsg::Recover { mask, cancel } => {
                    plan.implicate(mask);
                    if let Some(slot) = cancel {
                        plan.blame(slot, NpuError::Recovered);
                    }
                }
                WaitMsg::Irq(_) | WaitMsg::Kick => {}
            }
        }
        if shutdown {
            break;
        }

        plan.merge(shared.process_completions());
        plan.merge(shared.expired());

        if !plan.is_empty() {
            if let Some(token) = shared.recover.try_begin() {
                shared.recover(std::mem::take(&mut plan), &token);
            } else {
                trace!("Recovery deferred by cancel in progress");
            }
        }

        shared.tick_power(Instant::now());
        shared.kick_submit();
    }
    debug!("Wait daemon stopped");
}

impl Shared {
    /// Dispatch until no satisfiable lane has work
    pub(crate) fn dispatch_ready(&self) {
        loop {
            if self.suspended.load(Ordering::Acquire) || self.shutting_down.load(Ordering::Acquire)
            {
                return;
            }
            let _gate = self.gate.read();
            let shapes = self.satisfiable_shapes();
            if shapes == 0 {
                return;
            }
            let Some(payload) = self.queue.read(shapes) else {
                return;
            };
            self.dispatch(&payload);
        }
    }

    fn dispatch(&self, p: &QueuePayload) {
        let Some(tcb) = self.slots.use_by_index(p.slot) else {
            trace!("Slot {} gone before dispatch", p.slot);
            return;
        };

        let mut state = tcb.lock();
        if state.status != TaskStatus::Ready {
            trace!("Slot {} no longer ready ({:?})", p.slot, state.status);
            drop(state);
            self.slots.unuse(p.slot, true);
            return;
        }

        // Held until every entry is written so the wait daemon cannot stop
        // a loop between `run` and the push.
        let _holds: Vec<_> = p
            .shape
            .cores()
            .map(|c| self.units[usize::from(c)].power.hold())
            .collect();
        let mut written = 0u32;
        let result: Result<()> = (|| {
            for core in p.shape.cores() {
                let power = &self.units[usize::from(core)].power;
                power.send_event(PowerEvent::On)?;
                power.send_event(PowerEvent::Run)?;
            }
            let addr = tcb
                .task
                .trigger_addr()
                .ok_or_else(|| NpuError::invalid_argument("no trigger address"))?;
            let now = self.now();
            let rec = LinkRecord {
                tag: p.slot,
                addr,
                dispatched: now,
                deadline: now + tcb.time_out,
                estimate: tcb.estimate,
            };
            state.status = TaskStatus::InferStart;
            state.dispatched_at = Some(Instant::now());
            for core in p.shape.cores() {
                let unit = &self.units[usize::from(core)];
                if !unit.wait_link.push(&rec) {
                    return Err(NpuError::out_of_resource("wait-link table"));
                }
                written |= 1 << core;
                self.hw.trigger(core, addr)?;
                tcb.core_ready(core);
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                debug!(
                    "Dispatched task {}.{} (slot {}) on {}",
                    tcb.task.task_id, tcb.task.subtask_index, p.slot, p.shape
                );
                // New deadline to watch.
                self.kick_wait();
            }
            Err(e) => {
                error!("Dispatch of slot {} on {} failed: {e}", p.slot, p.shape);
                if tcb.finish_locked(&mut state, Err(e.clone())) {
                    self.count_failure(&e);
                }
                if written != 0 {
                    self.request_recovery(written, None);
                }
            }
        }
        drop(state);
        self.slots.unuse(p.slot, true);
    }

    /// Retire every entry a core has signalled
    pub(crate) fn process_completions(&self) -> RecoveryPlan {
        let mut plan = RecoveryPlan::default();
        for unit in &self.units {
            let core = unit.core;
            while unit.wait_link.head().is_some() && self.irqs.take(core) {
                let bits = match self.ack(core) {
                    Ok(bits) => bits,
                    Err(e) => {
                        error!("Core {core}: cannot read completion status: {e}");
                        plan.implicate(1 << core);
                        break;
                    }
                };
                let Some(rec) = unit.wait_link.pop() else {
                    break;
                };
                let started = unit.mark_retired(self.now()).max(rec.dispatched);
                self.retire_entry(core, &rec, bits, started, &mut plan);
            }
            let _hold = unit.power.hold();
            if unit.is_idle() && unit.power.state() == PowerState::Run {
                if let Err(e) = unit.power.send_event(PowerEvent::End) {
                    warn!("Core {core}: stopping wait-link loop failed: {e}");
                }
            }
        }
        plan
    }

    /// Read and acknowledge the completion status of `core`
    fn ack(&self, core: u8) -> Result<u32> {
        let bits = self.hw.read(core, regs::STATUS)?;
        self.hw.write(core, regs::IRQ_CLEAR, irq::ALL)?;
        Ok(bits)
    }

    fn retire_entry(
        &self,
        core: u8,
        rec: &LinkRecord,
        bits: u32,
        started: Duration,
        plan: &mut RecoveryPlan,
    ) {
        let fault = bits & status::FAULT_MASK;
        let Some(tcb) = self.slots.use_by_index(rec.tag) else {
            trace!("Core {core}: entry for retired slot {}", rec.tag);
            if fault != 0 {
                plan.implicate(1 << core);
            }
            return;
        };
        if tcb.status().is_finished() {
            // Left behind by a cancel or by recovery of a peer core.
            trace!("Core {core}: entry for finished slot {} dropped", rec.tag);
            if fault != 0 {
                plan.implicate(1 << core);
            }
            self.slots.unuse(rec.tag, true);
            return;
        }

        if tcb.task.primary_core() == core {
            let outcome = if fault != 0 {
                plan.implicate(tcb.resource_mask);
                Err(NpuError::Fault { core, status: bits })
            } else if bits & status::CANCELED != 0 || tcb.cancel_requested() {
                Err(NpuError::Canceled)
            } else {
                self.history
                    .record(tcb.task.descriptor, self.now().saturating_sub(started));
                Ok(())
            };
            self.finish_from_hardware(core, rec.tag, &tcb, outcome);
        } else if fault != 0 {
            plan.implicate(tcb.resource_mask);
            plan.blame(rec.tag, NpuError::Fault { core, status: bits });
        } else if bits & status::CANCELED != 0 && tcb.cancel_requested() {
            self.finish_from_hardware(core, rec.tag, &tcb, Err(NpuError::Canceled));
        }
        self.slots.unuse(rec.tag, true);
    }

    fn finish_from_hardware(&self, core: u8, slot: SlotId, tcb: &Tcb, outcome: Result<()>) {
        let counted = outcome.clone();
        if tcb.finish(outcome) {
            match &counted {
                Ok(()) => Stats::bump(&self.stats.completed),
                Err(e) => self.count_failure(e),
            }
            debug!(
                "Task {}.{} (slot {slot}) finished on core {core}: {:?}",
                tcb.task.task_id,
                tcb.task.subtask_index,
                tcb.status()
            );
        }
    }

    /// Plan recovery for every pending entry past its deadline
    ///
    /// An entry whose TCB already finished implicates only its own core.
    pub(crate) fn expired(&self) -> RecoveryPlan {
        let mut plan = RecoveryPlan::default();
        let now = self.now();
        for unit in &self.units {
            for rec in unit.wait_link.pending() {
                if rec.deadline > now {
                    continue;
                }
                let Some(tcb) = self.slots.use_by_index(rec.tag) else {
                    plan.implicate(1 << unit.core);
                    continue;
                };
                if tcb.status().is_finished() {
                    warn!("Core {}: leftover entry for slot {} is stuck", unit.core, rec.tag);
                    plan.implicate(1 << unit.core);
                } else {
                    warn!(
                        "Task {}.{} (slot {}) timed out on core {}",
                        tcb.task.task_id, tcb.task.subtask_index, rec.tag, unit.core
                    );
                    plan.implicate(tcb.resource_mask);
                    plan.blame(rec.tag, NpuError::timeout(tcb.time_out));
                }
                self.slots.unuse(rec.tag, true);
            }
        }
        plan
    }

    /// Fire due power timers
    pub(crate) fn tick_power(&self, now: Instant) {
        for unit in &self.units {
            let _hold = unit.power.hold();
            if !unit.is_idle() {
                continue;
            }
            match unit.power.poll_timer(now) {
                Ok(Some(event)) => trace!("Core {}: power timer fired ({event:?})", unit.core),
                Ok(None) => {}
                Err(e) => warn!("Core {}: power timer action failed: {e}", unit.core),
            }
        }
    }

    /// How long the wait daemon may sleep
    pub(crate) fn next_wake(&self, recovery_pending: bool) -> Option<Duration> {
        if recovery_pending {
            return Some(RECOVERY_RETRY);
        }
        let now_instant = Instant::now();
        let now = self.now();
        let deadlines = self
            .units
            .iter()
            .filter_map(|u| u.next_deadline())
            .map(|d| d.saturating_sub(now));
        let timers = self
            .units
            .iter()
            .filter_map(|u| u.power.next_deadline())
            .map(|at| at.saturating_duration_since(now_instant));
        deadlines.chain(timers).min()
    }

    /// Ask the wait daemon for a recovery pass
    pub(crate) fn request_recovery(&self, mask: u32, cancel: Option<SlotId>) {
        let _ = self.wait_tx.send(WaitMsg::Recover { mask, cancel });
    }

    pub(crate) fn kick_submit(&self) {
        let _ = self.submit_tx.send(SubmitMsg::Kick);
    }

    /// Make the wait daemon recompute its deadlines
    pub(crate) fn kick_wait(&self) {
        let _ = self.wait_tx.send(WaitMsg::Kick);
    }
}

/// Spawn both daemons for `shared`
pub(crate) fn spawn(
    shared: &Arc<Shared>,
    submit_rx: Receiver<SubmitMsg>,
    wait_rx: Receiver<WaitMsg>,
) -> std::io::Result<Vec<std::thread::JoinHandle<()>>> {
    let dev = shared.cfg.device_index;
    let s = Arc::clone(shared);
    let submit = std::thread::Builder::new()
        .name(format!("npu{dev}-submit"))
        .spawn(move || submit_loop(&s, &submit_rx))?;
    let w = Arc::clone(shared);
    let wait = std::thread::Builder::new()
        .name(format!("npu{dev}-wait"))
        .spawn(move || wait_loop(&w, &wait_rx))?;
    Ok(vec![submit, wait])
}
