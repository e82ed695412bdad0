// SPDX-License-Identifier: AGPL-3.0-only

//! Recovery and the cancel/recover interlock
//!
//! Recovery runs on the wait daemon after a deadline expiry, a hardware
//! fault or a software cancel that ran past its cap. With dispatch fenced
//! off it:
//!
//! 1. collects every TCB with a pending wait-link entry on an implicated
//!    core (their order on that core is gone),
//! 2. cancels (job-cancel hardware) or power-cycles (everything else)
//!    exactly the implicated cores and brings them back to READY,
//! 3. retires every victim with `Timeout`, `Fault`, `Canceled` or
//!    `Recovered` depending on why it was caught up.
//!
//! Cores outside the mask are never touched. A multi-core victim may leave
//! entries on them; those drain as leftovers and their results are dropped.
//!
//! A core that cannot be brought back is marked failed; queued work that
//! needs it is failed with `InvalidState` and the scheduler stops choosing
//! windows that contain it.
//!
//! Cancels and recovery exclude each other through [`RecoverGuard`]: a cancel
//! waits for a running recovery to finish, and recovery is deferred while any
//! cancel is in progress.

use crate::database::Stats;
use crate::device::Shared;
use crate::dispatch_queue::CleanKind;
use crate::error::NpuError;
use crate::slot_map::SlotId;
use crate::tcb::Tcb;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct GuardState {
    disable: u32,
    recovering: bool,
}

/// `disable_recover` counter plus the in-progress flag
#[derive(Debug, Default)]
pub(crate) struct RecoverGuard {
    state: Mutex<GuardState>,
    cond: Condvar,
}

/// Held for the duration of one cancel
#[derive(Debug)]
pub(crate) struct CancelToken<'a>(&'a RecoverGuard);

/// Held for the duration of one recovery pass
#[derive(Debug)]
pub(crate) struct RecoveryToken<'a>(&'a RecoverGuard);

impl RecoverGuard {
    /// Wait out any running recovery, then block new ones
    pub(crate) fn enter_cancel(&self) -> CancelToken<'_> {
        let mut st = self.state.lock();
        while st.recovering {
            self.cond.wait(&mut st);
        }
        st.disable += 1;
        CancelToken(self)
    }

    /// Start a recovery pass unless a cancel is in progress
    pub(crate) fn try_begin(&self) -> Option<RecoveryToken<'_>> {
        let mut st = self.state.lock();
        if st.disable > 0 || st.recovering {
            return None;
        }
        st.recovering = true;
        Some(RecoveryToken(self))
    }
}

impl Drop for CancelToken<'_> {
    fn drop(&mut self) {
        let mut st = self.0.state.lock();
        st.disable -= 1;
        self.0.cond.notify_all();
    }
}

impl Drop for RecoveryToken<'_> {
    fn drop(&mut self) {
        let mut st = self.0.state.lock();
        st.recovering = false;
        self.0.cond.notify_all();
    }
}

/// What a recovery pass has to do
#[derive(Debug, Default)]
pub(crate) struct RecoveryPlan {
    /// Cores known to be implicated
    pub mask: u32,
    /// Outcome for TCBs that caused the recovery
    pub blamed: HashMap<SlotId, NpuError>,
}

impl RecoveryPlan {
    pub(crate) fn implicate(&mut self, mask: u32) {
        self.mask |= mask;
    }

    /// Record why `slot` is being recovered; the first reason sticks
    pub(crate) fn blame(&mut self, slot: SlotId, reason: NpuError) {
        self.blamed.entry(slot).or_insert(reason);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.mask == 0
    }

    pub(crate) fn merge(&mut self, other: Self) {
        self.mask |= other.mask;
        for (slot, reason) in other.blamed {
            self.blame(slot, reason);
        }
    }
}

/// Outcome for a TCB caught in recovery
fn victim_outcome(plan: &RecoveryPlan, slot: SlotId, tcb: &Tcb) -> NpuError {
    if let Some(reason) = plan.blamed.get(&slot) {
        return reason.clone();
    }
    if tcb.cancel_requested() {
        NpuError::Canceled
    } else {
        NpuError::Recovered
    }
}

impl Shared {
    /// Run one recovery pass; the caller holds the recovery token
    pub(crate) fn recover(&self, plan: RecoveryPlan, _token: &RecoveryToken<'_>) {
        let _fence = self.gate.write();
        let mask = plan.mask & self.topo.full_mask();
        warn!("Recovering cores {mask:#b}");

        // Every TCB with an entry on a recovered core, once.
        let mut victims: HashMap<SlotId, Arc<Tcb>> = HashMap::new();
        for unit in self.units.iter().filter(|u| mask & (1 << u.core) != 0) {
            for rec in unit.wait_link.pending() {
                if victims.contains_key(&rec.tag) {
                    continue;
                }
                if let Some(tcb) = self.slots.use_by_index(rec.tag) {
                    victims.insert(rec.tag, tcb);
                }
            }
        }

        let full_cycle = !self.hw.has_job_cancel();
        let mut failed = 0u32;
        for unit in self.units.iter().filter(|u| mask & (1 << u.core) != 0) {
            if !full_cycle {
                if let Err(e) = self.hw.job_cancel(unit.core) {
                    warn!("Job cancel on core {} failed: {e}", unit.core);
                }
            }
            if let Err(e) = unit.power.reinit(full_cycle) {
                error!("Core {} failed to recover and is now offline: {e}", unit.core);
                unit.mark_failed();
                failed |= 1 << unit.core;
            }
            let dropped = unit.wait_link.reset();
            self.irqs.clear(unit.core);
            debug!("Core {}: dropped {} wait-link entries", unit.core, dropped.len());
        }

        let mut retired = 0usize;
        for (slot, tcb) in victims {
            let outcome = victim_outcome(&plan, slot, &tcb);
            if tcb.finish(Err(outcome.clone())) {
                self.count_failure(&outcome);
                retired += 1;
            }
            let elsewhere = tcb.resource_mask & !mask;
            if elsewhere != 0 {
                debug!("Slot {slot}: entries on cores {elsewhere:#b} left to drain");
            }
            self.slots.unuse(slot, true);
        }

        if failed != 0 {
            self.fail_queued(failed);
        }
        Stats::bump(&self.stats.recoveries);
        info!("Recovery of cores {mask:#b} done: {retired} tasks retired");
    }

    /// Fail everything queued for a window containing a core in `failed`
    pub(crate) fn fail_queued(&self, failed: u32) {
        for p in self.queue.clean(CleanKind::Intersecting(failed)) {
            if let Some(tcb) = self.slots.use_by_index(p.slot) {
                let reason = NpuError::invalid_state(format!("core mask {failed:#b} is offline"));
                if tcb.finish(Err(reason)) {
                    Stats::bump(&self.stats.canceled);
                }
                self.slots.unuse(p.slot, true);
            }
        }
    }

    /// Bump the counter matching a failed outcome
    pub(crate) fn count_failure(&self, outcome: &NpuError) {
        let counter = match outcome {
            NpuError::Timeout { .. } => &self.stats.timed_out,
            NpuError::Fault { .. } => &self.stats.faulted,
            NpuError::Recovered => &self.stats.recovered,
            _ => &self.stats.canceled,
        };
        Stats::bump(counter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cancel_blocks_recovery() {
        let guard = RecoverGuard::default();
        let cancel = guard.enter_cancel();
        assert!(guard.try_begin().is_none());
        drop(cancel);
        let token = guard.try_begin().unwrap();
        assert!(guard.try_begin().is_none());
        drop(token);
        assert!(guard.try_begin().is_some());
    }

    #[test]
    fn cancel_waits_for_recovery() {
        let guard = Arc::new(RecoverGuard::default());
        let token_guard = Arc::clone(&guard);
        let (tx, rx) = crossbeam::channel::bounded(0);
        let recovering = std::thread::spawn(move || {
            let token = token_guard.try_begin().unwrap();
            tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(20));
            drop(token);
        });
        rx.recv().unwrap();
        let started = std::time::Instant::now();
        let _cancel = guard.enter_cancel();
        assert!(started.elapsed() >= Duration::from_millis(10));
        recovering.join().unwrap();
    }

    #[test]
    fn first_blame_sticks() {
        let mut plan = RecoveryPlan::default();
        let slot = SlotId::from_bits(3);
        plan.blame(slot, NpuError::timeout(Duration::from_millis(5)));
        plan.blame(slot, NpuError::Recovered);
        let mut other = RecoveryPlan::default();
        other.implicate(0b100);
        other.blame(SlotId::from_bits(4), NpuError::Canceled);
        plan.merge(other);
        assert_eq!(plan.mask, 0b100);
        assert!(matches!(plan.blamed[&slot], NpuError::Timeout { .. }));
        assert_eq!(plan.blamed.len(), 2);
    }
}
