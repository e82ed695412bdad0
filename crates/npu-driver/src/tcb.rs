// SPDX-License-Identifier: AGPL-3.0-only

//! Task control blocks
//!
//! ```text
//!            submit                dispatch                primary IRQ
//!   (none) ─────────▶ READY ──────────────▶ INFER_START ──────────────▶ INFER_END
//!                       │                        │                          │
//!                       │ cancel (local)         │ cancel / recovery        │ wait
//!                       ▼                        ▼                          ▼
//!                    CANCELED ◀──────────────────┘                        EMPTY
//! ```
//!
//! Every transition happens under the TCB's state mutex, which doubles as the
//! cancel mutex: a cancel request and a dispatch or retirement of the same
//! TCB never interleave.

use crate::error::{NpuError, Result};
use crate::task::Task;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// TCB lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Queued, not yet on hardware
    Ready,
    /// Occupies a wait-link slot on every assigned core
    InferStart,
    /// Primary core reported completion
    InferEnd,
    /// Canceled by the caller or by recovery
    Canceled,
    /// Retired; the slot is being released
    Empty,
}

impl TaskStatus {
    /// No further transition except retirement
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::InferEnd | Self::Canceled | Self::Empty)
    }
}

/// Final result of a task
pub type TaskOutcome = Result<()>;

/// Signal that is released exactly once and can be awaited with a timeout
#[derive(Debug)]
pub struct ReleaseOnce<T> {
    value: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T: Clone> Default for ReleaseOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> ReleaseOnce<T> {
    /// Unreleased signal
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Release with `value`; later releases are ignored. Returns whether this
    /// call released the signal.
    pub fn release(&self, value: T) -> bool {
        let mut slot = self.value.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.cond.notify_all();
        true
    }

    /// Released value, if any
    pub fn get(&self) -> Option<T> {
        self.value.lock().clone()
    }

    /// Block until released or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.value.lock();
        while slot.is_none() {
            if self.cond.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.clone()
    }
}

/// Mutable part of a TCB, guarded by the cancel mutex
#[derive(Debug)]
pub struct TcbState {
    /// Lifecycle state
    pub status: TaskStatus,
    /// When the task was written to the wait-link tables
    pub dispatched_at: Option<Instant>,
}

/// One in-flight submission
#[derive(Debug)]
pub struct Tcb {
    /// The submission (window already final)
    pub task: Task,
    /// Cores the task needs
    pub resource_mask: u32,
    /// Expected execution time, from history
    pub estimate: Duration,
    /// Deadline measured from dispatch
    pub time_out: Duration,
    /// When the task was submitted
    pub submitted_at: Instant,
    state: Mutex<TcbState>,
    done: ReleaseOnce<TaskOutcome>,
    hw_ready_mask: AtomicU32,
    cancel_requested: AtomicBool,
    retired: AtomicBool,
}

impl Tcb {
    /// Fresh READY block for `task`
    pub fn new(task: Task, estimate: Duration, time_out: Duration) -> Self {
        Self {
            resource_mask: task.shape().mask(),
            task,
            estimate,
            time_out,
            submitted_at: Instant::now(),
            state: Mutex::new(TcbState {
                status: TaskStatus::Ready,
                dispatched_at: None,
            }),
            done: ReleaseOnce::new(),
            hw_ready_mask: AtomicU32::new(0),
            cancel_requested: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        }
    }

    /// Take the cancel mutex
    pub fn lock(&self) -> MutexGuard<'_, TcbState> {
        self.state.lock()
    }

    /// Current status
    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    /// Record that `core` holds its wait-link entry; true once every core does
    pub fn core_ready(&self, core: u8) -> bool {
        let mask = self.hw_ready_mask.fetch_or(1 << core, Ordering::AcqRel) | (1 << core);
        mask == self.resource_mask
    }

    /// Cores that hold a wait-link entry for this task
    pub fn hw_ready_mask(&self) -> u32 {
        self.hw_ready_mask.load(Ordering::Acquire)
    }

    /// Ask for the task's result to be reported as canceled
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    /// Whether a cancel was requested while on hardware
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Finish the task with `outcome` while already holding the cancel mutex
    ///
    /// Returns false if the task had already finished.
    pub fn finish_locked(&self, state: &mut TcbState, outcome: TaskOutcome) -> bool {
        if state.status.is_finished() {
            return false;
        }
        state.status = if outcome.is_ok() {
            TaskStatus::InferEnd
        } else {
            TaskStatus::Canceled
        };
        self.done.release(outcome)
    }

    /// Finish the task with `outcome`
    pub fn finish(&self, outcome: TaskOutcome) -> bool {
        let mut state = self.state.lock();
        self.finish_locked(&mut state, outcome)
    }

    /// Outcome, if the task has finished
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.done.get()
    }

    /// Block until finished or `timeout` elapses
    pub fn wait_done(&self, timeout: Duration) -> Option<TaskOutcome> {
        self.done.wait_timeout(timeout)
    }

    /// Move to EMPTY. Returns true for the first caller only.
    pub fn retire(&self) -> bool {
        let first = !self.retired.swap(true, Ordering::AcqRel);
        if first {
            let mut state = self.state.lock();
            if !state.status.is_finished() {
                state.status = TaskStatus::Canceled;
                self.done.release(Err(NpuError::Canceled));
            }
            state.status = TaskStatus::Empty;
        }
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use npu_chip::command::CommandBuffer;
    use std::sync::Arc;

    fn tcb(cores: u8, cnt: u8) -> Tcb {
        let task = Task::new(1, CommandBuffer::for_window(0, cores, cnt, &[16])).with_cores(cores, cnt);
        Tcb::new(task, Duration::from_millis(1), Duration::from_secs(1))
    }

    #[test]
    fn ready_mask_completes_on_last_core() {
        let t = tcb(1, 3);
        assert_eq!(t.resource_mask, 0b1110);
        assert!(!t.core_ready(1));
        assert!(!t.core_ready(3));
        assert!(t.core_ready(2));
    }

    #[test]
    fn finish_once() {
        let t = tcb(0, 1);
        assert!(t.finish(Ok(())));
        assert!(!t.finish(Err(NpuError::Canceled)));
        assert_eq!(t.status(), TaskStatus::InferEnd);
        assert_eq!(t.outcome(), Some(Ok(())));
    }

    #[test]
    fn failed_outcome_marks_canceled() {
        let t = tcb(0, 1);
        t.finish(Err(NpuError::Recovered));
        assert_eq!(t.status(), TaskStatus::Canceled);
    }

    #[test]
    fn waiter_wakes_on_release() {
        let t = Arc::new(tcb(0, 1));
        let t2 = Arc::clone(&t);
        let waiter = std::thread::spawn(move || t2.wait_done(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        t.finish(Ok(()));
        assert_eq!(waiter.join().unwrap(), Some(Ok(())));
    }

    #[test]
    fn wait_times_out() {
        let t = tcb(0, 1);
        assert_eq!(t.wait_done(Duration::from_millis(10)), None);
    }

    #[test]
    fn retire_is_first_caller_only() {
        let t = tcb(0, 1);
        t.finish(Ok(()));
        assert!(t.retire());
        assert!(!t.retire());
        assert_eq!(t.status(), TaskStatus::Empty);
    }
}
