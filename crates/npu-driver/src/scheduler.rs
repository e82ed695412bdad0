// SPDX-License-Identifier: AGPL-3.0-only

//! Core-window selection
//!
//! A task that needs `k` contiguous cores can run on any of `C - k + 1`
//! windows. The scheduler builds a per-core estimate of outstanding work
//! (queued load on every lane covering the core plus what is left on the
//! core's wait-link ring) and picks the window whose busiest core is least
//! busy:
//!
//! ```text
//!   estimate   5   0   0   5
//!   k = 2     [5   0]              max 5
//!                 [0   0]          max 0   ← chosen
//!                     [0   5]      max 5
//! ```
//!
//! The per-window maximum comes from a monotonic deque, so selection is
//! linear in the core count. Ties go to the lowest start core.

use crate::task::Task;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

/// Samples after which the running average stops weighting by count
const HISTORY_WINDOW: u32 = 16;

#[derive(Debug, Clone, Copy)]
struct Average {
    mean: Duration,
    samples: u32,
}

/// Measured execution time per command-buffer descriptor
#[derive(Debug, Default)]
pub struct ExecHistory {
    by_descriptor: Mutex<HashMap<u64, Average>>,
}

impl ExecHistory {
    /// Empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one measured run into the descriptor's average
    pub fn record(&self, descriptor: u64, elapsed: Duration) {
        let mut map = self.by_descriptor.lock();
        let avg = map.entry(descriptor).or_insert(Average {
            mean: elapsed,
            samples: 0,
        });
        avg.samples = (avg.samples + 1).min(HISTORY_WINDOW);
        let n = avg.samples;
        // mean += (x - mean) / n, without going negative
        avg.mean = if elapsed >= avg.mean {
            avg.mean + (elapsed - avg.mean) / n
        } else {
            avg.mean - (avg.mean - elapsed) / n
        };
    }

    /// Average for `descriptor`, or `fallback` with no history
    pub fn estimate(&self, descriptor: u64, fallback: Duration) -> Duration {
        self.by_descriptor
            .lock()
            .get(&descriptor)
            .map_or(fallback, |a| a.mean)
    }

    /// Descriptors with at least one sample
    pub fn len(&self) -> usize {
        self.by_descriptor.lock().len()
    }

    /// True if nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Start core of the best window of `width` cores
///
/// Windows containing a core set in `excluded` are skipped. Returns `None`
/// if `width` is zero, wider than `estimates`, or every window is excluded.
pub fn select_window<T: Ord + Copy>(estimates: &[T], width: usize, excluded: u32) -> Option<usize> {
    if width == 0 || width > estimates.len() {
        return None;
    }

    let mut window: VecDeque<usize> = VecDeque::with_capacity(width);
    let mut last_excluded: Option<usize> = None;
    let mut best: Option<(T, usize)> = None;

    for (i, &cost) in estimates.iter().enumerate() {
        if i < 32 && excluded & (1 << i) != 0 {
            last_excluded = Some(i);
        }
        // Drop trailing cores dominated by the newcomer.
        while window.back().is_some_and(|&j| estimates[j] <= cost) {
            window.pop_back();
        }
        window.push_back(i);

        if i + 1 < width {
            continue;
        }
        let start = i + 1 - width;
        // Drop the core that slid out of the window.
        while window.front().is_some_and(|&j| j < start) {
            window.pop_front();
        }
        if last_excluded.is_some_and(|x| x >= start) {
            continue;
        }
        let Some(&front) = window.front() else {
            continue;
        };
        let max = estimates[front];
        if best.map_or(true, |(b, _)| max < b) {
            best = Some((max, start));
        }
    }

    best.map(|(_, start)| start)
}

/// Per-core outstanding work: queued lane load plus wait-link remainder
pub fn core_estimates(queued: &[Duration], in_flight: &[Duration]) -> Vec<Duration> {
    queued
        .iter()
        .zip(in_flight)
        .map(|(q, r)| *q + *r)
        .collect()
}

/// Move `task` to the window starting at `start`, patching its command buffer
///
/// Returns whether the task moved.
pub fn place(task: &mut Task, start: u8) -> bool {
    let from = task.core_index;
    if !task.commands.retarget(from, start) {
        return false;
    }
    task.core_index = start;
    debug!(
        "Task {}.{} moved from core {from} to core {start}",
        task.task_id, task.subtask_index
    );
    true
}
