// SPDX-License-Identifier: AGPL-3.0-only

//! Device introspection
//!
//! [`Database`] is a point-in-time snapshot returned by
//! `Device::query_database`: topology, per-lane queue load, per-unit power
//! and interrupt state, slot-map occupancy and lifetime counters. Nothing in
//! it is live; query again to refresh.

use crate::power::PowerState;
use npu_chip::topology::Shape;
use npu_chip::variant::ChipVariant;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Queue load on one lane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapeInfo {
    /// Core window served by the lane
    pub shape: Shape,
    /// Entries waiting
    pub task_count: usize,
    /// Sum of their estimated execution times
    pub estimated_time: Duration,
}

/// State of one hardware unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitInfo {
    /// Core index
    pub core: u8,
    /// Power state
    pub power_state: PowerState,
    /// Inside the suspend overlay
    pub suspended: bool,
    /// Requested clock rate (kHz)
    pub freq_khz: u32,
    /// Interrupts received since init
    pub irq_count: u64,
    /// Occupied wait-link entries
    pub in_flight: usize,
    /// Wait-link depth
    pub wait_link_depth: usize,
    /// Permanently failed after recovery
    pub failed: bool,
}

/// Slot-map occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    /// Live TCBs
    pub len: usize,
    /// Current capacity
    pub capacity: usize,
}

/// Lifetime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Accepted submissions
    pub submitted: u64,
    /// Tasks that finished successfully
    pub completed: u64,
    /// Tasks canceled by a caller or by shutdown
    pub canceled: u64,
    /// Tasks lost to recovery
    pub recovered: u64,
    /// Tasks the hardware faulted
    pub faulted: u64,
    /// Tasks that missed their deadline
    pub timed_out: u64,
    /// Recovery passes run
    pub recoveries: u64,
}

/// Snapshot returned by `Device::query_database`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Database {
    /// Chip variant
    pub variant: ChipVariant,
    /// Number of cores
    pub core_count: u8,
    /// One entry per lane, in lane order
    pub shapes: Vec<ShapeInfo>,
    /// One entry per core
    pub units: Vec<UnitInfo>,
    /// Slot-map occupancy
    pub slots: SlotInfo,
    /// Lifetime counters
    pub counters: Counters,
    /// Descriptors with execution history
    pub history_len: usize,
    /// Dispatch is paused by a system suspend
    pub suspended: bool,
}

impl Database {
    /// Total entries waiting across every lane
    pub fn queued(&self) -> usize {
        self.shapes.iter().map(|s| s.task_count).sum()
    }

    /// Total wait-link entries occupied across every unit
    pub fn in_flight(&self) -> usize {
        self.units.iter().map(|u| u.in_flight).sum()
    }

    /// Bitmask of failed cores
    pub fn failed_mask(&self) -> u32 {
        self.units
            .iter()
            .filter(|u| u.failed)
            .fold(0, |m, u| m | (1 << u.core))
    }
}

/// Live counters behind [`Counters`]
#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub canceled: AtomicU64,
    pub recovered: AtomicU64,
    pub faulted: AtomicU64,
    pub timed_out: AtomicU64,
    pub recoveries: AtomicU64,
}

impl Stats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Counters {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Counters {
            submitted: get(&self.submitted),
            completed: get(&self.completed),
            canceled: get(&self.canceled),
            recovered: get(&self.recovered),
            faulted: get(&self.faulted),
            timed_out: get(&self.timed_out),
            recoveries: get(&self.recoveries),
        }
    }
}
