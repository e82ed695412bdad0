// SPDX-License-Identifier: AGPL-3.0-only

//! Hardware units and their wait-link tables
//!
//! Each core owns a fixed-depth ring of wait-link entries. The submit daemon
//! is the only producer (advances `end`), the wait daemon the only consumer
//! (advances `start`), so the ring needs no lock: an entry is written before
//! `end` is published with release ordering, and read only after `end` is
//! loaded with acquire ordering.

use crate::power::PowerUnit;
use crate::slot_map::SlotId;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// One occupied wait-link entry
///
/// Times are offsets from the device epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LinkRecord {
    /// TCB slot occupying the entry
    pub tag: SlotId,
    /// Address the core was pointed at
    pub addr: u64,
    /// When the entry was written
    pub dispatched: Duration,
    /// When the owning task times out
    pub deadline: Duration,
    /// Expected execution time
    pub estimate: Duration,
}

#[derive(Debug, Default)]
struct WaitLinkEntry {
    tag: AtomicU64,
    addr: AtomicU64,
    dispatched_ns: AtomicU64,
    deadline_ns: AtomicU64,
    estimate_ns: AtomicU64,
}

#[allow(clippy::cast_possible_truncation)]
const fn nanos(d: Duration) -> u64 {
    d.as_nanos() as u64
}

impl WaitLinkEntry {
    fn store(&self, rec: &LinkRecord) {
        self.tag.store(rec.tag.to_bits(), Ordering::Relaxed);
        self.addr.store(rec.addr, Ordering::Relaxed);
        self.dispatched_ns.store(nanos(rec.dispatched), Ordering::Relaxed);
        self.deadline_ns.store(nanos(rec.deadline), Ordering::Relaxed);
        self.estimate_ns.store(nanos(rec.estimate), Ordering::Relaxed);
    }

    fn load(&self) -> LinkRecord {
        LinkRecord {
            tag: SlotId::from_bits(self.tag.load(Ordering::Relaxed)),
            addr: self.addr.load(Ordering::Relaxed),
            dispatched: Duration::from_nanos(self.dispatched_ns.load(Ordering::Relaxed)),
            deadline: Duration::from_nanos(self.deadline_ns.load(Ordering::Relaxed)),
            estimate: Duration::from_nanos(self.estimate_ns.load(Ordering::Relaxed)),
        }
    }
}

/// Single-producer / single-consumer wait-link ring
#[derive(Debug)]
pub(crate) struct WaitLinkTable {
    entries: Box<[WaitLinkEntry]>,
    start: AtomicU64,
    end: AtomicU64,
}

impl WaitLinkTable {
    pub(crate) fn new(depth: usize) -> Self {
        Self {
            entries: (0..depth.max(1)).map(|_| WaitLinkEntry::default()).collect(),
            start: AtomicU64::new(0),
            end: AtomicU64::new(0),
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.entries.len()
    }

    fn slot(&self, cursor: u64) -> &WaitLinkEntry {
        let depth = self.entries.len() as u64;
        #[allow(clippy::cast_possible_truncation)]
        let idx = (cursor % depth) as usize;
        &self.entries[idx]
    }

    /// Occupied entries
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn len(&self) -> usize {
        let end = self.end.load(Ordering::Acquire);
        let start = self.start.load(Ordering::Acquire);
        end.saturating_sub(start) as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn free_slots(&self) -> usize {
        self.depth().saturating_sub(self.len())
    }

    /// Producer side: occupy the next entry. False if the ring is full.
    pub(crate) fn push(&self, rec: &LinkRecord) -> bool {
        let end = self.end.load(Ordering::Relaxed);
        let start = self.start.load(Ordering::Acquire);
        if end - start >= self.entries.len() as u64 {
            return false;
        }
        self.slot(end).store(rec);
        self.end.store(end + 1, Ordering::Release);
        true
    }

    /// Oldest occupied entry
    pub(crate) fn head(&self) -> Option<LinkRecord> {
        let start = self.start.load(Ordering::Relaxed);
        let end = self.end.load(Ordering::Acquire);
        (start < end).then(|| self.slot(start).load())
    }

    /// Consumer side: release the oldest entry
    pub(crate) fn pop(&self) -> Option<LinkRecord> {
        let rec = self.head()?;
        self.start.fetch_add(1, Ordering::Release);
        Some(rec)
    }

    /// Snapshot of every occupied entry, oldest first
    pub(crate) fn pending(&self) -> Vec<LinkRecord> {
        let start = self.start.load(Ordering::Acquire);
        let end = self.end.load(Ordering::Acquire);
        (start..end).map(|c| self.slot(c).load()).collect()
    }

    /// Consumer side: drop every entry (after the core was reset)
    pub(crate) fn reset(&self) -> Vec<LinkRecord> {
        let dropped = self.pending();
        self.start
            .store(self.end.load(Ordering::Acquire), Ordering::Release);
        dropped
    }
}

/// The head's estimate minus its elapsed time, plus the full estimate of
/// everything queued behind it
///
/// The head started at its dispatch or at the previous retirement on the
/// core, whichever came later.
pub(crate) fn remaining_work(
    pending: &[LinkRecord],
    last_retire: Duration,
    now: Duration,
) -> Duration {
    let Some((head, rest)) = pending.split_first() else {
        return Duration::ZERO;
    };
    let elapsed = now.saturating_sub(head.dispatched.max(last_retire));
    rest.iter()
        .fold(head.estimate.saturating_sub(elapsed), |acc, r| acc + r.estimate)
}

/// One core: wait-link ring, power record, failure latch
#[derive(Debug)]
pub(crate) struct HardwareUnit {
    pub core: u8,
    pub wait_link: WaitLinkTable,
    pub power: PowerUnit,
    failed: AtomicBool,
    last_retire_ns: AtomicU64,
}

impl HardwareUnit {
    pub(crate) fn new(core: u8, depth: usize, power: PowerUnit) -> Self {
        Self {
            core,
            wait_link: WaitLinkTable::new(depth),
            power,
            failed: AtomicBool::new(false),
            last_retire_ns: AtomicU64::new(0),
        }
    }

    /// No entry is pending on the core
    pub(crate) fn is_idle(&self) -> bool {
        self.wait_link.is_empty()
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    /// Record a retirement at `now`; returns the previous one
    pub(crate) fn mark_retired(&self, now: Duration) -> Duration {
        Duration::from_nanos(self.last_retire_ns.swap(nanos(now), Ordering::AcqRel))
    }

    /// Can take one more entry
    pub(crate) fn has_capacity(&self) -> bool {
        !self.is_failed() && self.wait_link.free_slots() > 0
    }

    /// Work left on the core at `now`
    pub(crate) fn remaining(&self, now: Duration) -> Duration {
        let last_retire = Duration::from_nanos(self.last_retire_ns.load(Ordering::Acquire));
        remaining_work(&self.wait_link.pending(), last_retire, now)
    }

    /// Soonest deadline among pending entries
    pub(crate) fn next_deadline(&self) -> Option<Duration> {
        self.wait_link.pending().iter().map(|r| r.deadline).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SimulatedNpu;
    use crate::hardware::Hw;
    use crate::power::PowerPolicy;

    fn rec(n: u64, dispatched_ms: u64, estimate_ms: u64) -> LinkRecord {
        LinkRecord {
            tag: SlotId::from_bits(n),
            addr: n * 0x100,
            dispatched: Duration::from_millis(dispatched_ms),
            deadline: Duration::from_millis(dispatched_ms + 100),
            estimate: Duration::from_millis(estimate_ms),
        }
    }

    #[test]
    fn ring_is_fifo_and_bounded() {
        let t = WaitLinkTable::new(2);
        assert!(t.push(&rec(1, 0, 1)));
        assert!(t.push(&rec(2, 0, 1)));
        assert!(!t.push(&rec(3, 0, 1)));
        assert_eq!(t.free_slots(), 0);
        assert_eq!(t.pop().unwrap().tag, SlotId::from_bits(1));
        assert!(t.push(&rec(3, 0, 1)));
        let tags: Vec<_> = t.pending().iter().map(|r| r.tag.to_bits()).collect();
        assert_eq!(tags, vec![2, 3]);
    }

    #[test]
    fn reset_drops_everything() {
        let t = WaitLinkTable::new(4);
        t.push(&rec(1, 0, 1));
        t.push(&rec(2, 0, 1));
        assert_eq!(t.reset().len(), 2);
        assert!(t.is_empty());
        assert!(t.head().is_none());
        assert!(t.push(&rec(3, 0, 1)));
        assert_eq!(t.head().unwrap().addr, 0x300);
    }

    #[test]
    fn remaining_counts_head_elapsed_only() {
        let pending = [rec(1, 10, 5), rec(2, 11, 4)];
        let now = Duration::from_millis(13);
        assert_eq!(remaining_work(&pending, Duration::ZERO, now), Duration::from_millis(2 + 4));
        let late = Duration::from_millis(100);
        assert_eq!(remaining_work(&pending, Duration::ZERO, late), Duration::from_millis(4));
        assert_eq!(remaining_work(&[], Duration::ZERO, now), Duration::ZERO);
    }

    #[test]
    fn head_that_waited_starts_at_previous_retire() {
        // Dispatched at 0 behind another entry that retired at 8.
        let pending = [rec(1, 0, 5)];
        let now = Duration::from_millis(10);
        assert_eq!(
            remaining_work(&pending, Duration::from_millis(8), now),
            Duration::from_millis(3)
        );

        let sim = std::sync::Arc::new(SimulatedNpu::new(1));
        let policy = PowerPolicy {
            idle_timeout: Duration::from_secs(1),
            power_off_timeout: Duration::from_secs(1),
            disable_clock_suspend: false,
        };
        let unit = HardwareUnit::new(0, 2, PowerUnit::new(0, Hw::new(sim, 1), policy));
        unit.wait_link.push(&rec(1, 0, 5));
        unit.mark_retired(Duration::from_millis(8));
        assert_eq!(unit.remaining(now), Duration::from_millis(3));
    }

    #[test]
    fn ring_wraps() {
        let t = WaitLinkTable::new(3);
        for n in 0..10 {
            assert!(t.push(&rec(n, 0, 1)));
            assert_eq!(t.pop().unwrap().tag.to_bits(), n);
        }
    }
}
