// SPDX-License-Identifier: AGPL-3.0-only

//! Per-shape dispatch lanes
//!
//! One FIFO lane per contiguous core window. Readers pass a bitmap of lanes
//! whose cores can currently accept work, so a large task stuck behind
//! exhausted capacity never blocks smaller tasks on other windows. Within a
//! lane order is strict FIFO; across lanes the highest-priority head wins and
//! ties rotate.

use crate::error::{NpuError, Result};
use crate::slot_map::SlotId;
use npu_chip::topology::{CoreTopology, Shape};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::trace;

/// Record carried through a lane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePayload {
    /// Back-reference into the slot map
    pub slot: SlotId,
    /// Slot-map key
    pub key: u64,
    /// Cores the task needs
    pub resource_mask: u32,
    /// Window the task runs on
    pub shape: Shape,
    /// Expected execution time
    pub estimate: Duration,
    /// Submit priority
    pub priority: u8,
}

/// Aggregate bookkeeping for one lane
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShapeLoad {
    /// Entries waiting in the lane
    pub task_count: usize,
    /// Sum of their estimates
    pub estimated_time: Duration,
}

/// What `clean` purges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanKind {
    /// The single entry for this slot
    Slot(SlotId),
    /// Every entry whose resource mask intersects the given mask
    Intersecting(u32),
    /// Everything
    All,
}

#[derive(Debug, Default)]
struct Lane {
    entries: VecDeque<QueuePayload>,
    load: ShapeLoad,
}

impl Lane {
    fn push(&mut self, p: QueuePayload) {
        self.load.task_count += 1;
        self.load.estimated_time += p.estimate;
        self.entries.push_back(p);
    }

    fn account_removed(&mut self, p: &QueuePayload) {
        self.load.task_count -= 1;
        self.load.estimated_time = self.load.estimated_time.saturating_sub(p.estimate);
    }
}

#[derive(Debug)]
struct Inner {
    lanes: Vec<Lane>,
    cursor: usize,
}

/// Dispatch queue for one device
#[derive(Debug)]
pub struct DispatchQueue {
    topo: CoreTopology,
    depth: usize,
    inner: Mutex<Inner>,
}

impl DispatchQueue {
    /// One lane per window of `topo`, each holding up to `depth` entries
    pub fn new(topo: CoreTopology, depth: usize) -> Self {
        let lanes = (0..topo.shape_count()).map(|_| Lane::default()).collect();
        Self {
            topo,
            depth,
            inner: Mutex::new(Inner { lanes, cursor: 0 }),
        }
    }

    /// Append to the lane for `payload.shape`
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the shape does not fit the device,
    /// `OutOfResource` if the lane is full.
    pub fn write(&self, payload: QueuePayload) -> Result<()> {
        let index = self
            .topo
            .shape_index(payload.shape)
            .ok_or_else(|| NpuError::invalid_argument(format!("no lane for {}", payload.shape)))?;
        let mut inner = self.inner.lock();
        let lane = &mut inner.lanes[index];
        if lane.entries.len() >= self.depth {
            return Err(NpuError::out_of_resource("dispatch queue"));
        }
        lane.push(payload);
        trace!("Queued slot {} on lane {} ({})", payload.slot, index, payload.shape);
        Ok(())
    }

    /// Pop the best head among lanes set in `shape_mask`
    pub fn read(&self, shape_mask: u64) -> Option<QueuePayload> {
        let mut inner = self.inner.lock();
        let n = inner.lanes.len();
        let start = inner.cursor % n.max(1);

        let mut best: Option<(usize, u8)> = None;
        for step in 0..n {
            let i = (start + step) % n;
            if shape_mask & (1 << i) == 0 {
                continue;
            }
            if let Some(head) = inner.lanes[i].entries.front() {
                if best.map_or(true, |(_, p)| head.priority > p) {
                    best = Some((i, head.priority));
                }
            }
        }

        let (i, _) = best?;
        let lane = &mut inner.lanes[i];
        let payload = lane.entries.pop_front()?;
        lane.account_removed(&payload);
        inner.cursor = i + 1;
        Some(payload)
    }

    /// Remove matching entries and return them in lane order
    pub fn clean(&self, kind: CleanKind) -> Vec<QueuePayload> {
        let mut inner = self.inner.lock();
        let mut purged = Vec::new();
        for lane in &mut inner.lanes {
            let mut kept = VecDeque::with_capacity(lane.entries.len());
            while let Some(p) = lane.entries.pop_front() {
                let hit = match kind {
                    CleanKind::Slot(slot) => p.slot == slot,
                    CleanKind::Intersecting(mask) => p.resource_mask & mask != 0,
                    CleanKind::All => true,
                };
                if hit {
                    lane.account_removed(&p);
                    purged.push(p);
                } else {
                    kept.push_back(p);
                }
            }
            lane.entries = kept;
        }
        purged
    }

    /// Bitmap of lanes for which `ready` returns true
    pub fn shape_mask_where(&self, ready: impl Fn(Shape) -> bool) -> u64 {
        self.topo
            .shapes()
            .enumerate()
            .filter(|(_, s)| ready(*s))
            .fold(0, |acc, (i, _)| acc | (1 << i))
    }

    /// Per-lane load, in lane order
    pub fn loads(&self) -> Vec<ShapeLoad> {
        self.inner.lock().lanes.iter().map(|l| l.load).collect()
    }

    /// Queued estimate per core: sum over every lane whose window includes it
    pub fn per_core_load(&self) -> Vec<Duration> {
        let loads = self.loads();
        let mut per_core = vec![Duration::ZERO; usize::from(self.topo.cores())];
        for (shape, load) in self.topo.shapes().zip(loads) {
            for core in shape.cores() {
                per_core[usize::from(core)] += load.estimated_time;
            }
        }
        per_core
    }

    /// Entries waiting across every lane
    pub fn len(&self) -> usize {
        self.inner.lock().lanes.iter().map(|l| l.entries.len()).sum()
    }

    /// True if no entry is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
