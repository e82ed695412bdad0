// SPDX-License-Identifier: AGPL-3.0-only

//! Caller-visible task descriptors and handles

use crate::error::{NpuError, Result};
use crate::slot_map::SlotId;
use npu_chip::command::CommandBuffer;
use npu_chip::topology::{CoreTopology, Shape};
use std::time::Duration;

/// Highest submit priority (read first across lanes)
pub const MAX_PRIORITY: u8 = 3;

/// Slot-map key for one subtask of one task
pub const fn task_key(task_id: u32, subtask_index: u16) -> u64 {
    ((task_id as u64) << 16) | subtask_index as u64
}

/// Submission options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitFlags {
    /// Let the scheduler move the task to the least-loaded window
    pub auto_schedule: bool,
    /// 0..=`MAX_PRIORITY`; higher is read first across lanes, FIFO within one
    pub priority: u8,
}

/// One subtask submission
///
/// `core_index` is the only field the driver rewrites, and only before the
/// first dispatch when `flags.auto_schedule` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Opaque id, unique per logical job
    pub task_id: u32,
    /// Which subtask of `commands` this submission runs
    pub subtask_index: u16,
    /// Number of subtasks the job was split into
    pub subtask_count: u16,
    /// First core of the assigned window
    pub core_index: u8,
    /// Window width
    pub core_cnt: u8,
    /// Deadline from dispatch; device default when `None`
    pub time_out: Option<Duration>,
    /// Command-buffer descriptor id (keys execution history)
    pub descriptor: u64,
    /// Command buffer shared by all subtasks of the job
    pub commands: CommandBuffer,
    /// Submission options
    pub flags: SubmitFlags,
}

impl Task {
    /// Single-subtask, single-core task on core 0
    pub fn new(task_id: u32, commands: CommandBuffer) -> Self {
        let subtask_count = u16::try_from(commands.subtasks.len().max(1)).unwrap_or(u16::MAX);
        Self {
            task_id,
            subtask_index: 0,
            subtask_count,
            core_index: 0,
            core_cnt: 1,
            time_out: None,
            descriptor: commands.base_addr,
            commands,
            flags: SubmitFlags::default(),
        }
    }

    /// Select subtask `index` of `count`
    #[must_use]
    pub const fn with_subtask(mut self, index: u16, count: u16) -> Self {
        self.subtask_index = index;
        self.subtask_count = count;
        self
    }

    /// Assign window `[core_index, core_index + core_cnt)`
    #[must_use]
    pub const fn with_cores(mut self, core_index: u8, core_cnt: u8) -> Self {
        self.core_index = core_index;
        self.core_cnt = core_cnt;
        self
    }

    /// Set the dispatch deadline
    #[must_use]
    pub const fn with_timeout(mut self, time_out: Duration) -> Self {
        self.time_out = Some(time_out);
        self
    }

    /// Set the history descriptor id
    #[must_use]
    pub const fn with_descriptor(mut self, descriptor: u64) -> Self {
        self.descriptor = descriptor;
        self
    }

    /// Set the priority
    #[must_use]
    pub const fn with_priority(mut self, priority: u8) -> Self {
        self.flags.priority = priority;
        self
    }

    /// Let the scheduler choose the window
    #[must_use]
    pub const fn auto_scheduled(mut self) -> Self {
        self.flags.auto_schedule = true;
        self
    }

    /// Slot-map key
    pub const fn key(&self) -> u64 {
        task_key(self.task_id, self.subtask_index)
    }

    /// Assigned window
    pub const fn shape(&self) -> Shape {
        Shape::new(self.core_index, self.core_cnt)
    }

    /// Core whose completion retires the task
    pub const fn primary_core(&self) -> u8 {
        self.core_index
    }

    /// Device address the cores are pointed at
    pub fn trigger_addr(&self) -> Option<u64> {
        self.commands.subtask_addr(usize::from(self.subtask_index))
    }

    /// Check the task is well-formed for `topo`
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty or out-of-range window, a subtask index
    /// outside the buffer, or a priority above `MAX_PRIORITY`.
    pub fn validate(&self, topo: &CoreTopology) -> Result<()> {
        if self.core_cnt == 0 || self.core_cnt > topo.cores() {
            return Err(NpuError::invalid_argument(format!(
                "core_cnt {} outside 1..={}",
                self.core_cnt,
                topo.cores()
            )));
        }
        if !self.flags.auto_schedule && !topo.is_valid(self.shape()) {
            return Err(NpuError::invalid_argument(format!(
                "window {} does not fit {} cores",
                self.shape(),
                topo.cores()
            )));
        }
        if self.subtask_index >= self.subtask_count {
            return Err(NpuError::invalid_argument(format!(
                "subtask {} of {}",
                self.subtask_index, self.subtask_count
            )));
        }
        if self.trigger_addr().is_none() {
            return Err(NpuError::invalid_argument(format!(
                "command buffer has no subtask {}",
                self.subtask_index
            )));
        }
        if self.flags.priority > MAX_PRIORITY {
            return Err(NpuError::invalid_argument(format!(
                "priority {} above {MAX_PRIORITY}",
                self.flags.priority
            )));
        }
        Ok(())
    }
}

/// Handle returned by `Device::submit`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub(crate) key: u64,
    pub(crate) slot: SlotId,
}

impl TaskHandle {
    /// Slot-map key (task id and subtask index)
    pub const fn key(&self) -> u64 {
        self.key
    }

    /// Task id the handle was issued for
    #[allow(clippy::cast_possible_truncation)]
    pub const fn task_id(&self) -> u32 {
        (self.key >> 16) as u32
    }

    /// Subtask index the handle was issued for
    #[allow(clippy::cast_possible_truncation)]
    pub const fn subtask_index(&self) -> u16 {
        self.key as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topo4() -> CoreTopology {
        CoreTopology::new(4).unwrap()
    }

    #[test]
    fn key_packs_task_and_subtask() {
        let t = Task::new(0xabcd, CommandBuffer::for_window(0, 0, 1, &[16, 16])).with_subtask(1, 2);
        assert_eq!(t.key(), 0xabcd_0001);
        let h = TaskHandle {
            key: t.key(),
            slot: SlotId::from_bits(0),
        };
        assert_eq!(h.task_id(), 0xabcd);
        assert_eq!(h.subtask_index(), 1);
    }

    #[test]
    fn validate_window() {
        let buf = CommandBuffer::for_window(0, 0, 2, &[16]);
        Task::new(1, buf.clone()).with_cores(2, 2).validate(&topo4()).unwrap();
        assert!(Task::new(1, buf.clone()).with_cores(3, 2).validate(&topo4()).is_err());
        assert!(Task::new(1, buf.clone()).with_cores(0, 0).validate(&topo4()).is_err());
        assert!(Task::new(1, buf.clone()).with_cores(0, 5).validate(&topo4()).is_err());
        // The scheduler picks the start, so only the width matters.
        Task::new(1, buf).with_cores(3, 2).auto_scheduled().validate(&topo4()).unwrap();
    }

    #[test]
    fn validate_subtask_and_priority() {
        let buf = CommandBuffer::for_window(0, 0, 1, &[16]);
        assert!(Task::new(1, buf.clone()).with_subtask(1, 1).validate(&topo4()).is_err());
        assert!(Task::new(1, buf.clone()).with_subtask(1, 2).validate(&topo4()).is_err());
        assert!(Task::new(1, buf).with_priority(MAX_PRIORITY + 1).validate(&topo4()).is_err());
    }
}
