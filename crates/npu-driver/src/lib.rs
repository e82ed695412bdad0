// SPDX-License-Identifier: AGPL-3.0-only

//! Driver core for multi-core neural processing units.
//!
//! Tasks are submitted against a *shape* (a contiguous window of cores),
//! queued per shape, dispatched by a submit daemon onto each core's wait-link
//! ring and retired by a wait daemon driven by interrupts and deadlines.
//! Every core carries its own power state machine; faults and timeouts go
//! through a recovery path that resets only the implicated cores.
//!
//! # Components
//!
//! | Module | Role |
//! |--------|------|
//! | [`slot_map`] | generation-checked, reference-counted task table |
//! | [`dispatch_queue`] | one FIFO lane per shape, priority across lanes |
//! | [`power`] | per-core `Off → Idle → Ready → Run` state machine |
//! | [`tcb`] | task control block and its one-shot completion |
//! | [`scheduler`] | least-loaded window selection for auto-scheduled tasks |
//! | [`hardware`] | the [`NpuHardware`] seam and interrupt line |
//! | [`device`] | the [`Device`] handle: submit, wait, cancel, power, query |
//!
//! # Quick start
//!
//! ```no_run
//! use npu_driver::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let hw = Arc::new(SimulatedNpu::new(4));
//! let dev = Device::new(hw, DeviceConfig::default())?;
//!
//! let task = Task::new(1, CommandBuffer::for_window(0x1000_0000, 0, 2, &[0x10, 0x20]))
//!     .with_cores(0, 2);
//! let handle = dev.submit(task)?;
//! dev.wait(handle, std::time::Duration::from_secs(1))?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod backends;
pub mod config;
mod daemon;
pub mod database;
pub mod device;
pub mod dispatch_queue;
pub mod error;
pub mod hardware;
pub mod power;
mod recovery;
pub mod scheduler;
pub mod slot_map;
pub mod task;
pub mod tcb;
mod unit;

pub use backends::{JobBehavior, SimEvent, SimulatedNpu};
pub use config::DeviceConfig;
pub use database::{Counters, Database, ShapeInfo, SlotInfo, UnitInfo};
pub use device::Device;
pub use error::{NpuError, Result};
pub use hardware::{IrqLine, NpuHardware};
pub use power::{PowerEvent, PowerState};
pub use slot_map::{SlotId, SlotMap};
pub use task::{SubmitFlags, Task, TaskHandle};
pub use tcb::TaskStatus;

pub use npu_chip::command::CommandBuffer;
pub use npu_chip::topology::{CoreTopology, Shape};
pub use npu_chip::variant::ChipVariant;

/// Common imports
pub mod prelude {
    pub use crate::{
        ChipVariant, CommandBuffer, Device, DeviceConfig, JobBehavior, NpuError, NpuHardware,
        PowerEvent, PowerState, Shape, SimulatedNpu, Task, TaskHandle, TaskStatus,
    };
}
