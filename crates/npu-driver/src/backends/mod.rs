// SPDX-License-Identifier: AGPL-3.0-only

//! [`NpuHardware`](crate::NpuHardware) implementations
//!
//! - **Simulated**: register-level model with programmable job behaviour,
//!   always available, used by the tests and the CLI
//! - **Mmio**: register window mapped from a UIO device node (Linux)

#[cfg(target_os = "linux")]
pub mod mmio;
pub mod simulated;

#[cfg(target_os = "linux")]
pub use mmio::MmioNpu;
pub use simulated::{JobBehavior, SimEvent, SimulatedNpu};
