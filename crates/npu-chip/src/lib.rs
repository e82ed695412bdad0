// SPDX-License-Identifier: AGPL-3.0-only

//! Silicon model for multi-core NPU accelerators.
//!
//! This crate has **no dependencies** and **no hardware access**: it is a
//! pure model of the silicon as the driver core sees it: per-core register
//! offsets and bit definitions, the contiguous-core topology the scheduler
//! reasons about, and the command-buffer format that gets patched when a task
//! is moved to a different core window.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`variant`] | Chip variants, core counts, job-cancel capability |
//! | [`regs`] | Per-core register map: offsets and bit definitions |
//! | [`topology`] | Core topology and contiguous "shape" arithmetic |
//! | [`command`] | Command-buffer format: core enables, barriers, IRQ fragments |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod command;
pub mod regs;
pub mod topology;
pub mod variant;
