// SPDX-License-Identifier: AGPL-3.0-only

//! Device configuration
//!
//! Defaults suit a small multi-core part. Every field can be overridden from
//! the environment with `DeviceConfig::from_env()`, which is how the CLI and
//! long-running services pick up tuning without a rebuild.

use crate::error::{NpuError, Result};
use npu_chip::variant::MAX_WAIT_LINK_DEPTH;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-device tuning knobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Device index (used in thread names and logs)
    pub device_index: usize,

    /// Wait-link entries per core
    pub wait_link_depth: usize,

    /// Initial slot-map capacity
    pub slot_capacity: usize,

    /// Ceiling for slot-map expansion
    pub slot_capacity_max: usize,

    /// Whether a full slot map may grow
    pub allow_expand: bool,

    /// Pending entries per dispatch lane
    pub queue_depth: usize,

    /// Deadline applied to tasks that do not carry one
    pub default_timeout: Duration,

    /// Grace period in READY before the clock is gated (READY → IDLE)
    pub idle_timeout: Duration,

    /// Grace period in IDLE before the unit is powered off (IDLE → OFF)
    pub power_off_timeout: Duration,

    /// Keep the clock running after a job ends
    pub disable_clock_suspend: bool,

    /// Upper bound on the software (wait-for-idle) cancel path
    pub sw_cancel_cap: Duration,

    /// Attempts per register access before surfacing `NpuError::Io`
    pub io_retries: u32,

    /// Execution time assumed for descriptors with no history yet
    pub default_exec_estimate: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            wait_link_depth: 4,
            slot_capacity: 32,
            slot_capacity_max: 1024,
            allow_expand: true,
            queue_depth: 64,
            default_timeout: Duration::from_secs(6),
            idle_timeout: Duration::from_secs(3),
            power_off_timeout: Duration::from_secs(5),
            disable_clock_suspend: false,
            sw_cancel_cap: Duration::from_secs(2),
            io_retries: 3,
            default_exec_estimate: Duration::from_millis(1),
        }
    }
}

impl DeviceConfig {
    /// Defaults overridden by `NPU_*` environment variables
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `NPU_*` key
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        let get = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse::<u64>() {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("Ignoring {key}={raw:?}: {e}");
                    None
                }
            }
        };
        let as_usize = |v: u64| usize::try_from(v).unwrap_or(usize::MAX);

        if let Some(v) = get("NPU_DEVICE_INDEX") {
            cfg.device_index = as_usize(v);
        }
        if let Some(v) = get("NPU_WAIT_LINK_DEPTH") {
            cfg.wait_link_depth = as_usize(v);
        }
        if let Some(v) = get("NPU_SLOT_CAPACITY") {
            cfg.slot_capacity = as_usize(v);
        }
        if let Some(v) = get("NPU_SLOT_CAPACITY_MAX") {
            cfg.slot_capacity_max = as_usize(v);
        }
        if let Some(v) = get("NPU_ALLOW_EXPAND") {
            cfg.allow_expand = v != 0;
        }
        if let Some(v) = get("NPU_QUEUE_DEPTH") {
            cfg.queue_depth = as_usize(v);
        }
        if let Some(v) = get("NPU_TIMEOUT_MS") {
            cfg.default_timeout = Duration::from_millis(v);
        }
        if let Some(v) = get("NPU_IDLE_TIMEOUT_MS") {
            cfg.idle_timeout = Duration::from_millis(v);
        }
        if let Some(v) = get("NPU_POWER_OFF_TIMEOUT_MS") {
            cfg.power_off_timeout = Duration::from_millis(v);
        }
        if let Some(v) = get("NPU_DISABLE_CLOCK_SUSPEND") {
            cfg.disable_clock_suspend = v != 0;
        }
        if let Some(v) = get("NPU_SW_CANCEL_CAP_MS") {
            cfg.sw_cancel_cap = Duration::from_millis(v);
        }
        if let Some(v) = get("NPU_IO_RETRIES") {
            cfg.io_retries = u32::try_from(v).unwrap_or(u32::MAX);
        }

        debug!("Device config: {cfg:?}");
        cfg
    }

    /// Set the wait-link depth
    #[must_use]
    pub const fn with_wait_link_depth(mut self, depth: usize) -> Self {
        self.wait_link_depth = depth;
        self
    }

    /// Set initial and maximum slot-map capacity
    #[must_use]
    pub const fn with_slot_capacity(mut self, initial: usize, max: usize) -> Self {
        self.slot_capacity = initial;
        self.slot_capacity_max = max;
        self
    }

    /// Allow or forbid slot-map expansion
    #[must_use]
    pub const fn with_allow_expand(mut self, allow: bool) -> Self {
        self.allow_expand = allow;
        self
    }

    /// Set the per-lane queue depth
    #[must_use]
    pub const fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Set the default task deadline
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the READY → IDLE and IDLE → OFF grace periods
    #[must_use]
    pub const fn with_power_timeouts(mut self, idle: Duration, off: Duration) -> Self {
        self.idle_timeout = idle;
        self.power_off_timeout = off;
        self
    }

    /// Keep clocks running after jobs end
    #[must_use]
    pub const fn with_disable_clock_suspend(mut self, disable: bool) -> Self {
        self.disable_clock_suspend = disable;
        self
    }

    /// Set the cap on software cancellation
    #[must_use]
    pub const fn with_sw_cancel_cap(mut self, cap: Duration) -> Self {
        self.sw_cancel_cap = cap;
        self
    }

    /// Set the execution estimate for unseen descriptors
    #[must_use]
    pub const fn with_default_exec_estimate(mut self, estimate: Duration) -> Self {
        self.default_exec_estimate = estimate;
        self
    }

    /// Check the configuration is usable
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for zero depths or capacities, or an initial
    /// capacity above the maximum.
    pub fn validate(&self) -> Result<()> {
        if self.wait_link_depth == 0 || self.wait_link_depth > MAX_WAIT_LINK_DEPTH {
            return Err(NpuError::invalid_argument(format!(
                "wait_link_depth {} outside 1..={MAX_WAIT_LINK_DEPTH}",
                self.wait_link_depth
            )));
        }
        if self.slot_capacity == 0 {
            return Err(NpuError::invalid_argument("slot_capacity must be non-zero"));
        }
        if self.slot_capacity > self.slot_capacity_max {
            return Err(NpuError::invalid_argument(format!(
                "slot_capacity {} exceeds slot_capacity_max {}",
                self.slot_capacity, self.slot_capacity_max
            )));
        }
        if self.queue_depth == 0 {
            return Err(NpuError::invalid_argument("queue_depth must be non-zero"));
        }
        if self.io_retries == 0 {
            return Err(NpuError::invalid_argument("io_retries must be non-zero"));
        }
        Ok(())
    }
}
