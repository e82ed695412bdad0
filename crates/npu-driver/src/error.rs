// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for NPU driver operations

use thiserror::Error;

/// Result type alias for NPU operations
pub type Result<T> = std::result::Result<T, NpuError>;

/// Errors that can occur during NPU operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NpuError {
    /// Slot map or dispatch queue is full
    #[error("Out of resource: {resource}")]
    OutOfResource {
        /// Which table ran out
        resource: &'static str,
    },

    /// A TCB for this task id and subtask index is already in flight
    #[error("Task {key:#x} is already in flight")]
    AlreadyExists {
        /// Slot map key of the conflicting task
        key: u64,
    },

    /// Malformed task or configuration
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong
        reason: String,
    },

    /// Handle does not refer to a live task
    #[error("Invalid or stale task handle {key:#x}")]
    InvalidHandle {
        /// Slot map key carried by the handle
        key: u64,
    },

    /// Task did not finish within its deadline and was recovered
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// The caller stopped waiting; the operation is still pending
    #[error("Gave up waiting after {duration_ms}ms")]
    WaitTimeout {
        /// How long the caller waited, in milliseconds
        duration_ms: u64,
    },

    /// Task was canceled by the caller or by recovery
    #[error("Task canceled")]
    Canceled,

    /// Hardware was recovered underneath the task
    #[error("Hardware recovered while task was in flight")]
    Recovered,

    /// Hardware reported a fault
    #[error("Hardware fault on core {core}: status {status:#010x}")]
    Fault {
        /// Core that raised the fault
        core: u8,
        /// Raw status bits
        status: u32,
    },

    /// Register access failed after retries
    #[error("I/O error on core {core}: {reason}")]
    Io {
        /// Core being accessed
        core: u8,
        /// Reason for failure
        reason: String,
    },

    /// Device or unit is in an invalid state
    #[error("Device in invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Device is shutting down
    #[error("Device is shutting down")]
    ShuttingDown,
}

impl NpuError {
    /// Create an out-of-resource error
    pub const fn out_of_resource(resource: &'static str) -> Self {
        Self::OutOfResource { resource }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create an I/O error
    pub fn io(core: u8, reason: impl Into<String>) -> Self {
        Self::Io {
            core,
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    #[allow(clippy::cast_possible_truncation)]
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout {
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Create a caller-side wait timeout
    #[allow(clippy::cast_possible_truncation)]
    pub fn wait_timeout(waited: std::time::Duration) -> Self {
        Self::WaitTimeout {
            duration_ms: waited.as_millis() as u64,
        }
    }

    /// Retrying after backpressure or table expansion may succeed
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::OutOfResource { .. })
    }

    /// Outcome produced by the recovery path rather than a caller mistake
    pub const fn is_recovery_outcome(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Canceled | Self::Recovered | Self::Fault { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn classification() {
        assert!(NpuError::out_of_resource("slot map").is_retryable());
        assert!(!NpuError::Canceled.is_retryable());
        assert!(NpuError::Recovered.is_recovery_outcome());
        assert!(NpuError::Fault { core: 1, status: 0x10 }.is_recovery_outcome());
        assert!(!NpuError::invalid_argument("x").is_recovery_outcome());
        let waited = NpuError::wait_timeout(Duration::from_millis(10));
        assert!(!waited.is_recovery_outcome());
        assert_ne!(waited, NpuError::timeout(Duration::from_millis(10)));
    }

    #[test]
    fn messages() {
        assert_eq!(
            NpuError::timeout(Duration::from_millis(1500)).to_string(),
            "Operation timeout after 1500ms"
        );
        assert_eq!(
            NpuError::AlreadyExists { key: 0x1_0002 }.to_string(),
            "Task 0x10002 is already in flight"
        );
    }
}
