//! Harness error types and the error catalog.
//!
//! [`HarnessError`] is the single failure type every harness operation
//! returns. Each variant maps to a stable [`ErrorCode`] in the catalog, and
//! every message names what was being waited on or executed together with
//! the elapsed and allotted time where that applies.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                          |
//! |------------|-------------|--------------------------------------|
//! | E001-E099  | Config      | Configuration and environment errors |
//! | E100-E199  | Timing      | Bounded waits                        |
//! | E200-E299  | Screen      | Visual landmarks                     |
//! | E300-E399  | Vm          | VM control, guest commands, storage  |
//! | E400-E499  | Traffic     | Capture and connection policy        |
//! | E500-E599  | Scenario    | Steps, cleanup, helpers, internal    |

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};

use std::time::Duration;
use thiserror::Error;

/// Errors from harness operations.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("timed out after {elapsed:?} (limit {timeout:?}): {message}")]
    Timeout {
        message: String,
        elapsed: Duration,
        timeout: Duration,
    },

    #[error("landmark '{landmark}' not found within {timeout:?}")]
    NotFound { landmark: String, timeout: Duration },

    #[error("landmark '{landmark}' still visible after {timeout:?}")]
    StillPresent { landmark: String, timeout: Duration },

    #[error("cannot {operation} while VM is {state}")]
    InvalidState { operation: String, state: String },

    #[error("command '{command}' failed with exit code {exit_code}\nstdout: {stdout}\nstderr: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("connection to {address}:{port} is not allowed by the traffic policy")]
    PolicyViolation { address: String, port: u16 },

    #[error("usage error: {0}")]
    Usage(String),

    #[error("{backend} backend error: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },

    #[error("process '{name}' failed: {message}")]
    Process { name: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{} cleanup hook(s) failed: {}", .0.len(), .0.join("; "))]
    Cleanup(Vec<String>),
}

/// Result type for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;

impl HarnessError {
    /// Whether retrying the same action after a recovery could succeed.
    ///
    /// State machine violations, authoring mistakes and policy verdicts are
    /// deterministic, so retrying them only wastes time.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidState { .. }
                | Self::Usage(_)
                | Self::PolicyViolation { .. }
                | Self::Config(_)
                | Self::Cleanup(_)
        )
    }

    /// Catalog code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::WaitTimeout,
            Self::NotFound { .. } => ErrorCode::LandmarkNotFound,
            Self::StillPresent { .. } => ErrorCode::LandmarkStillPresent,
            Self::InvalidState { .. } => ErrorCode::VmInvalidState,
            Self::CommandFailed { .. } => ErrorCode::GuestCommandFailed,
            Self::PolicyViolation { .. } => ErrorCode::TrafficPolicyViolation,
            Self::Usage(_) => ErrorCode::StepUsage,
            Self::Backend { backend, .. } => match *backend {
                "capture" => ErrorCode::CaptureFailed,
                _ => ErrorCode::HypervisorFailed,
            },
            Self::Process { .. } => ErrorCode::ProcessFailed,
            Self::Config(_) => ErrorCode::ConfigValidationError,
            Self::Io(_) => ErrorCode::InternalIo,
            Self::Cleanup(_) => ErrorCode::CleanupFailed,
        }
    }

    /// Shorthand for a [`HarnessError::Backend`] error.
    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
        }
    }

    /// Shorthand for a [`HarnessError::InvalidState`] error.
    pub fn invalid_state(operation: impl Into<String>, state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            state: state.to_string(),
        }
    }

    /// Shorthand for a [`HarnessError::Usage`] error.
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }
}
