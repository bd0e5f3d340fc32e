// hwstress-core/src/error.rs
// Error taxonomy for the fault registry and stress runner

use std::result;
use thiserror::Error;

use crate::model::FaultKind;

/// Main error type for the hwstress core
#[derive(Error, Debug)]
pub enum HwStressError {
    /// A stress run is already in progress on this runner
    #[error("Stress run already in progress")]
    AlreadyRunning,

    /// Operation needs an active run
    #[error("No stress run in progress")]
    NotRunning,

    /// Configuration validation errors
    #[error("Configuration error: {field} - {message}")]
    InvalidConfig { field: String, message: String },

    /// Fault specification rejected before activation
    #[error("Invalid fault spec: {message}")]
    InvalidSpec { message: String },

    /// Same fault kind already active on the target
    #[error("Fault {kind} already active on target '{target}'")]
    DuplicateActive { kind: FaultKind, target: String },

    /// Could not start a worker or fault thread
    #[error("Failed to spawn {what}: {source}")]
    Spawn {
        what: String,
        #[source]
        source: std::io::Error,
    },

    /// Filesystem or other I/O failure
    #[error("I/O error: {operation} failed - {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Operation not available on this platform
    #[error("Unsupported: {operation} ({details})")]
    Unsupported { operation: String, details: String },

    /// Process kill is gated off; the fault was only simulated
    #[error("Process kill disabled: simulated only, no process was signalled")]
    ProcessKillDisabled,

    /// Registry was shut down; no further faults are accepted
    #[error("Fault registry is shut down")]
    RegistryClosed,

    /// History export failures
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// One or more records failed to release their resources
    #[error("Cleanup failed for {} resource(s): {}", failures.len(), failures.join("; "))]
    Cleanup { failures: Vec<String> },
}

/// Result type alias for convenience
pub type Result<T> = result::Result<T, HwStressError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transient, // Resource pressure that may clear on retry
    Permanent, // Caller or platform problem, retry won't help
    Warning,   // Reported but harmless
}

impl HwStressError {
    pub fn config(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn spec(message: impl Into<String>) -> Self {
        Self::InvalidSpec { message: message.into() }
    }

    pub fn spawn(what: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn { what: what.into(), source }
    }

    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { operation: operation.into(), source }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            HwStressError::Spawn { .. } | HwStressError::Io { .. } => ErrorCategory::Transient,
            HwStressError::Cleanup { .. } => ErrorCategory::Transient,
            HwStressError::AlreadyRunning
            | HwStressError::NotRunning
            | HwStressError::DuplicateActive { .. }
            | HwStressError::ProcessKillDisabled => ErrorCategory::Warning,
            _ => ErrorCategory::Permanent,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.category() != ErrorCategory::Permanent
    }
}
