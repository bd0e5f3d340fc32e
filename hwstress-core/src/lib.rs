// hwstress-core/src/lib.rs
// Fault injection registry and stress run lifecycle

pub mod cancel;
pub mod config;
pub mod error;
pub mod fault;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod stress;

#[cfg(test)]
mod tests;

pub use cancel::{CancellationToken, TaskGroup};
pub use config::{RegistryConfig, WorkloadConfig, DEFAULT_INTENSITY, MAX_INTENSITY, MIN_INTENSITY};
pub use error::{ErrorCategory, HwStressError, Result};
pub use fault::FaultRegistry;
pub use logging::{tracing_sink, LogLevel, LogSink, TracingSink};
pub use metrics::{MetricsSource, SystemMetrics};
pub use model::{
    FaultId, FaultKind, FaultRecord, FaultSpec, RunResult, RunStatus, Severity, WorkloadKind,
};
pub use stress::suite::StressSuite;
pub use stress::StressRunner;
