// hwstress-core/src/logging.rs
// Injected log sink used for every lifecycle transition

use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

/// Leveled log destination handed to each component at construction.
///
/// Implementations are called from worker and recovery threads, so they
/// must be cheap and must not block for long.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Default sink: forwards to `tracing` under the `hwstress` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "hwstress", "{}", message),
            LogLevel::Info => tracing::info!(target: "hwstress", "{}", message),
            LogLevel::Warning => tracing::warn!(target: "hwstress", "{}", message),
            LogLevel::Error => tracing::error!(target: "hwstress", "{}", message),
            LogLevel::Critical => tracing::error!(target: "hwstress", critical = true, "{}", message),
        }
    }
}

/// Convenience constructor for the default sink
pub fn tracing_sink() -> Arc<dyn LogSink> {
    Arc::new(TracingSink)
}
