// hwstress-core/src/metrics.rs
// Point-in-time system metrics and the source trait the runner consumes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of system load at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub temperature_c: Option<f64>,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_percent: 0.0,
            disk_percent: 0.0,
            temperature_c: None,
            total_memory_bytes: 0,
            available_memory_bytes: 0,
            timestamp: Utc::now(),
        }
    }
}

impl SystemMetrics {
    /// Element-wise maximum of two snapshots, keeping the later timestamp
    pub fn peak(&self, other: &SystemMetrics) -> SystemMetrics {
        let temperature_c = match (self.temperature_c, other.temperature_c) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        SystemMetrics {
            cpu_percent: self.cpu_percent.max(other.cpu_percent),
            memory_percent: self.memory_percent.max(other.memory_percent),
            disk_percent: self.disk_percent.max(other.disk_percent),
            temperature_c,
            total_memory_bytes: self.total_memory_bytes.max(other.total_memory_bytes),
            // Lowest availability is the peak pressure
            available_memory_bytes: self.available_memory_bytes.min(other.available_memory_bytes),
            timestamp: self.timestamp.max(other.timestamp),
        }
    }
}

/// Source of system metrics, pulled on demand.
///
/// The platform readers live outside the core; the runner only needs this
/// shape to annotate baseline and peak snapshots.
pub trait MetricsSource: Send + Sync {
    fn current_metrics(&self) -> SystemMetrics;
}

impl<F> MetricsSource for F
where
    F: Fn() -> SystemMetrics + Send + Sync,
{
    fn current_metrics(&self) -> SystemMetrics {
        self()
    }
}
