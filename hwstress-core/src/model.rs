// hwstress-core/src/model.rs
// Shared data model: fault specs/records, workload kinds and run results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::metrics::SystemMetrics;

/// Identity of one injected fault
pub type FaultId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    MemoryCorruption,
    CpuOverload,
    DiskIOError,
    NetworkPacketLoss,
    TimingAnomaly,
    ProcessKill,
    SystemCallFailure,
}

impl FaultKind {
    pub const ALL: [FaultKind; 7] = [
        FaultKind::MemoryCorruption,
        FaultKind::CpuOverload,
        FaultKind::DiskIOError,
        FaultKind::NetworkPacketLoss,
        FaultKind::TimingAnomaly,
        FaultKind::ProcessKill,
        FaultKind::SystemCallFailure,
    ];
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::MemoryCorruption => "MemoryCorruption",
            FaultKind::CpuOverload => "CpuOverload",
            FaultKind::DiskIOError => "DiskIOError",
            FaultKind::NetworkPacketLoss => "NetworkPacketLoss",
            FaultKind::TimingAnomaly => "TimingAnomaly",
            FaultKind::ProcessKill => "ProcessKill",
            FaultKind::SystemCallFailure => "SystemCallFailure",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Busy/disruption threads spawned for a fault of this severity
    pub fn thread_count(self) -> usize {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 4,
            Severity::Critical => 8,
        }
    }

    /// Bytes held by a memory-corruption fault
    pub fn memory_bytes(self) -> usize {
        const MIB: usize = 1024 * 1024;
        match self {
            Severity::Low | Severity::Medium => MIB,
            Severity::High | Severity::Critical => 10 * MIB,
        }
    }

    /// Scratch files written by a disk fault
    pub fn disk_files(self) -> usize {
        match self {
            Severity::Low | Severity::Medium => 5,
            Severity::High | Severity::Critical => 20,
        }
    }

    /// Period of the simulated disruption loop
    pub fn disruption_interval(self) -> Duration {
        match self {
            Severity::Low => Duration::from_millis(200),
            Severity::Medium => Duration::from_millis(100),
            Severity::High => Duration::from_millis(50),
            Severity::Critical => Duration::from_millis(20),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Request to inject one fault. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultSpec {
    pub kind: FaultKind,
    pub severity: Severity,
    pub target: String,
    pub duration: Duration,
    pub probability: f64,
    pub auto_recover: bool,
}

impl FaultSpec {
    /// Deterministic spec: probability 1.0, 10s duration, auto-recovering
    pub fn new(kind: FaultKind, target: impl Into<String>, severity: Severity) -> Self {
        Self {
            kind,
            severity,
            target: target.into(),
            duration: Duration::from_secs(10),
            probability: 1.0,
            auto_recover: true,
        }
    }

    pub fn with_probability(mut self, probability: f64) -> Self {
        self.probability = probability;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_auto_recover(mut self, auto_recover: bool) -> Self {
        self.auto_recover = auto_recover;
        self
    }
}

/// Outcome of one injection attempt, as kept in history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub id: FaultId,
    pub kind: FaultKind,
    pub severity: Severity,
    pub target: String,
    pub duration: Duration,
    pub probability: f64,
    pub auto_recover: bool,
    pub injection_time: DateTime<Utc>,
    pub success: bool,
    pub error_message: Option<String>,
    /// Activation time at injection; active lifetime once recovered
    pub observed: Duration,
}

impl FaultRecord {
    pub(crate) fn from_spec(spec: &FaultSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: spec.kind,
            severity: spec.severity,
            target: spec.target.clone(),
            duration: spec.duration,
            probability: spec.probability,
            auto_recover: spec.auto_recover,
            injection_time: Utc::now(),
            success: false,
            error_message: None,
            observed: Duration::ZERO,
        }
    }

    pub(crate) fn failed(mut self, message: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadKind {
    Cpu,
    Memory,
    Disk,
    GpuSimulated,
    Combined,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkloadKind::Cpu => "cpu",
            WorkloadKind::Memory => "memory",
            WorkloadKind::Disk => "disk",
            WorkloadKind::GpuSimulated => "gpu-simulated",
            WorkloadKind::Combined => "combined",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Interrupted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

/// Result of one stress run. Copied out to callers, never shared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub kind: WorkloadKind,
    pub name: String,
    pub status: RunStatus,
    pub duration: Duration,
    pub workers: usize,
    pub operations_completed: u64,
    pub errors_encountered: u64,
    pub test_passed: bool,
    pub error_message: Option<String>,
    pub baseline_metrics: Option<SystemMetrics>,
    pub peak_metrics: Option<SystemMetrics>,
    pub metrics_history: Vec<SystemMetrics>,
}

impl RunResult {
    pub fn pending(kind: WorkloadKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            status: RunStatus::Pending,
            duration: Duration::ZERO,
            workers: 0,
            operations_completed: 0,
            errors_encountered: 0,
            test_passed: false,
            error_message: None,
            baseline_metrics: None,
            peak_metrics: None,
            metrics_history: Vec::new(),
        }
    }
}
