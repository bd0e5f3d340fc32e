// hwstress-core/src/config.rs
// Registry and workload configuration with rule-based validation

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{HwStressError, Result};
use crate::model::WorkloadKind;

/// Durations are written as integer milliseconds in config files
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

pub const MIN_INTENSITY: u8 = 1;
pub const MAX_INTENSITY: u8 = 10;
/// Intensity at which the configured block sizes apply unscaled
pub const DEFAULT_INTENSITY: u8 = 5;

/// Fault registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Age after which an auto-recovering fault is retired
    #[serde(rename = "recovery_delay_ms", with = "millis")]
    pub recovery_delay: Duration,
    /// Wake-up period of the recovery loop
    #[serde(rename = "recovery_tick_ms", with = "millis")]
    pub recovery_tick: Duration,
    pub history_capacity: usize,
    pub auto_recovery: bool,
    pub scratch_dir: PathBuf,
    pub max_retained_blocks: usize,
    /// Real process termination; off unless explicitly enabled
    pub allow_process_kill: bool,
    pub rng_seed: Option<u64>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            recovery_delay: Duration::from_secs(5),
            recovery_tick: Duration::from_secs(1),
            history_capacity: 1000,
            auto_recovery: true,
            scratch_dir: std::env::temp_dir().join("hwstress-faults"),
            max_retained_blocks: 16,
            allow_process_kill: false,
            rng_seed: None,
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.recovery_tick.is_zero() {
            return Err(HwStressError::config("recovery_tick", "must be greater than zero"));
        }
        if self.history_capacity == 0 {
            return Err(HwStressError::config("history_capacity", "must hold at least one record"));
        }
        if self.max_retained_blocks == 0 {
            return Err(HwStressError::config("max_retained_blocks", "must retain at least one block"));
        }
        if self.recovery_tick > self.recovery_delay && !self.recovery_delay.is_zero() {
            warn!(
                "Recovery tick {:?} is longer than recovery delay {:?}; faults will overstay",
                self.recovery_tick, self.recovery_delay
            );
        }
        Ok(())
    }
}

/// One stress run's parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub kind: WorkloadKind,
    pub name: Option<String>,
    #[serde(rename = "duration_ms", with = "millis")]
    pub duration: Duration,
    /// 0 = one worker per detected hardware thread
    pub thread_count: usize,
    pub intensity: u8,
    pub memory_block_size: usize,
    pub disk_block_size: usize,
    pub disk_path: PathBuf,
    pub monitor_metrics: bool,
    #[serde(rename = "sample_interval_ms", with = "millis")]
    pub sample_interval: Duration,
    #[serde(rename = "progress_interval_ms", with = "millis")]
    pub progress_interval: Duration,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            kind: WorkloadKind::Cpu,
            name: None,
            duration: Duration::from_secs(10),
            thread_count: 0,
            intensity: DEFAULT_INTENSITY,
            memory_block_size: 4 * 1024 * 1024,
            disk_block_size: 1024 * 1024,
            disk_path: std::env::temp_dir().join("hwstress-disk"),
            monitor_metrics: true,
            sample_interval: Duration::from_millis(500),
            progress_interval: Duration::from_millis(100),
        }
    }
}

impl WorkloadConfig {
    pub fn new(kind: WorkloadKind, duration: Duration) -> Self {
        Self {
            kind,
            duration,
            ..Default::default()
        }
    }

    pub fn with_threads(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub fn with_intensity(mut self, intensity: u8) -> Self {
        self.intensity = intensity;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| format!("{} stress", self.kind))
    }

    /// Upper bound on workers for this kind at this intensity
    pub fn worker_cap(&self, hardware_threads: usize) -> usize {
        let hw = hardware_threads.max(1);
        let intensity = self.intensity.clamp(MIN_INTENSITY, MAX_INTENSITY) as usize;
        match self.kind {
            WorkloadKind::Cpu | WorkloadKind::GpuSimulated | WorkloadKind::Combined => {
                (hw * intensity / MAX_INTENSITY as usize).clamp(1, hw)
            }
            WorkloadKind::Memory => hw.min(4),
            WorkloadKind::Disk => 1 + intensity / 4,
        }
    }

    /// Requested thread count (or detected concurrency) bounded by the cap
    pub fn resolve_workers(&self, hardware_threads: usize) -> usize {
        let requested = if self.thread_count > 0 {
            self.thread_count
        } else {
            hardware_threads.max(1)
        };
        requested.min(self.worker_cap(hardware_threads)).max(1)
    }

    /// CPU payload trig iterations per unit of work
    pub fn cpu_iterations(&self) -> usize {
        2000 * self.intensity.clamp(MIN_INTENSITY, MAX_INTENSITY) as usize
    }

    /// Side length of the simulated-GPU matrices
    pub fn matrix_size(&self) -> usize {
        64 + 16 * self.intensity.clamp(MIN_INTENSITY, MAX_INTENSITY) as usize
    }

    /// Memory payload buffer size. The configured size applies at the
    /// default intensity and scales linearly from there.
    pub fn memory_block_bytes(&self) -> usize {
        self.scale_block(self.memory_block_size)
    }

    /// Disk payload block size, scaled like `memory_block_bytes`
    pub fn disk_block_bytes(&self) -> usize {
        self.scale_block(self.disk_block_size)
    }

    fn scale_block(&self, base: usize) -> usize {
        let intensity = self.intensity.clamp(MIN_INTENSITY, MAX_INTENSITY) as usize;
        (base.saturating_mul(intensity) / DEFAULT_INTENSITY as usize).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        let constraints = SystemConstraints::detect();
        let report = ConfigValidator::new().validate(self, &constraints);
        for issue in &report.issues {
            match issue.severity {
                ValidationSeverity::Warning => warn!("{}: {}", issue.rule_name, issue.message),
                ValidationSeverity::Error => debug!("{}: {}", issue.rule_name, issue.message),
            }
        }
        match report.first_error() {
            Some(issue) => Err(HwStressError::config(issue.field, issue.message.clone())),
            None => Ok(()),
        }
    }
}

/// Host facts the rules check against
#[derive(Debug, Clone)]
pub struct SystemConstraints {
    pub cpu_cores: usize,
}

impl SystemConstraints {
    pub fn detect() -> Self {
        Self {
            cpu_cores: num_cpus::get(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidationSeverity {
    Warning,
    Error,
}

/// Validation rule over a workload config
#[derive(Debug, Clone)]
pub struct ValidationRule {
    pub name: &'static str,
    pub field: &'static str,
    pub severity: ValidationSeverity,
    /// Returns a message when the rule is violated
    pub check: fn(&WorkloadConfig, &SystemConstraints) -> Option<String>,
}

#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub rule_name: &'static str,
    pub field: &'static str,
    pub severity: ValidationSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.first_error().is_none()
    }

    pub fn first_error(&self) -> Option<&ValidationIssue> {
        self.issues
            .iter()
            .find(|issue| issue.severity == ValidationSeverity::Error)
    }
}

pub struct ConfigValidator {
    rules: Vec<ValidationRule>,
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigValidator {
    pub fn new() -> Self {
        Self {
            rules: Self::create_validation_rules(),
        }
    }

    pub fn validate(&self, config: &WorkloadConfig, constraints: &SystemConstraints) -> ValidationReport {
        let issues = self
            .rules
            .iter()
            .filter_map(|rule| {
                (rule.check)(config, constraints).map(|message| ValidationIssue {
                    rule_name: rule.name,
                    field: rule.field,
                    severity: rule.severity,
                    message,
                })
            })
            .collect();
        ValidationReport { issues }
    }

    fn create_validation_rules() -> Vec<ValidationRule> {
        vec![
            ValidationRule {
                name: "duration_nonzero",
                field: "duration",
                severity: ValidationSeverity::Error,
                check: |config, _| config.duration.is_zero().then(|| "Run duration must be greater than zero".to_string()),
            },
            ValidationRule {
                name: "intensity_bounds",
                field: "intensity",
                severity: ValidationSeverity::Error,
                check: |config, _| {
                    (!(MIN_INTENSITY..=MAX_INTENSITY).contains(&config.intensity)).then(|| {
                        format!(
                            "Intensity {} outside {}..={}",
                            config.intensity, MIN_INTENSITY, MAX_INTENSITY
                        )
                    })
                },
            },
            ValidationRule {
                name: "memory_block_nonzero",
                field: "memory_block_size",
                severity: ValidationSeverity::Error,
                check: |config, _| (config.memory_block_size == 0).then(|| "Memory block size cannot be zero".to_string()),
            },
            ValidationRule {
                name: "disk_block_nonzero",
                field: "disk_block_size",
                severity: ValidationSeverity::Error,
                check: |config, _| (config.disk_block_size == 0).then(|| "Disk block size cannot be zero".to_string()),
            },
            ValidationRule {
                name: "progress_interval_nonzero",
                field: "progress_interval",
                severity: ValidationSeverity::Error,
                check: |config, _| {
                    config.progress_interval.is_zero().then(|| "Progress interval must be greater than zero".to_string())
                },
            },
            ValidationRule {
                name: "sample_interval_nonzero",
                field: "sample_interval",
                severity: ValidationSeverity::Error,
                check: |config, _| {
                    (config.monitor_metrics && config.sample_interval.is_zero())
                        .then(|| "Sample interval must be greater than zero when monitoring".to_string())
                },
            },
            ValidationRule {
                name: "thread_oversubscription",
                field: "thread_count",
                severity: ValidationSeverity::Warning,
                check: |config, constraints| {
                    (config.thread_count > constraints.cpu_cores * 4).then(|| {
                        format!(
                            "{} threads requested on {} cores; will be capped at {}",
                            config.thread_count,
                            constraints.cpu_cores,
                            config.worker_cap(constraints.cpu_cores)
                        )
                    })
                },
            },
            ValidationRule {
                name: "memory_block_size",
                field: "memory_block_size",
                severity: ValidationSeverity::Warning,
                check: |config, _| {
                    (config.memory_block_bytes() > 1024 * 1024 * 1024)
                        .then(|| format!("Memory block of {} bytes per worker is very large", config.memory_block_bytes()))
                },
            },
        ]
    }
}
