// hwstress-core/src/stress/suite.rs
// Ordered set of named workloads run back to back on one runner

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::StressRunner;
use crate::config::WorkloadConfig;
use crate::error::{HwStressError, Result};
use crate::logging::{LogLevel, LogSink};
use crate::model::{RunResult, RunStatus};

struct SuiteEntry {
    name: String,
    config: WorkloadConfig,
    result: Option<RunResult>,
}

pub struct StressSuite {
    runner: StressRunner,
    sink: Arc<dyn LogSink>,
    entries: Mutex<Vec<SuiteEntry>>,
    global_duration: Mutex<Option<Duration>>,
    global_intensity: Mutex<Option<u8>>,
    stop_requested: AtomicBool,
}

impl StressSuite {
    pub fn new(runner: StressRunner, sink: Arc<dyn LogSink>) -> Self {
        Self {
            runner,
            sink,
            entries: Mutex::new(Vec::new()),
            global_duration: Mutex::new(None),
            global_intensity: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn runner(&self) -> &StressRunner {
        &self.runner
    }

    /// Append a workload; a later entry with the same name replaces its config
    pub fn add_test(&self, config: WorkloadConfig) {
        let name = config.display_name();
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => entry.config = config,
            None => entries.push(SuiteEntry {
                name,
                config,
                result: None,
            }),
        }
    }

    pub fn set_test_config(&self, name: &str, config: WorkloadConfig) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or_else(|| HwStressError::config("name", format!("no test named '{}'", name)))?;
        entry.config = config;
        Ok(())
    }

    pub fn set_global_duration(&self, duration: Duration) {
        *self.global_duration.lock() = Some(duration);
    }

    pub fn set_global_intensity(&self, intensity: u8) {
        *self.global_intensity.lock() = Some(intensity);
    }

    pub fn test_names(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.name.clone()).collect()
    }

    fn effective_config(&self, name: &str) -> Result<WorkloadConfig> {
        let mut config = self
            .entries
            .lock()
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.config.clone())
            .ok_or_else(|| HwStressError::config("name", format!("no test named '{}'", name)))?;

        if let Some(duration) = *self.global_duration.lock() {
            config.duration = duration;
        }
        if let Some(intensity) = *self.global_intensity.lock() {
            config.intensity = intensity;
        }
        config.name = Some(name.to_string());
        Ok(config)
    }

    /// Run one named workload to completion. Clears an earlier `stop_all`.
    pub fn run_test(&self, name: &str) -> Result<RunResult> {
        self.stop_requested.store(false, Ordering::SeqCst);
        self.run_one(name)
    }

    fn run_one(&self, name: &str) -> Result<RunResult> {
        let config = self.effective_config(name)?;
        self.runner.start(config)?;
        // A stop_all that landed before the start found nothing to stop
        if self.stop_requested.load(Ordering::SeqCst) {
            self.runner.stop();
        }
        let result = match self.runner.wait() {
            Ok(result) => result,
            // Already finalized by whoever stopped it
            Err(HwStressError::NotRunning) => self.runner.get_result(),
            Err(e) => return Err(e),
        };

        if let Some(entry) = self.entries.lock().iter_mut().find(|e| e.name == name) {
            entry.result = Some(result.clone());
        }
        Ok(result)
    }

    /// Run every workload in insertion order until done or `stop_all`
    pub fn run_all(&self) -> Vec<RunResult> {
        self.stop_requested.store(false, Ordering::SeqCst);
        let names = self.test_names();
        self.sink.log(LogLevel::Info, &format!("Running suite of {} test(s)", names.len()));

        let mut results = Vec::with_capacity(names.len());
        for name in names {
            if self.stop_requested.load(Ordering::SeqCst) {
                self.sink.log(LogLevel::Info, "Suite stopped before completion");
                break;
            }
            match self.run_one(&name) {
                Ok(result) => results.push(result),
                Err(e) => {
                    self.sink.log(LogLevel::Error, &format!("Test {} failed to run: {}", name, e));
                    let mut failed = match self.effective_config(&name) {
                        Ok(config) => RunResult::pending(config.kind, name.clone()),
                        Err(_) => continue,
                    };
                    failed.status = RunStatus::Failed;
                    failed.error_message = Some(e.to_string());
                    results.push(failed);
                }
            }
        }

        let passed = results.iter().filter(|r| r.test_passed).count();
        self.sink.log(
            LogLevel::Info,
            &format!("Suite finished: {}/{} passed", passed, results.len()),
        );
        results
    }

    /// Interrupt the current workload and skip the remaining ones
    pub fn stop_all(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.runner.stop();
    }

    pub fn results(&self) -> Vec<RunResult> {
        self.entries.lock().iter().filter_map(|e| e.result.clone()).collect()
    }

    pub fn result(&self, name: &str) -> Option<RunResult> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.result.clone())
    }

    pub fn is_any_running(&self) -> bool {
        self.runner.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::capture::CaptureSink;
    use crate::model::WorkloadKind;
    use std::thread;
    use std::time::Instant;

    fn suite() -> StressSuite {
        let sink: Arc<CaptureSink> = Arc::new(CaptureSink::default());
        StressSuite::new(StressRunner::new(sink.clone()), sink)
    }

    fn small(kind: WorkloadKind, name: &str) -> WorkloadConfig {
        let mut config = WorkloadConfig::new(kind, Duration::from_secs(30))
            .with_threads(1)
            .with_intensity(1)
            .with_name(name);
        config.memory_block_size = 64 * 1024;
        config
    }

    #[test]
    fn test_run_all_in_order_with_global_duration() {
        let suite = suite();
        suite.add_test(small(WorkloadKind::Cpu, "first"));
        suite.add_test(small(WorkloadKind::Memory, "second"));
        suite.set_global_duration(Duration::from_millis(150));
        suite.set_global_intensity(2);

        let started = Instant::now();
        let results = suite.run_all();
        assert!(started.elapsed() < Duration::from_secs(10));

        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(results.iter().all(|r| r.status == RunStatus::Completed));
        assert_eq!(suite.result("second").unwrap().kind, WorkloadKind::Memory);
        assert_eq!(suite.results().len(), 2);
    }

    #[test]
    fn test_unknown_test_rejected() {
        let suite = suite();
        assert!(matches!(suite.run_test("missing"), Err(HwStressError::InvalidConfig { .. })));
        assert!(suite
            .set_test_config("missing", small(WorkloadKind::Cpu, "missing"))
            .is_err());
    }

    #[test]
    fn test_stop_all_skips_remaining() {
        let suite = Arc::new(suite());
        suite.add_test(small(WorkloadKind::Cpu, "long one"));
        suite.add_test(small(WorkloadKind::Cpu, "never runs"));

        let remote = Arc::clone(&suite);
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            remote.stop_all();
        });

        let results = suite.run_all();
        stopper.join().unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, RunStatus::Interrupted);
        assert!(suite.result("never runs").is_none());
        assert!(!suite.is_any_running());
    }

    #[test]
    fn test_stop_from_started_handler_reports_interrupted() {
        let suite = Arc::new(suite());
        suite.add_test(small(WorkloadKind::Cpu, "stopped at start"));
        suite.add_test(small(WorkloadKind::Cpu, "skipped"));
        let handle = Arc::downgrade(&suite);
        suite.runner().on_started(move |_| {
            if let Some(suite) = handle.upgrade() {
                suite.stop_all();
            }
        });

        let started = Instant::now();
        let results = suite.run_all();
        assert!(started.elapsed() < Duration::from_secs(10));

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "stopped at start");
        assert_eq!(results[0].status, RunStatus::Interrupted);
        assert!(suite.result("skipped").is_none());
    }

    #[test]
    fn test_stop_requested_before_start_is_honoured() {
        let suite = suite();
        suite.add_test(small(WorkloadKind::Cpu, "late stop"));
        suite.stop_requested.store(true, Ordering::SeqCst);

        let started = Instant::now();
        let result = suite.run_one("late stop").unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.status, RunStatus::Interrupted);
        assert!(!suite.is_any_running());

        suite.set_global_duration(Duration::from_millis(150));
        let rerun = suite.run_test("late stop").unwrap();
        assert_eq!(rerun.status, RunStatus::Completed);
    }
}
