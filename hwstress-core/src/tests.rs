// hwstress-core/src/tests.rs
// Lifecycle tests across the registry, activators and the stress runner

use parking_lot::Mutex;
use proptest::prelude::*;
use std::fs::OpenOptions;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::{RegistryConfig, WorkloadConfig};
use crate::fault::FaultRegistry;
use crate::logging::capture::CaptureSink;
use crate::logging::LogLevel;
use crate::model::{FaultKind, FaultRecord, FaultSpec, RunStatus, Severity, WorkloadKind};
use crate::stress::payload::DiskPayload;
use crate::stress::pool::WorkCounters;
use crate::stress::StressRunner;

fn test_config() -> RegistryConfig {
    RegistryConfig {
        recovery_delay: Duration::from_secs(1),
        recovery_tick: Duration::from_millis(100),
        rng_seed: Some(7),
        ..Default::default()
    }
}

fn registry_with(config: RegistryConfig) -> (FaultRegistry, Arc<CaptureSink>) {
    let sink = Arc::new(CaptureSink::default());
    let registry = FaultRegistry::new(config, sink.clone()).unwrap();
    (registry, sink)
}

fn registry() -> (FaultRegistry, Arc<CaptureSink>) {
    registry_with(test_config())
}

#[test]
fn test_certain_probability_always_activates() {
    let (registry, _) = registry();
    let kinds = [
        FaultKind::MemoryCorruption,
        FaultKind::CpuOverload,
        FaultKind::NetworkPacketLoss,
        FaultKind::TimingAnomaly,
        FaultKind::SystemCallFailure,
    ];
    for (i, kind) in kinds.iter().enumerate() {
        let target = format!("target-{}", i);
        assert!(registry.inject(FaultSpec::new(*kind, target.as_str(), Severity::Low)));
        assert!(registry.is_active(&target));
    }
    assert_eq!(registry.active_faults().len(), kinds.len());
    registry.clear_all();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_zero_probability_never_activates(
        kind_index in 0usize..FaultKind::ALL.len(),
        severity_index in 0usize..4,
        target in "[a-z]{1,12}",
    ) {
        let severity = [Severity::Low, Severity::Medium, Severity::High, Severity::Critical][severity_index];
        let (registry, _) = registry();
        let spec = FaultSpec::new(FaultKind::ALL[kind_index], target.as_str(), severity)
            .with_probability(0.0);

        prop_assert!(!registry.inject(spec));
        prop_assert!(!registry.is_active(&target));
        prop_assert!(registry.history().is_empty());
        prop_assert_eq!(registry.live_fault_threads(), 0);
    }
}

#[test]
fn test_duplicate_injection_rejected() {
    let (registry, sink) = registry();
    let failures = Arc::new(Mutex::new(Vec::<FaultRecord>::new()));
    let seen = Arc::clone(&failures);
    registry.on_injected(move |record| {
        if !record.success {
            seen.lock().push(record.clone());
        }
    });

    assert!(registry.inject_kind(FaultKind::CpuOverload, "core0", Severity::Low));
    assert!(!registry.inject_kind(FaultKind::CpuOverload, "core0", Severity::High));

    let active: Vec<FaultRecord> = registry
        .active_faults()
        .into_iter()
        .filter(|r| r.kind == FaultKind::CpuOverload && r.target == "core0")
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].severity, Severity::Low);
    assert_eq!(registry.live_fault_threads(), 1);

    let failures = failures.lock();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].error_message.as_deref().unwrap().contains("already active"));
    assert!(sink.contains(LogLevel::Warning, "already active"));

    // Same target, different kind is a separate fault
    assert!(registry.inject_kind(FaultKind::TimingAnomaly, "core0", Severity::Low));
    registry.clear_all();
}

#[test]
fn test_auto_recovery_fires_once() {
    let (registry, sink) = registry();
    let recovered = Arc::new(Mutex::new(Vec::<FaultRecord>::new()));
    let seen = Arc::clone(&recovered);
    registry.on_recovered(move |record| seen.lock().push(record.clone()));

    assert!(registry.inject_kind(FaultKind::MemoryCorruption, "heap", Severity::Medium));
    let injected = registry.active_faults()[0].clone();
    assert!(registry.is_active("heap"));

    thread::sleep(Duration::from_secs(2));

    assert!(!registry.is_active("heap"));
    let recovered = recovered.lock();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].id, injected.id);
    assert_eq!(recovered[0].kind, FaultKind::MemoryCorruption);
    assert_eq!(recovered[0].target, "heap");
    assert!(recovered[0].observed >= Duration::from_secs(1));
    assert!(sink.contains(LogLevel::Info, "auto-recovered"));
}

#[test]
fn test_history_evicts_oldest_first() {
    let capacity = 5;
    let (registry, _) = registry_with(RegistryConfig {
        history_capacity: capacity,
        ..test_config()
    });

    for i in 0..=capacity {
        assert!(registry.inject_kind(FaultKind::MemoryCorruption, &format!("fault-{}", i), Severity::Low));
    }

    let history = registry.history();
    assert_eq!(history.len(), capacity);
    assert!(history.iter().all(|r| r.target != "fault-0"));
    assert_eq!(history[0].target, "fault-1");
    assert_eq!(history[capacity - 1].target, format!("fault-{}", capacity));
    assert_eq!(registry.history_evicted(), 1);
}

#[test]
fn test_stop_records_completed_operations() {
    let runner = StressRunner::new(Arc::new(CaptureSink::default()));
    let config = WorkloadConfig::new(WorkloadKind::Cpu, Duration::from_secs(1)).with_threads(1);
    runner.start(config).unwrap();
    assert!(runner.is_running());

    runner.stop();

    assert!(!runner.is_running());
    let result = runner.get_result();
    assert!(result.operations_completed > 0);
    assert_eq!(result.workers, 1);
    assert!(result.status.is_terminal());
    assert_eq!(runner.live_worker_threads(), 0);
}

#[test]
fn test_disk_truncation_counts_one_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut payload = DiskPayload::new(dir.path(), 0, 8192, fastrand::Rng::with_seed(21)).unwrap();
    let counters = WorkCounters::default();

    payload.write_block().unwrap();
    counters.record(payload.verify_block());
    assert_eq!(counters.errors(), 0);

    payload.write_block().unwrap();
    let file = OpenOptions::new().write(true).open(payload.path()).unwrap();
    file.set_len(4096).unwrap();
    drop(file);
    counters.record(payload.verify_block());

    assert_eq!(counters.operations(), 2);
    assert_eq!(counters.errors(), 1);
}

#[test]
fn test_clear_all_joins_cpu_threads() {
    let (registry, _) = registry();
    let baseline = registry.live_fault_threads();

    assert!(registry.inject_kind(FaultKind::CpuOverload, "cores", Severity::High));
    assert_eq!(registry.live_fault_threads(), baseline + Severity::High.thread_count());

    registry.clear_all();

    assert_eq!(registry.live_fault_threads(), baseline);
    assert!(!registry.is_active("cores"));
    assert!(registry.active_faults().is_empty());
}

#[test]
fn test_activation_failure_surfaces_in_record() {
    let scratch = tempfile::NamedTempFile::new().unwrap();
    let (registry, _) = registry_with(RegistryConfig {
        scratch_dir: scratch.path().join("nested"),
        ..test_config()
    });
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&outcomes);
    registry.on_injected(move |record| seen.lock().push(record.success));

    assert!(!registry.inject_kind(FaultKind::DiskIOError, "volume", Severity::Low));

    assert_eq!(*outcomes.lock(), vec![false]);
    let history = registry.history();
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
    assert!(history[0].error_message.is_some());
    assert!(!registry.is_active("volume"));
}

#[test]
fn test_drain_queue_rolls_each_spec() {
    let (registry, _) = registry();
    registry.enqueue(FaultSpec::new(FaultKind::TimingAnomaly, "a", Severity::Low));
    registry.enqueue(FaultSpec::new(FaultKind::TimingAnomaly, "b", Severity::Low).with_probability(0.0));
    registry.enqueue(FaultSpec::new(FaultKind::MemoryCorruption, "c", Severity::Low));
    assert_eq!(registry.pending_len(), 3);

    assert_eq!(registry.drain_queue(), 2);
    assert_eq!(registry.pending_len(), 0);
    assert!(registry.is_active("a"));
    assert!(!registry.is_active("b"));
    assert!(registry.is_active("c"));
}

#[test]
fn test_clear_all_drops_pending() {
    let (registry, _) = registry();
    registry.enqueue(FaultSpec::new(FaultKind::TimingAnomaly, "later", Severity::Low));
    registry.clear_all();
    assert_eq!(registry.pending_len(), 0);
    assert_eq!(registry.drain_queue(), 0);
}

#[test]
fn test_clear_all_racing_injections_leaves_no_threads() {
    let (registry, _) = registry();
    let registry = Arc::new(registry);
    let injected = Arc::new(AtomicUsize::new(0));

    let injectors: Vec<_> = (0..4)
        .map(|t| {
            let registry = Arc::clone(&registry);
            let injected = Arc::clone(&injected);
            thread::spawn(move || {
                for i in 0..10 {
                    let target = format!("t{}-{}", t, i);
                    if registry.inject_kind(FaultKind::CpuOverload, &target, Severity::Low) {
                        injected.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();

    for _ in 0..5 {
        registry.clear_all();
        thread::sleep(Duration::from_millis(5));
    }
    for handle in injectors {
        handle.join().unwrap();
    }
    registry.clear_all();

    assert!(registry.active_faults().is_empty());
    assert_eq!(registry.live_fault_threads(), 0);
    assert_eq!(registry.history().len(), 40);
}

#[test]
fn test_disk_run_completes_cleanly() {
    let runner = StressRunner::new(Arc::new(CaptureSink::default()));
    let dir = tempfile::tempdir().unwrap();
    let mut config = WorkloadConfig::new(WorkloadKind::Disk, Duration::from_millis(300)).with_threads(1);
    config.disk_path = dir.path().to_path_buf();
    config.disk_block_size = 4096;

    runner.start(config).unwrap();
    let result = runner.wait().unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert!(result.test_passed);
    assert!(result.operations_completed > 0);
}

#[test]
fn test_concurrent_disk_runs_share_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let runners: Vec<StressRunner> = (0..2)
        .map(|seed| StressRunner::new(Arc::new(CaptureSink::default())).with_seed(seed))
        .collect();

    for runner in &runners {
        let mut config = WorkloadConfig::new(WorkloadKind::Disk, Duration::from_millis(500)).with_threads(1);
        config.disk_path = dir.path().to_path_buf();
        config.disk_block_size = 4096;
        runner.start(config).unwrap();
    }

    for runner in &runners {
        let result = runner.wait().unwrap();
        assert_eq!(result.errors_encountered, 0, "{:?}", result.error_message);
        assert_eq!(result.status, RunStatus::Completed);
        assert!(result.operations_completed > 0);
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_shutdown_registry_refuses_new_faults() {
    let scratch = tempfile::tempdir().unwrap();
    let (registry, sink) = registry_with(RegistryConfig {
        scratch_dir: scratch.path().to_path_buf(),
        ..test_config()
    });
    registry.shutdown();

    assert!(!registry.inject_kind(FaultKind::DiskIOError, "volume", Severity::Low));
    assert!(!registry.is_active("volume"));
    let history = registry.history();
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
    assert_eq!(history[0].error_message.as_deref(), Some("Fault registry is shut down"));

    registry.enqueue(FaultSpec::new(FaultKind::TimingAnomaly, "clock", Severity::Low));
    assert_eq!(registry.pending_len(), 0);
    assert_eq!(registry.drain_queue(), 0);
    assert!(sink.contains(LogLevel::Warning, "Dropped queued fault"));

    drop(registry);
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
}
