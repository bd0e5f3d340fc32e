// hwstress-core/src/fault/mod.rs
// Fault registry: pending queue, active set, history and auto-recovery

pub mod activators;
pub mod history;

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

use crate::cancel::TaskGroup;
use crate::config::RegistryConfig;
use crate::error::{ErrorCategory, HwStressError, Result};
use crate::logging::{LogLevel, LogSink};
use crate::model::{FaultId, FaultKind, FaultRecord, FaultSpec, Severity};

use activators::{ActivationContext, FaultResource};
use history::FaultHistory;

pub type FaultCallback = Arc<dyn Fn(&FaultRecord) + Send + Sync>;

struct ActiveFault {
    record: FaultRecord,
    activated_at: Instant,
    resource: FaultResource,
}

struct RegistryState {
    active: HashMap<FaultId, ActiveFault>,
    /// (kind, target) pairs whose activation is in flight
    reserved: HashSet<(FaultKind, String)>,
    pending: Vec<FaultSpec>,
    history: FaultHistory,
    /// Bumped by every clear_all so in-flight injections can tell
    generation: u64,
    /// Set by shutdown; nothing is activated afterwards
    closed: bool,
}

impl RegistryState {
    fn occupied(&self, kind: FaultKind, target: &str) -> bool {
        self.reserved.contains(&(kind, target.to_string()))
            || self
                .active
                .values()
                .any(|a| a.record.kind == kind && a.record.target == target)
    }

    fn remember(&mut self, record: FaultRecord) {
        if !self.history.push(record) {
            return;
        }
        let evicted = self.history.evicted();
        let capacity = self.history.capacity() as u64;
        if evicted == 1 || evicted % capacity == 0 {
            debug!("Fault history full at {} record(s), {} evicted so far", capacity, evicted);
        }
    }
}

#[derive(Default)]
struct Callbacks {
    injected: Option<FaultCallback>,
    recovered: Option<FaultCallback>,
}

struct Shared {
    config: RegistryConfig,
    state: Mutex<RegistryState>,
    /// Held while records are being torn down so clear_all waits for sweeps
    teardown: Mutex<()>,
    rng: Mutex<fastrand::Rng>,
    auto_recovery: AtomicBool,
    recovery_delay: Mutex<Duration>,
    callbacks: RwLock<Callbacks>,
    sink: Arc<dyn LogSink>,
    live_threads: Arc<AtomicUsize>,
}

/// Owns every injected fault from activation until retirement.
///
/// All state lives behind one lock; activation runs outside it with the
/// (kind, target) pair reserved, and the record plus its resources enter the
/// active set together. A background loop retires records older than the
/// recovery delay.
pub struct FaultRegistry {
    shared: Arc<Shared>,
    recovery: Mutex<Option<TaskGroup>>,
}

impl FaultRegistry {
    pub fn new(config: RegistryConfig, sink: Arc<dyn LogSink>) -> Result<Self> {
        config.validate()?;

        let rng = match config.rng_seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };

        let shared = Arc::new(Shared {
            state: Mutex::new(RegistryState {
                active: HashMap::new(),
                reserved: HashSet::new(),
                pending: Vec::new(),
                history: FaultHistory::new(config.history_capacity),
                generation: 0,
                closed: false,
            }),
            teardown: Mutex::new(()),
            rng: Mutex::new(rng),
            auto_recovery: AtomicBool::new(config.auto_recovery),
            recovery_delay: Mutex::new(config.recovery_delay),
            callbacks: RwLock::new(Callbacks::default()),
            sink,
            live_threads: Arc::new(AtomicUsize::new(0)),
            config,
        });

        let mut recovery = TaskGroup::new("fault-recovery", Arc::new(AtomicUsize::new(0)));
        let loop_shared = Arc::clone(&shared);
        let tick = shared.config.recovery_tick;
        recovery.spawn(move |token| {
            while !token.wait_timeout(tick) {
                loop_shared.recover_expired();
            }
        })?;

        shared.sink.log(
            LogLevel::Info,
            &format!(
                "Fault registry started (recovery delay {:?}, tick {:?})",
                shared.config.recovery_delay, tick
            ),
        );

        Ok(Self {
            shared,
            recovery: Mutex::new(Some(recovery)),
        })
    }

    /// Roll the spec's probability and, on a hit, activate it.
    /// Returns whether the fault is now in effect.
    #[instrument(level = "debug", skip_all, fields(kind = %spec.kind, target = %spec.target))]
    pub fn inject(&self, spec: FaultSpec) -> bool {
        if let Err(e) = validate_spec(&spec) {
            self.shared.sink.log(LogLevel::Warning, &format!("Rejected fault spec: {}", e));
            return false;
        }
        if !self.shared.roll(spec.probability) {
            debug!("Probability {} roll missed", spec.probability);
            return false;
        }
        self.shared.inject_now(&spec)
    }

    /// Deterministic injection with the default spec for `kind`
    pub fn inject_kind(&self, kind: FaultKind, target: &str, severity: Severity) -> bool {
        self.inject(FaultSpec::new(kind, target, severity))
    }

    /// Queue a spec for the next `drain_queue`. Dropped once shut down.
    pub fn enqueue(&self, spec: FaultSpec) {
        let mut state = self.shared.state.lock();
        if state.closed {
            drop(state);
            self.shared.sink.log(
                LogLevel::Warning,
                &format!("Dropped queued fault {} on '{}': {}", spec.kind, spec.target, HwStressError::RegistryClosed),
            );
            return;
        }
        state.pending.push(spec);
        debug!("Queued fault spec ({} pending)", state.pending.len());
    }

    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Inject every queued spec, each rolled independently.
    /// Returns how many took effect.
    pub fn drain_queue(&self) -> usize {
        let batch = std::mem::take(&mut self.shared.state.lock().pending);
        let total = batch.len();
        let injected = batch.into_iter().filter(|spec| self.inject(spec.clone())).count();
        self.shared.sink.log(
            LogLevel::Info,
            &format!("Drained fault queue: {}/{} injected", injected, total),
        );
        injected
    }

    /// Drop the queue and tear down every active fault, joining all fault threads
    pub fn clear_all(&self) {
        self.shared.clear_all();
    }

    /// Retire one active fault ahead of its recovery delay
    pub fn recover(&self, id: FaultId) -> bool {
        let retired = {
            let _teardown = self.shared.teardown.lock();
            let fault = self.shared.state.lock().active.remove(&id);
            fault.map(|fault| self.shared.retire(fault, "recovered on request"))
        };
        match retired {
            Some((record, _)) => {
                self.shared.fire_recovered(&record);
                true
            }
            None => false,
        }
    }

    /// True if any fault kind is active on `target`
    pub fn is_active(&self, target: &str) -> bool {
        self.shared
            .state
            .lock()
            .active
            .values()
            .any(|a| a.record.target == target)
    }

    pub fn active_faults(&self) -> Vec<FaultRecord> {
        let state = self.shared.state.lock();
        let mut records: Vec<FaultRecord> = state.active.values().map(|a| a.record.clone()).collect();
        records.sort_by_key(|r| r.injection_time);
        records
    }

    /// Copy of the history in insertion order
    pub fn history(&self) -> Vec<FaultRecord> {
        self.shared.state.lock().history.snapshot()
    }

    /// Records dropped off the front of the history since creation
    pub fn history_evicted(&self) -> u64 {
        self.shared.state.lock().history.evicted()
    }

    pub fn export_history_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.history())?)
    }

    /// Fault-owned threads currently alive
    pub fn live_fault_threads(&self) -> usize {
        self.shared.live_threads.load(Ordering::SeqCst)
    }

    pub fn set_auto_recovery(&self, enabled: bool) {
        self.shared.auto_recovery.store(enabled, Ordering::SeqCst);
        self.shared.sink.log(
            LogLevel::Info,
            &format!("Auto-recovery {}", if enabled { "enabled" } else { "disabled" }),
        );
    }

    pub fn set_recovery_delay(&self, delay: Duration) {
        *self.shared.recovery_delay.lock() = delay;
    }

    pub fn recovery_delay(&self) -> Duration {
        *self.shared.recovery_delay.lock()
    }

    /// Called on the injecting thread for every attempt that reached activation,
    /// including ones rejected as duplicates or after shutdown. No registry
    /// lock is held, so handlers may call back into the registry.
    pub fn on_injected<F>(&self, callback: F)
    where
        F: Fn(&FaultRecord) + Send + Sync + 'static,
    {
        self.shared.callbacks.write().injected = Some(Arc::new(callback));
    }

    /// Called on the retiring thread after a fault's resources are released,
    /// with no registry lock held. That is often the auto-recovery thread,
    /// which `shutdown` joins, so handlers must not call `shutdown`.
    pub fn on_recovered<F>(&self, callback: F)
    where
        F: Fn(&FaultRecord) + Send + Sync + 'static,
    {
        self.shared.callbacks.write().recovered = Some(Arc::new(callback));
    }

    /// Stop the recovery loop, clear everything and refuse further
    /// injections. Idempotent.
    pub fn shutdown(&self) {
        let recovery = self.recovery.lock().take();
        if let Some(mut recovery) = recovery {
            self.shared.state.lock().closed = true;
            recovery.shutdown();
            self.shared.clear_all();
            self.shared.sink.log(LogLevel::Info, "Fault registry stopped");
        }
    }
}

impl Drop for FaultRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn validate_spec(spec: &FaultSpec) -> Result<()> {
    if spec.target.trim().is_empty() {
        return Err(HwStressError::spec("target must not be empty"));
    }
    if !(0.0..=1.0).contains(&spec.probability) {
        return Err(HwStressError::spec(format!(
            "probability {} outside [0, 1]",
            spec.probability
        )));
    }
    Ok(())
}

impl Shared {
    fn roll(&self, probability: f64) -> bool {
        if probability >= 1.0 {
            return true;
        }
        probability > 0.0 && self.rng.lock().f64() < probability
    }

    fn inject_now(&self, spec: &FaultSpec) -> bool {
        let mut record = FaultRecord::from_spec(spec);
        let key = (spec.kind, spec.target.clone());

        let generation = {
            let mut state = self.state.lock();
            let rejection = if state.closed {
                Some(HwStressError::RegistryClosed)
            } else if state.occupied(spec.kind, &spec.target) {
                Some(HwStressError::DuplicateActive {
                    kind: spec.kind,
                    target: spec.target.clone(),
                })
            } else {
                None
            };
            if let Some(err) = rejection {
                record = record.failed(err.to_string());
                state.remember(record.clone());
                drop(state);
                self.sink.log(LogLevel::Warning, &format!("Injection rejected: {}", err));
                self.fire_injected(&record);
                return false;
            }
            state.reserved.insert(key.clone());
            state.generation
        };

        let ctx = ActivationContext {
            id: record.id,
            config: &self.config,
            rng: self.rng.lock().fork(),
            live_threads: &self.live_threads,
        };
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| activators::activate(spec, ctx)))
            .unwrap_or_else(|_| Err(HwStressError::spec(format!("{} activator panicked", spec.kind))));
        record.observed = started.elapsed();

        let mut state = self.state.lock();
        state.reserved.remove(&key);

        let resource = match outcome {
            Ok(resource) if state.generation == generation => resource,
            Ok(resource) => {
                // clear_all ran while we were activating
                drop(state);
                if let Err(e) = resource.release() {
                    self.sink.log(LogLevel::Error, &format!("Cleanup after cleared injection: {}", e));
                }
                record = record.failed("cleared during injection");
                self.state.lock().remember(record.clone());
                self.sink.log(
                    LogLevel::Warning,
                    &format!("Fault {} on '{}' cleared during injection", spec.kind, spec.target),
                );
                self.fire_injected(&record);
                return false;
            }
            Err(e) => {
                record = record.failed(e.to_string());
                state.remember(record.clone());
                drop(state);
                let level = match e.category() {
                    ErrorCategory::Warning => LogLevel::Warning,
                    _ => LogLevel::Error,
                };
                self.sink.log(
                    level,
                    &format!("Fault {} on '{}' failed: {}", spec.kind, spec.target, e),
                );
                self.fire_injected(&record);
                return false;
            }
        };

        record.success = true;
        let description = resource.describe();
        state.remember(record.clone());
        state.active.insert(
            record.id,
            ActiveFault {
                record: record.clone(),
                activated_at: Instant::now(),
                resource,
            },
        );
        drop(state);

        self.sink.log(
            LogLevel::Info,
            &format!(
                "Fault injected: {} ({}) on '{}' holding {}",
                spec.kind, spec.severity, spec.target, description
            ),
        );
        self.fire_injected(&record);
        true
    }

    fn recover_expired(&self) -> usize {
        if !self.auto_recovery.load(Ordering::SeqCst) {
            return 0;
        }
        let delay = *self.recovery_delay.lock();

        let teardown = self.teardown.lock();
        let expired: Vec<ActiveFault> = {
            let mut state = self.state.lock();
            let ids: Vec<FaultId> = state
                .active
                .iter()
                .filter(|(_, a)| a.record.auto_recover && a.activated_at.elapsed() > delay)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| state.active.remove(id)).collect()
        };

        let retired: Vec<FaultRecord> = expired
            .into_iter()
            .map(|fault| self.retire(fault, "auto-recovered").0)
            .collect();
        drop(teardown);

        for record in &retired {
            self.fire_recovered(record);
        }
        retired.len()
    }

    fn clear_all(&self) {
        let teardown = self.teardown.lock();
        let (drained, dropped) = {
            let mut state = self.state.lock();
            state.generation += 1;
            let dropped = state.pending.len();
            state.pending.clear();
            let drained: Vec<ActiveFault> = state.active.drain().map(|(_, fault)| fault).collect();
            (drained, dropped)
        };

        let total = drained.len();
        let mut retired = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for fault in drained {
            let (record, failure) = self.retire(fault, "cleared");
            retired.push(record);
            failures.extend(failure);
        }
        drop(teardown);

        if failures.is_empty() {
            self.sink.log(
                LogLevel::Info,
                &format!("Cleared {} active fault(s), dropped {} pending", total, dropped),
            );
        } else {
            let err = HwStressError::Cleanup { failures };
            self.sink.log(LogLevel::Error, &format!("Clear finished with errors: {}", err));
        }

        for record in &retired {
            self.fire_recovered(record);
        }
    }

    /// Release one record's resources. Returns the final record for
    /// on_recovered, which the caller fires once `teardown` is released,
    /// and the cleanup failure, if any.
    fn retire(&self, fault: ActiveFault, reason: &str) -> (FaultRecord, Option<String>) {
        let ActiveFault {
            mut record,
            activated_at,
            resource,
        } = fault;

        let description = resource.describe();
        let cleanup = resource.release();
        record.observed = activated_at.elapsed();

        let failure = match cleanup {
            Ok(()) => {
                self.sink.log(
                    LogLevel::Info,
                    &format!(
                        "Fault {} on '{}' {} after {:.1}s ({} released)",
                        record.kind,
                        record.target,
                        reason,
                        record.observed.as_secs_f64(),
                        description
                    ),
                );
                None
            }
            Err(e) => {
                let message = format!("{} on '{}': {}", record.kind, record.target, e);
                self.sink.log(LogLevel::Error, &format!("Fault cleanup failed: {}", message));
                Some(message)
            }
        };

        (record, failure)
    }

    fn fire_injected(&self, record: &FaultRecord) {
        let callback = self.callbacks.read().injected.clone();
        if let Some(callback) = callback {
            callback(record);
        }
    }

    fn fire_recovered(&self, record: &FaultRecord) {
        let callback = self.callbacks.read().recovered.clone();
        if let Some(callback) = callback {
            callback(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::capture::CaptureSink;

    fn quick_config() -> RegistryConfig {
        RegistryConfig {
            recovery_delay: Duration::from_secs(60),
            recovery_tick: Duration::from_millis(50),
            rng_seed: Some(42),
            ..Default::default()
        }
    }

    #[test]
    fn test_invalid_specs_rejected_without_history() {
        let sink = Arc::new(CaptureSink::default());
        let registry = FaultRegistry::new(quick_config(), sink.clone()).unwrap();

        assert!(!registry.inject(FaultSpec::new(FaultKind::TimingAnomaly, "  ", Severity::Low)));
        assert!(!registry.inject(
            FaultSpec::new(FaultKind::TimingAnomaly, "clock", Severity::Low).with_probability(1.5)
        ));
        assert!(!registry.inject(
            FaultSpec::new(FaultKind::TimingAnomaly, "clock", Severity::Low).with_probability(f64::NAN)
        ));
        assert!(registry.history().is_empty());
        assert!(sink.contains(LogLevel::Warning, "Rejected fault spec"));
    }

    #[test]
    fn test_fractional_probability_is_seeded() {
        let run = || {
            let registry = FaultRegistry::new(quick_config(), Arc::new(CaptureSink::default())).unwrap();
            (0..20)
                .map(|i| {
                    let spec = FaultSpec::new(FaultKind::MemoryCorruption, format!("t{}", i), Severity::Low)
                        .with_probability(0.5);
                    registry.inject(spec)
                })
                .collect::<Vec<bool>>()
        };
        let first = run();
        assert_eq!(first, run());
        assert!(first.iter().any(|hit| *hit));
        assert!(first.iter().any(|hit| !*hit));
    }

    #[test]
    fn test_process_kill_reported_as_simulated() {
        let registry = FaultRegistry::new(quick_config(), Arc::new(CaptureSink::default())).unwrap();
        assert!(!registry.inject_kind(FaultKind::ProcessKill, "4242", Severity::Critical));

        let history = registry.history();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
        assert!(history[0].error_message.as_deref().unwrap().contains("simulated only"));
        assert!(!registry.is_active("4242"));
    }

    #[test]
    fn test_recover_by_id() {
        let registry = FaultRegistry::new(quick_config(), Arc::new(CaptureSink::default())).unwrap();
        assert!(registry.inject_kind(FaultKind::TimingAnomaly, "clock", Severity::Low));
        let id = registry.active_faults()[0].id;

        assert!(registry.recover(id));
        assert!(!registry.recover(id));
        assert!(!registry.is_active("clock"));
        assert_eq!(registry.live_fault_threads(), 0);
    }

    #[test]
    fn test_disabled_auto_recovery_keeps_faults() {
        let config = RegistryConfig {
            recovery_delay: Duration::from_millis(50),
            ..quick_config()
        };
        let registry = FaultRegistry::new(config, Arc::new(CaptureSink::default())).unwrap();
        registry.set_auto_recovery(false);
        assert!(registry.inject_kind(FaultKind::MemoryCorruption, "heap", Severity::Low));

        std::thread::sleep(Duration::from_millis(300));
        assert!(registry.is_active("heap"));

        registry.set_auto_recovery(true);
        std::thread::sleep(Duration::from_millis(300));
        assert!(!registry.is_active("heap"));
    }

    #[test]
    fn test_pinned_fault_skips_sweep() {
        let config = RegistryConfig {
            recovery_delay: Duration::from_millis(50),
            ..quick_config()
        };
        let registry = FaultRegistry::new(config, Arc::new(CaptureSink::default())).unwrap();
        let spec = FaultSpec::new(FaultKind::CpuOverload, "core", Severity::Low).with_auto_recover(false);
        assert!(registry.inject(spec));

        std::thread::sleep(Duration::from_millis(300));
        assert!(registry.is_active("core"));

        registry.clear_all();
        assert!(!registry.is_active("core"));
        assert_eq!(registry.live_fault_threads(), 0);
    }

    #[test]
    fn test_history_export_is_json_array() {
        let registry = FaultRegistry::new(quick_config(), Arc::new(CaptureSink::default())).unwrap();
        registry.inject_kind(FaultKind::MemoryCorruption, "heap", Severity::Low);

        let json = registry.export_history_json().unwrap();
        let parsed: Vec<FaultRecord> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].target, "heap");
        assert!(parsed[0].success);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let registry = FaultRegistry::new(quick_config(), Arc::new(CaptureSink::default())).unwrap();
        registry.inject_kind(FaultKind::CpuOverload, "core", Severity::Low);
        registry.shutdown();
        registry.shutdown();
        assert_eq!(registry.live_fault_threads(), 0);
    }

    #[test]
    fn test_recovered_handler_can_call_back_in() {
        let registry = Arc::new(FaultRegistry::new(quick_config(), Arc::new(CaptureSink::default())).unwrap());
        let handle = Arc::downgrade(&registry);
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = Mutex::new(tx);
        registry.on_recovered(move |record| {
            if let Some(registry) = handle.upgrade() {
                let still_active = registry.is_active(&record.target);
                let recovered_again = registry.recover(record.id);
                let _ = tx.lock().send((still_active, recovered_again));
            }
        });

        assert!(registry.inject_kind(FaultKind::TimingAnomaly, "clock", Severity::Low));
        let id = registry.active_faults()[0].id;
        let remote = Arc::clone(&registry);
        let recoverer = std::thread::spawn(move || remote.recover(id));

        let (still_active, recovered_again) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!still_active);
        assert!(!recovered_again);
        assert!(recoverer.join().unwrap());
        assert_eq!(registry.live_fault_threads(), 0);
    }
}
