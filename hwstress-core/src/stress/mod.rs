// hwstress-core/src/stress/mod.rs
// Stress run lifecycle: start, progress, stop/wait and result finalization

pub mod payload;
pub mod pool;
pub mod suite;

use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::cancel::{CancellationToken, TaskGroup};
use crate::config::WorkloadConfig;
use crate::error::{HwStressError, Result};
use crate::logging::{LogLevel, LogSink};
use crate::metrics::{MetricsSource, SystemMetrics};
use crate::model::{RunResult, RunStatus, WorkloadKind};

use pool::{ProgressCallback, ProgressTracker, WorkerPool};

/// Extra time past the configured duration before workers are given up on
pub const WAIT_GRACE: Duration = Duration::from_secs(2);

/// Bounded per-run metrics history
pub const METRICS_HISTORY_LIMIT: usize = 600;

pub type StartedCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type CompleteCallback = Arc<dyn Fn(&RunResult) + Send + Sync>;

#[derive(Default)]
struct RunnerCallbacks {
    started: Option<StartedCallback>,
    progress: Option<ProgressCallback>,
    complete: Option<CompleteCallback>,
}

#[derive(Default)]
struct MetricsLog {
    peak: Option<SystemMetrics>,
    history: VecDeque<SystemMetrics>,
}

impl MetricsLog {
    fn push(&mut self, sample: SystemMetrics) {
        self.peak = Some(match &self.peak {
            Some(peak) => peak.peak(&sample),
            None => sample.clone(),
        });
        if self.history.len() >= METRICS_HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(sample);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Stopped,
    Natural,
    TimedOut,
}

/// Block until every worker has exited or `deadline` passes
fn wait_for_workers(finished: &CancellationToken, deadline: Instant) -> Finish {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if finished.wait_timeout(remaining) {
        Finish::Natural
    } else {
        Finish::TimedOut
    }
}

struct ActiveRun {
    id: u64,
    workers: usize,
    config: WorkloadConfig,
    name: String,
    started: Instant,
    pool: WorkerPool,
    sampler: Option<TaskGroup>,
    metrics: Option<Arc<dyn MetricsSource>>,
    baseline: Option<SystemMetrics>,
    samples: Arc<Mutex<MetricsLog>>,
    /// Tripped once `on_complete` has returned for this run
    reported: CancellationToken,
}

impl ActiveRun {
    fn snapshot(&self) -> RunResult {
        let samples = self.samples.lock();
        RunResult {
            status: RunStatus::Running,
            duration: self.started.elapsed(),
            workers: self.workers,
            operations_completed: self.pool.counters().operations(),
            errors_encountered: self.pool.counters().errors(),
            test_passed: self.pool.counters().errors() == 0,
            baseline_metrics: self.baseline.clone(),
            peak_metrics: samples.peak.clone(),
            metrics_history: samples.history.iter().cloned().collect(),
            ..RunResult::pending(self.config.kind, self.name.clone())
        }
    }

    fn deadline(&self) -> Instant {
        self.started + self.config.duration + WAIT_GRACE
    }
}

struct RunnerState {
    active: Option<ActiveRun>,
    last: RunResult,
    next_id: u64,
}

struct RunnerInner {
    sink: Arc<dyn LogSink>,
    metrics: RwLock<Option<Arc<dyn MetricsSource>>>,
    /// Serializes start and finalization. Never held while user callbacks run.
    lifecycle: Mutex<()>,
    state: Mutex<RunnerState>,
    callbacks: RwLock<RunnerCallbacks>,
    rng: Mutex<fastrand::Rng>,
    live_threads: Arc<AtomicUsize>,
}

/// Runs one stress workload at a time on a pool of OS threads.
///
/// Workers only touch atomic counters. Each run gets a reaper thread that
/// finalizes it once the workers exit, so a run completes, and `on_complete`
/// fires, even when nobody calls `wait` or `stop`. Callbacks run on whichever
/// thread finalized or started the run, with no runner lock held, so they may
/// call back into the runner.
pub struct StressRunner {
    inner: Arc<RunnerInner>,
}

impl StressRunner {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                sink,
                metrics: RwLock::new(None),
                lifecycle: Mutex::new(()),
                state: Mutex::new(RunnerState {
                    active: None,
                    last: RunResult::pending(WorkloadKind::Cpu, "idle"),
                    next_id: 0,
                }),
                callbacks: RwLock::new(RunnerCallbacks::default()),
                rng: Mutex::new(fastrand::Rng::new()),
                live_threads: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    pub fn with_metrics(self, source: Arc<dyn MetricsSource>) -> Self {
        *self.inner.metrics.write() = Some(source);
        self
    }

    pub fn with_seed(self, seed: u64) -> Self {
        *self.inner.rng.lock() = fastrand::Rng::with_seed(seed);
        self
    }

    pub fn on_started<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().started = Some(Arc::new(callback));
    }

    /// Fractions in [0, 1], delivered in non-decreasing order from worker threads
    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().progress = Some(Arc::new(callback));
    }

    /// Fired exactly once per run on the thread that finalized it, which is
    /// the run's reaper unless `stop`, `wait` or `get_result` got there first
    pub fn on_complete<F>(&self, callback: F)
    where
        F: Fn(&RunResult) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().complete = Some(Arc::new(callback));
    }

    pub fn start(&self, config: WorkloadConfig) -> Result<()> {
        let inner = &*self.inner;
        let lifecycle = inner.lifecycle.lock();

        let leftover = {
            let mut state = inner.state.lock();
            let busy = state
                .active
                .as_ref()
                .map_or(false, |run| !run.pool.is_finished());
            if busy {
                drop(state);
                drop(lifecycle);
                inner.sink.log(
                    LogLevel::Warning,
                    &format!("Ignoring start of {}: a run is in progress", config.display_name()),
                );
                return Err(HwStressError::AlreadyRunning);
            }
            state.active.take()
        };
        // Previous run ended on its own and its reaper has not got to it yet
        let leftover = leftover.map(|run| inner.finalize(run, Finish::Natural));

        let started = self.inner.launch(config);
        drop(lifecycle);

        if let Some((result, reported)) = leftover {
            inner.report(&result, &reported);
        }
        let name = started?;
        let callback = inner.callbacks.read().started.clone();
        if let Some(callback) = callback {
            callback(&name);
        }
        Ok(())
    }

    /// Stop the active run and return its final result. No-op when idle.
    pub fn stop(&self) -> Option<RunResult> {
        let inner = &*self.inner;
        let lifecycle = inner.lifecycle.lock();
        let run = inner.state.lock().active.take();
        let (result, reported) = match run {
            Some(run) => inner.finalize(run, Finish::Stopped),
            None => {
                debug!("stop() with no active run");
                return None;
            }
        };
        drop(lifecycle);

        inner.report(&result, &reported);
        Some(result)
    }

    /// Block until the workers finish on their own and return the final
    /// result. Runs that overrun their duration by more than `WAIT_GRACE`
    /// are stopped and reported as timed out.
    pub fn wait(&self) -> Result<RunResult> {
        let (id, finished, reported, deadline) = {
            let state = self.inner.state.lock();
            let run = state.active.as_ref().ok_or(HwStressError::NotRunning)?;
            (run.id, run.pool.finished_token(), run.reported.clone(), run.deadline())
        };

        let finish = wait_for_workers(&finished, deadline);
        Ok(self.inner.conclude(id, finish, &reported))
    }

    /// True while workers of the active run are still executing
    pub fn is_running(&self) -> bool {
        self.inner
            .state
            .lock()
            .active
            .as_ref()
            .map_or(false, |run| !run.pool.is_finished())
    }

    /// In-progress snapshot, or the last finalized result. A run whose
    /// workers have already exited is finalized here rather than reported
    /// as still running.
    pub fn get_result(&self) -> RunResult {
        let finished = {
            let state = self.inner.state.lock();
            match &state.active {
                Some(run) if run.pool.is_finished() => Some((run.id, run.reported.clone())),
                Some(run) => return run.snapshot(),
                None => None,
            }
        };
        match finished {
            Some((id, reported)) => self.inner.conclude(id, Finish::Natural, &reported),
            None => {
                // A finalize in flight has taken the run but not stored it yet
                let _lifecycle = self.inner.lifecycle.lock();
                self.inner.state.lock().last.clone()
            }
        }
    }

    /// Threads currently owned by stress workers
    pub fn live_worker_threads(&self) -> usize {
        self.inner.live_threads.load(Ordering::SeqCst)
    }
}

impl RunnerInner {
    /// Validate `config`, spawn its workers, sampler and reaper, and make it
    /// the active run. Caller holds `lifecycle`.
    fn launch(self: &Arc<Self>, config: WorkloadConfig) -> Result<String> {
        config.validate()?;

        let hardware = num_cpus::get();
        let workers = config.resolve_workers(hardware);
        let name = config.display_name();
        let progress = Arc::new(ProgressTracker::new(self.callbacks.read().progress.clone()));

        let metrics = match (self.metrics.read().clone(), config.monitor_metrics) {
            (Some(source), true) => Some(source),
            _ => None,
        };
        let samples = Arc::new(Mutex::new(MetricsLog::default()));
        let baseline = metrics.as_ref().map(|source| source.current_metrics());

        let pool = {
            let mut rng = self.rng.lock();
            WorkerPool::spawn(&config, workers, progress, &mut rng, Arc::clone(&self.live_threads))
        };
        let mut pool = match pool {
            Ok(pool) => pool,
            Err(e) => {
                self.sink.log(LogLevel::Error, &format!("Failed to start {}: {}", name, e));
                return Err(e);
            }
        };

        let sampler = match spawn_sampler(metrics.clone(), &config, &samples) {
            Ok(sampler) => sampler,
            Err(e) => {
                pool.shutdown();
                self.sink.log(LogLevel::Error, &format!("Failed to start {}: {}", name, e));
                return Err(e);
            }
        };

        let mut state = self.state.lock();
        let mut run = ActiveRun {
            id: state.next_id,
            workers,
            config: config.clone(),
            name: name.clone(),
            started: Instant::now(),
            pool,
            sampler,
            metrics,
            baseline,
            samples,
            reported: CancellationToken::new(),
        };
        let reaper = spawn_reaper(
            Arc::downgrade(self),
            run.id,
            run.pool.finished_token(),
            run.reported.clone(),
            run.deadline(),
        );
        if let Err(e) = reaper {
            drop(state);
            run.pool.shutdown();
            if let Some(mut sampler) = run.sampler.take() {
                sampler.shutdown();
            }
            self.sink.log(LogLevel::Error, &format!("Failed to start {}: {}", name, e));
            return Err(e);
        }
        state.next_id += 1;
        state.active = Some(run);
        drop(state);

        self.sink.log(
            LogLevel::Info,
            &format!(
                "Started {} with {} worker(s) for {:?} at intensity {}",
                name, workers, config.duration, config.intensity
            ),
        );
        Ok(name)
    }

    /// Finalize run `id` if it is still the active one and fire `on_complete`.
    /// Whoever gets here first does the work. Later callers wait for its
    /// callback to return, then get the result it stored.
    fn conclude(&self, id: u64, finish: Finish, reported: &CancellationToken) -> RunResult {
        let lifecycle = self.lifecycle.lock();
        let run = {
            let mut state = self.state.lock();
            let same_run = state.active.as_ref().map_or(false, |run| run.id == id);
            if same_run {
                state.active.take()
            } else {
                None
            }
        };
        let run = match run {
            Some(run) => run,
            None => {
                let last = self.state.lock().last.clone();
                drop(lifecycle);
                if !reported.wait_timeout(WAIT_GRACE) {
                    debug!("on_complete for run {} still running", id);
                }
                return last;
            }
        };
        let (result, reported) = self.finalize(run, finish);
        drop(lifecycle);

        self.report(&result, &reported);
        result
    }

    /// Join workers, compute the final status and store it as `last`.
    /// Caller holds `lifecycle`.
    fn finalize(&self, mut run: ActiveRun, finish: Finish) -> (RunResult, CancellationToken) {
        let panicked = run.pool.shutdown() as u64;
        if let Some(mut sampler) = run.sampler.take() {
            sampler.shutdown();
        }
        let elapsed = run.started.elapsed();

        if let Some(source) = &run.metrics {
            run.samples.lock().push(source.current_metrics());
        }

        let mut result = run.snapshot();
        result.duration = elapsed;
        result.errors_encountered += panicked;
        result.test_passed = result.errors_encountered == 0;

        let interrupted = finish == Finish::Stopped && elapsed < run.config.duration;
        result.status = match finish {
            Finish::TimedOut => RunStatus::TimedOut,
            _ if interrupted => RunStatus::Interrupted,
            _ if !result.test_passed => RunStatus::Failed,
            _ => RunStatus::Completed,
        };
        result.error_message = match result.status {
            RunStatus::TimedOut => Some(format!(
                "workers still running {:?} past the configured duration",
                WAIT_GRACE
            )),
            _ if panicked > 0 => Some(format!("{} worker(s) panicked", panicked)),
            _ if result.errors_encountered > 0 => Some(format!(
                "{} verification error(s)",
                result.errors_encountered
            )),
            _ => None,
        };

        self.state.lock().last = result.clone();

        let level = match result.status {
            RunStatus::Completed | RunStatus::Interrupted => LogLevel::Info,
            _ => LogLevel::Error,
        };
        self.sink.log(
            level,
            &format!(
                "{} finished {:?} after {:.2}s: {} ops, {} errors",
                result.name,
                result.status,
                elapsed.as_secs_f64(),
                result.operations_completed,
                result.errors_encountered
            ),
        );
        (result, run.reported)
    }

    /// Fire `on_complete`, then release anyone waiting on it
    fn report(&self, result: &RunResult, reported: &CancellationToken) {
        let callback = self.callbacks.read().complete.clone();
        if let Some(callback) = callback {
            callback(result);
        }
        reported.cancel();
    }
}

fn spawn_sampler(
    source: Option<Arc<dyn MetricsSource>>,
    config: &WorkloadConfig,
    samples: &Arc<Mutex<MetricsLog>>,
) -> Result<Option<TaskGroup>> {
    let source = match source {
        Some(source) => source,
        None => return Ok(None),
    };

    let mut sampler = TaskGroup::new("metrics-sampler", Arc::new(AtomicUsize::new(0)));
    let samples = Arc::clone(samples);
    let interval = config.sample_interval;
    sampler.spawn(move |token| {
        while !token.wait_timeout(interval) {
            let sample = source.current_metrics();
            samples.lock().push(sample);
        }
    })?;
    Ok(Some(sampler))
}

/// Detached thread that finalizes run `id` once its workers exit. It only
/// holds a weak handle, so a dropped runner lets it exit quietly.
fn spawn_reaper(
    runner: Weak<RunnerInner>,
    id: u64,
    finished: CancellationToken,
    reported: CancellationToken,
    deadline: Instant,
) -> Result<()> {
    let name = format!("stress-reaper-{}", id);
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let finish = wait_for_workers(&finished, deadline);
            if let Some(runner) = runner.upgrade() {
                runner.conclude(id, finish, &reported);
            }
        })
        .map(drop)
        .map_err(|e| HwStressError::spawn(name, e))
}

impl Drop for StressRunner {
    fn drop(&mut self) {
        self.stop();
    }
}
