// hwstress-core/src/stress/pool.rs
// Worker pool running payloads until the duration elapses or the run is stopped

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::payload::{build_payload, WorkloadPayload};
use crate::cancel::{CancellationToken, TaskGroup};
use crate::config::WorkloadConfig;
use crate::error::Result;
use crate::model::WorkloadKind;

pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Shared operation and error counters, bumped by workers only
#[derive(Debug, Default)]
pub struct WorkCounters {
    operations: AtomicU64,
    errors: AtomicU64,
}

impl WorkCounters {
    /// Count one finished unit; a failed self-check also counts as an error
    pub fn record(&self, ok: bool) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Forwards the highest fraction seen so far, never a lower one
pub struct ProgressTracker {
    best: Mutex<f64>,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    pub fn new(callback: Option<ProgressCallback>) -> Self {
        Self {
            best: Mutex::new(0.0),
            callback,
        }
    }

    pub fn report(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        let mut best = self.best.lock();
        if fraction > *best {
            *best = fraction;
            if let Some(callback) = &self.callback {
                callback(fraction);
            }
        }
    }

    pub fn current(&self) -> f64 {
        *self.best.lock()
    }
}

/// Counts workers down; the last one out trips the `finished` token
struct ExitGuard {
    remaining: Arc<AtomicUsize>,
    finished: CancellationToken,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.finished.cancel();
        }
    }
}

pub struct WorkerPool {
    group: TaskGroup,
    counters: Arc<WorkCounters>,
    finished: CancellationToken,
}

impl WorkerPool {
    /// Spawn `workers` threads for `config`. On a partial failure the
    /// already-started workers are stopped before the error is returned.
    pub fn spawn(
        config: &WorkloadConfig,
        workers: usize,
        progress: Arc<ProgressTracker>,
        rng: &mut fastrand::Rng,
        live: Arc<AtomicUsize>,
    ) -> Result<Self> {
        let mut group = TaskGroup::new(format!("stress-{}", config.kind), live);
        let counters = Arc::new(WorkCounters::default());
        let finished = CancellationToken::new();
        let remaining = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        for index in 0..workers {
            let payload = match build_payload(config, index, rng.fork()) {
                Ok(payload) => payload,
                Err(e) => {
                    group.shutdown();
                    return Err(e);
                }
            };

            remaining.fetch_add(1, Ordering::SeqCst);
            let guard = ExitGuard {
                remaining: Arc::clone(&remaining),
                finished: finished.clone(),
            };
            let worker = Worker {
                index,
                payload,
                counters: Arc::clone(&counters),
                progress: Arc::clone(&progress),
                started,
                duration: config.duration,
                progress_interval: config.progress_interval,
                pause: yield_pause(config.kind),
            };

            if let Err(e) = group.spawn(move |token| {
                let _guard = guard;
                worker.run(&token);
            }) {
                group.shutdown();
                return Err(e);
            }
        }

        debug!("Spawned {} {} worker(s)", workers, config.kind);
        Ok(Self {
            group,
            counters,
            finished,
        })
    }

    pub fn counters(&self) -> &WorkCounters {
        &self.counters
    }

    /// Tripped once every worker has exited
    pub fn finished_token(&self) -> CancellationToken {
        self.finished.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Cancel and join all workers. Returns how many panicked.
    pub fn shutdown(&mut self) -> usize {
        self.group.shutdown()
    }
}

/// Disk units block on I/O; give the scheduler a breather between them
fn yield_pause(kind: WorkloadKind) -> Duration {
    match kind {
        WorkloadKind::Disk => Duration::from_millis(1),
        _ => Duration::ZERO,
    }
}

struct Worker {
    index: usize,
    payload: Box<dyn WorkloadPayload>,
    counters: Arc<WorkCounters>,
    progress: Arc<ProgressTracker>,
    started: Instant,
    duration: Duration,
    progress_interval: Duration,
    pause: Duration,
}

impl Worker {
    fn fraction(&self) -> f64 {
        self.started.elapsed().as_secs_f64() / self.duration.as_secs_f64().max(f64::EPSILON)
    }

    fn run(mut self, token: &CancellationToken) {
        let mut last_report = Instant::now();
        // At least one unit per worker, even when stopped right away
        loop {
            let ok = self.payload.execute();
            self.counters.record(ok);

            if last_report.elapsed() >= self.progress_interval {
                self.progress.report(self.fraction());
                last_report = Instant::now();
            }

            if token.is_cancelled() || self.started.elapsed() >= self.duration {
                break;
            }
            if !self.pause.is_zero() && token.wait_timeout(self.pause) {
                break;
            }
        }
        self.progress.report(self.fraction());
        debug!("{} worker {} exiting", self.payload.label(), self.index);
    }
}
