// hwstress-core/src/cancel.rs
// Cooperative cancellation token and joined thread groups

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{HwStressError, Result};

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    wakeup: Condvar,
}

/// Shared stop flag. Hot loops poll `is_cancelled`; sleeping loops use
/// `wait_timeout` so a cancel wakes them immediately.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        let _guard = self.inner.lock.lock();
        self.inner.wakeup.notify_all();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Sleep for up to `timeout`. Returns true if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock();
        while !self.is_cancelled() {
            if self.inner.wakeup.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_cancelled()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Decrements the live-thread counter when the thread body exits, panics included
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A named set of threads sharing one token. Joined on `shutdown` or drop.
pub struct TaskGroup {
    name: String,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    live: Arc<AtomicUsize>,
}

impl TaskGroup {
    pub fn new(name: impl Into<String>, live: Arc<AtomicUsize>) -> Self {
        Self {
            name: name.into(),
            token: CancellationToken::new(),
            handles: Vec::new(),
            live,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn spawn<F>(&mut self, body: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        let token = self.token.clone();
        let thread_name = format!("{}-{}", self.name, self.handles.len());

        self.live.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(Arc::clone(&self.live));

        let spawned = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let _guard = guard;
                body(token);
            });

        match spawned {
            Ok(handle) => {
                self.handles.push(handle);
                Ok(())
            }
            // The closure (and its guard) was dropped by the failed spawn
            Err(e) => Err(HwStressError::spawn(thread_name, e)),
        }
    }

    /// Cancel and join every thread. Returns how many panicked.
    pub fn shutdown(&mut self) -> usize {
        self.token.cancel();
        let mut panicked = 0;
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                warn!("Thread {} panicked before shutdown", name);
                panicked += 1;
            }
        }
        debug!("Task group {} joined", self.name);
        panicked
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.shutdown();
        }
    }
}
