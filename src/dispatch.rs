//! Callback dispatcher: runs user callbacks either inline on the caller
//! thread or on a bounded worker pool.
//!
//! Streaming tokens, pipeline events and download progress all flow through
//! here so user code never runs on an engine's generation thread unless the
//! SDK is configured for synchronous callbacks. Panicking callbacks are
//! caught and logged; they never poison a worker.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::error;

/// A unit of user-callback work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Dispatcher operating mode and bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Run callbacks inline on the dispatching thread.
    pub synchronous: bool,
    /// Worker threads in asynchronous mode; at least 1.
    pub thread_count: usize,
    /// Maximum queued-but-not-started callbacks across all workers.
    pub max_queue_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            synchronous: false,
            thread_count: 1,
            max_queue_size: 1_024,
        }
    }
}

struct Worker {
    tx: Sender<Job>,
    handle: JoinHandle<()>,
}

struct Pool {
    workers: Vec<Worker>,
    pending: Arc<AtomicUsize>,
    next_worker: AtomicUsize,
    max_queue_size: usize,
}

impl Pool {
    fn spawn(config: &DispatcherConfig) -> Self {
        let threads = config.thread_count.max(1);
        let capacity = config.max_queue_size.max(1);
        let pending = Arc::new(AtomicUsize::new(0));
        let workers = (0..threads)
            .map(|index| {
                let (tx, rx): (Sender<Job>, Receiver<Job>) = bounded(capacity);
                let pending = Arc::clone(&pending);
                let handle = std::thread::Builder::new()
                    .name(format!("selkie-cb-{index}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            pending.fetch_sub(1, Ordering::SeqCst);
                            run_isolated(job);
                        }
                    })
                    .unwrap_or_else(|e| {
                        // Thread spawn failure at construction is unrecoverable
                        // for the pool; surface loudly.
                        panic!("failed to spawn callback worker: {e}");
                    });
                Worker { tx, handle }
            })
            .collect();
        Self {
            workers,
            pending,
            next_worker: AtomicUsize::new(0),
            max_queue_size: capacity,
        }
    }

    /// Admit a job under the global queue bound and hand it to worker
    /// `index`. Returns `false` on overflow.
    fn submit(&self, index: usize, job: Job) -> bool {
        loop {
            let current = self.pending.load(Ordering::SeqCst);
            if current >= self.max_queue_size {
                return false;
            }
            if self
                .pending
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
        match self.workers[index % self.workers.len()].tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                false
            }
        }
    }

    /// Drop the senders and join every worker; already-enqueued jobs drain
    /// to completion first.
    fn drain_and_join(self) {
        let mut handles = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            drop(worker.tx);
            handles.push(worker.handle);
        }
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn run_isolated(job: Job) {
    if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("user callback panicked; dispatcher worker continues");
    }
}

/// Delivers user callbacks under the configured concurrency mode.
pub struct CallbackDispatcher {
    inner: Mutex<Inner>,
}

struct Inner {
    config: DispatcherConfig,
    pool: Option<Pool>,
}

impl CallbackDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let pool = if config.synchronous {
            None
        } else {
            Some(Pool::spawn(&config))
        };
        Self {
            inner: Mutex::new(Inner { config, pool }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current configuration.
    pub fn config(&self) -> DispatcherConfig {
        self.lock().config.clone()
    }

    /// Queued-but-not-started callbacks. Always `0` in synchronous mode.
    pub fn pending(&self) -> usize {
        self.lock()
            .pool
            .as_ref()
            .map_or(0, |p| p.pending.load(Ordering::SeqCst))
    }

    /// Deliver `job`.
    ///
    /// Synchronous mode runs it inline and returns `true` after it
    /// completes. Asynchronous mode enqueues and returns immediately;
    /// `false` signals backpressure (queue full) and the job is dropped;
    /// the dispatcher never retries on the caller's behalf.
    pub fn dispatch(&self, job: Job) -> bool {
        let inner = self.lock();
        if inner.config.synchronous {
            drop(inner);
            run_isolated(job);
            return true;
        }
        match &inner.pool {
            Some(pool) => {
                let index = pool.next_worker.fetch_add(1, Ordering::Relaxed);
                pool.submit(index, job)
            }
            None => false,
        }
    }

    /// Deliver `job` with per-key FIFO ordering.
    ///
    /// All jobs sharing a key land on the same worker, so they execute in
    /// enqueue order even with a multi-threaded pool. Streaming engines key
    /// by model handle to keep one generation's tokens ordered.
    pub fn dispatch_keyed(&self, key: u64, job: Job) -> bool {
        let inner = self.lock();
        if inner.config.synchronous {
            drop(inner);
            run_isolated(job);
            return true;
        }
        match &inner.pool {
            Some(pool) => pool.submit((key % pool.workers.len() as u64) as usize, job),
            None => false,
        }
    }

    /// Drain pending work, join workers, then apply `config`.
    pub fn reconfigure(&self, config: DispatcherConfig) {
        let mut inner = self.lock();
        if let Some(pool) = inner.pool.take() {
            pool.drain_and_join();
        }
        inner.pool = if config.synchronous {
            None
        } else {
            Some(Pool::spawn(&config))
        };
        inner.config = config;
    }

    /// Drain pending work and stop the pool. Subsequent asynchronous
    /// dispatches are rejected until `reconfigure` is called.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        if let Some(pool) = inner.pool.take() {
            pool.drain_and_join();
        }
    }
}

impl Drop for CallbackDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
