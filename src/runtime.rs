//! Execution contexts
//!
//! The core runs across three contexts: the link layer's receive context
//! (not ours), a worker pool for CPU-bound crypto, and one single-threaded
//! logic queue that owns every state transition. The other contexts never
//! mutate state directly; they post closures onto the logic queue.
//!
//! [`WorkerPool::inline`] runs submitted jobs on the caller's thread, which
//! lets tests drive the whole pipeline deterministically by draining the
//! logic queue in a loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{unbounded, Receiver, Sender};

/// A unit of queued work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Time source, unix milliseconds. Injected so nothing in the core reads
/// the wall clock behind the caller's back and tests can drive time by
/// hand.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall-clock time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Hand-driven time for tests
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn at(now_ms: u64) -> Self {
        Self(AtomicU64::new(now_ms))
    }

    pub fn set(&self, now_ms: u64) {
        self.0.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.0.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Handle to the single-threaded protocol logic queue.
///
/// Cheap to clone; every clone posts into the same queue. Exactly one
/// thread should consume it, either by owning [`run`](Logic::run) or by
/// draining it from its own loop.
#[derive(Clone)]
pub struct Logic {
    tx: Sender<Job>,
    rx: Receiver<Job>,
}

impl Logic {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Post a closure to run on the logic thread
    pub fn call(&self, job: impl FnOnce() + Send + 'static) {
        // send only fails when every receiver is gone, at which point the
        // process is shutting down and the job is moot
        let _ = self.tx.send(Box::new(job));
    }

    /// Run every queued job on the calling thread, including jobs queued
    /// by the jobs themselves. Returns how many ran.
    pub fn drain(&self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Consume the queue forever; the daemon's logic thread lives here
    pub fn run(&self) {
        while let Ok(job) = self.rx.recv() {
            job();
        }
    }
}

impl Default for Logic {
    fn default() -> Self {
        Self::new()
    }
}

enum PoolBackend {
    /// Run jobs immediately on the submitting thread
    Inline,
    Threads {
        tx: Option<Sender<Job>>,
        handles: Vec<JoinHandle<()>>,
    },
}

struct PoolInner {
    backend: parking_lot::Mutex<PoolBackend>,
}

/// Pool of crypto worker threads
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Spawn `workers` OS threads consuming a shared job queue
    pub fn spawn(workers: usize) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let handles = (0..workers.max(1))
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("veilnet-worker-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                backend: parking_lot::Mutex::new(PoolBackend::Threads {
                    tx: Some(tx),
                    handles,
                }),
            }),
        }
    }

    /// A pool that runs each job inline on submit; deterministic, used by
    /// tests and by embedders that bring their own threading
    pub fn inline() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                backend: parking_lot::Mutex::new(PoolBackend::Inline),
            }),
        }
    }

    /// Submit one job
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let job: Job = Box::new(job);
        // take the sender out of the lock before running anything
        let queued = {
            let backend = self.inner.backend.lock();
            match &*backend {
                PoolBackend::Inline => None,
                PoolBackend::Threads { tx, .. } => tx.clone(),
            }
        };
        match queued {
            None => job(),
            Some(tx) => {
                let _ = tx.send(job);
            }
        }
    }

    /// Stop accepting work and join the worker threads. Idempotent.
    pub fn shutdown(&self) {
        let mut backend = self.inner.backend.lock();
        if let PoolBackend::Threads { tx, handles } = &mut *backend {
            tx.take();
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_logic_drain_runs_nested_jobs() {
        let logic = Logic::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        let inner_logic = logic.clone();
        logic.call(move || {
            c.fetch_add(1, Ordering::SeqCst);
            let c2 = c.clone();
            inner_logic.call(move || {
                c2.fetch_add(1, Ordering::SeqCst);
            });
        });

        assert_eq!(logic.drain(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(logic.drain(), 0);
    }

    #[test]
    fn test_inline_pool_runs_immediately() {
        let pool = WorkerPool::inline();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        pool.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_threaded_pool_runs_jobs() {
        let pool = WorkerPool::spawn(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = unbounded();
        for _ in 0..8 {
            let c = counter.clone();
            let done = done_tx.clone();
            pool.submit(move || {
                c.fetch_add(1, Ordering::SeqCst);
                let _ = done.send(());
            });
        }
        for _ in 0..8 {
            done_rx
                .recv_timeout(std::time::Duration::from_secs(5))
                .unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        pool.shutdown();
    }
}
