//! Bounded pool of long-lived workers executing submitted tasks.
//!
//! Workers share one queue behind a mutex-guarded receiver. Every task runs
//! inside a panic recovery scope: a panicking task is counted in `failed` and
//! logged, and the worker survives to take the next task. A monitor task
//! samples utilization and retunes capacity between the configured hard
//! bounds: +20% above 0.8 load, -20% below 0.2 load.
//!
//! Shrinking never interrupts a task: excess workers exit when they next come
//! up for work, so in-flight work always drains naturally.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::types::{MiddlewareError, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Configuration for a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Initial worker count.
    pub capacity: usize,
    /// Floor the tuner may shrink to.
    pub hard_min: usize,
    /// Ceiling the tuner may grow to.
    pub hard_max: usize,
    /// Maximum queued submissions before `submit` blocks or rejects.
    pub queue_size: usize,
    /// When true, `submit` waits for queue space; when false a full queue
    /// rejects with `PoolExhausted`.
    pub blocking_submit: bool,
    /// Utilization sampling interval for the capacity tuner. `None` disables
    /// automatic tuning; `tune` remains available.
    pub monitor_interval: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            hard_min: 2,
            hard_max: 64,
            queue_size: 1024,
            blocking_submit: false,
            monitor_interval: Some(Duration::from_secs(5)),
        }
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub alive_workers: usize,
    pub running: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub closed: bool,
}

struct PoolInner {
    name: String,
    config: PoolConfig,
    job_tx: mpsc::Sender<Job>,
    job_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    capacity: AtomicUsize,
    alive: AtomicUsize,
    running: AtomicUsize,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
}

/// Bounded worker pool. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create and start a pool with `config.capacity` workers.
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Self {
        let name = name.into();
        let (job_tx, job_rx) = mpsc::channel::<Job>(config.queue_size.max(1));
        let capacity = config
            .capacity
            .clamp(config.hard_min.max(1), config.hard_max.max(1));

        let inner = Arc::new(PoolInner {
            name: name.clone(),
            config: config.clone(),
            job_tx,
            job_rx: Arc::new(Mutex::new(job_rx)),
            capacity: AtomicUsize::new(capacity),
            alive: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        let pool = Self { inner };
        pool.spawn_workers(capacity);

        if let Some(interval) = config.monitor_interval {
            pool.spawn_monitor(interval);
        }

        info!(
            pool = %name,
            capacity,
            queue_size = config.queue_size,
            "worker pool started"
        );
        pool
    }

    fn spawn_workers(&self, count: usize) {
        for _ in 0..count {
            self.inner.alive.fetch_add(1, Ordering::SeqCst);
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                worker_loop(inner).await;
            });
        }
    }

    fn spawn_monitor(&self, interval: Duration) {
        let inner = Arc::clone(&self.inner);
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let capacity = inner.capacity.load(Ordering::Relaxed);
                let running = inner.running.load(Ordering::Relaxed);
                if capacity == 0 {
                    continue;
                }
                let load = running as f64 / capacity as f64;
                if load > 0.8 && capacity < inner.config.hard_max {
                    let grown = (capacity + (capacity / 5).max(1)).min(inner.config.hard_max);
                    debug!(pool = %inner.name, running, capacity, grown, "load high, growing");
                    pool.tune(grown);
                } else if load < 0.2 && capacity > inner.config.hard_min {
                    let shrunk = capacity
                        .saturating_sub((capacity / 5).max(1))
                        .max(inner.config.hard_min);
                    debug!(pool = %inner.name, running, capacity, shrunk, "load low, shrinking");
                    pool.tune(shrunk);
                }
            }
        });
    }

    /// Submit a task. Honors the configured blocking mode: a full queue either
    /// waits for space or rejects with `PoolExhausted`. A closed pool always
    /// rejects with `PoolClosed`.
    pub async fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit_job(Box::pin(task)).await
    }

    /// Submit a task that observes the pool's cancellation token. `close`
    /// cancels the token so the task can exit early.
    pub async fn submit_with_context<F, Fut>(&self, task: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.inner.cancel.child_token();
        self.submit_job(Box::pin(task(token))).await
    }

    async fn submit_job(&self, job: Job) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(MiddlewareError::PoolClosed(self.inner.name.clone()));
        }

        if self.inner.config.blocking_submit {
            self.inner
                .job_tx
                .send(job)
                .await
                .map_err(|_| MiddlewareError::PoolClosed(self.inner.name.clone()))?;
        } else {
            self.inner.job_tx.try_send(job).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    MiddlewareError::PoolExhausted(self.inner.name.clone())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    MiddlewareError::PoolClosed(self.inner.name.clone())
                }
            })?;
        }

        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Retune worker capacity, clamped to the configured hard bounds. Growth
    /// spawns workers immediately; shrink lets excess workers exit as they
    /// finish their current task.
    pub fn tune(&self, new_capacity: usize) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let clamped = new_capacity.clamp(self.inner.config.hard_min, self.inner.config.hard_max);
        let old = self.inner.capacity.swap(clamped, Ordering::SeqCst);
        if clamped == old {
            return;
        }
        info!(pool = %self.inner.name, old, new = clamped, "pool capacity tuned");

        let alive = self.inner.alive.load(Ordering::SeqCst);
        if clamped > alive {
            self.spawn_workers(clamped - alive);
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.inner.capacity.load(Ordering::Relaxed),
            alive_workers: self.inner.alive.load(Ordering::Relaxed),
            running: self.inner.running.load(Ordering::Relaxed),
            submitted: self.inner.submitted.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            closed: self.inner.closed.load(Ordering::Relaxed),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the pool: reject new submissions, cancel context tokens, let
    /// in-flight tasks drain, and wait up to `drain_timeout` for workers to
    /// exit.
    pub async fn close(&self, drain_timeout: Duration) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(pool = %self.inner.name, "closing worker pool");
        self.inner.cancel.cancel();

        let deadline = tokio::time::Instant::now() + drain_timeout;
        while self.inner.alive.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    pool = %self.inner.name,
                    alive = self.inner.alive.load(Ordering::SeqCst),
                    "drain timeout elapsed with workers still running"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        info!(pool = %self.inner.name, "worker pool closed");
    }
}

async fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        if inner.cancel.is_cancelled() {
            break;
        }

        // Shrink handling: if more workers are alive than capacity allows,
        // this worker volunteers to exit before taking new work.
        let alive = inner.alive.load(Ordering::SeqCst);
        let capacity = inner.capacity.load(Ordering::SeqCst);
        if alive > capacity {
            if inner
                .alive
                .compare_exchange(alive, alive - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                debug!(pool = %inner.name, "worker exiting after shrink");
                return;
            }
            continue;
        }

        let job = {
            let mut rx = inner.job_rx.lock().await;
            tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else { break };

        inner.running.fetch_add(1, Ordering::SeqCst);
        let outcome = AssertUnwindSafe(job).catch_unwind().await;
        inner.running.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Ok(()) => {
                inner.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(panic) => {
                inner.failed.fetch_add(1, Ordering::Relaxed);
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(pool = %inner.name, panic = %message, "task panicked; worker recovered");
            }
        }
    }
    inner.alive.fetch_sub(1, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn test_config() -> PoolConfig {
        PoolConfig {
            capacity: 4,
            hard_min: 1,
            hard_max: 16,
            queue_size: 2048,
            blocking_submit: true,
            monitor_interval: None,
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_tasks_run_and_complete() {
        let pool = WorkerPool::new("t", test_config());
        let counter = Arc::new(AtomicU64::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .expect("submit");
        }

        wait_for(|| counter.load(Ordering::SeqCst) == 100).await;
        let stats = pool.stats();
        assert_eq!(stats.submitted, 100);
        assert_eq!(stats.completed, 100);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_panic_containment_half_of_thousand() {
        let pool = WorkerPool::new("panics", test_config());

        for i in 0..1000u32 {
            pool.submit(async move {
                if i % 2 == 0 {
                    panic!("task {i} exploded");
                }
            })
            .await
            .expect("submit");
        }

        let inner = pool.clone();
        wait_for(move || {
            let s = inner.stats();
            s.completed + s.failed == 1000
        })
        .await;

        let stats = pool.stats();
        assert_eq!(stats.failed, 500);
        assert_eq!(stats.completed, 500);

        // Pool stays usable after the panics.
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .expect("submit after panics");
        }
        wait_for(|| counter.load(Ordering::SeqCst) == 100).await;
    }

    #[tokio::test]
    async fn test_running_never_exceeds_capacity() {
        let pool = WorkerPool::new("bounded", test_config());
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let pool_for_obs = pool.clone();
            let peak = Arc::clone(&peak);
            pool.submit(async move {
                let s = pool_for_obs.stats();
                peak.fetch_max(s.running, Ordering::SeqCst);
                assert!(s.running <= s.capacity, "running {} > capacity {}", s.running, s.capacity);
                tokio::time::sleep(Duration::from_millis(5)).await;
            })
            .await
            .expect("submit");
        }

        let observer = pool.clone();
        wait_for(move || {
            let s = observer.stats();
            s.completed + s.failed == 50
        })
        .await;
        assert_eq!(pool.stats().failed, 0, "an in-task assertion failed");
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_submissions() {
        let pool = WorkerPool::new("closing", test_config());
        pool.close(Duration::from_secs(1)).await;

        let err = pool.submit(async {}).await.expect_err("must reject");
        assert!(matches!(err, MiddlewareError::PoolClosed(_)));
    }

    #[tokio::test]
    async fn test_nonblocking_full_queue_is_exhausted() {
        let pool = WorkerPool::new(
            "tiny",
            PoolConfig {
                capacity: 1,
                hard_min: 1,
                hard_max: 1,
                queue_size: 1,
                blocking_submit: false,
                monitor_interval: None,
            },
        );

        // Occupy the single worker, then overfill the single queue slot.
        pool.submit(async {
            tokio::time::sleep(Duration::from_millis(200)).await;
        })
        .await
        .expect("first");

        let mut exhausted = false;
        for _ in 0..8 {
            match pool.submit(async {}).await {
                Err(MiddlewareError::PoolExhausted(_)) => {
                    exhausted = true;
                    break;
                }
                Ok(()) => continue,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert!(exhausted, "a full non-blocking pool must reject");
    }

    #[tokio::test]
    async fn test_tune_grows_and_shrinks_within_bounds() {
        let pool = WorkerPool::new("tuned", test_config());
        assert_eq!(pool.stats().capacity, 4);

        pool.tune(100);
        assert_eq!(pool.stats().capacity, 16, "clamped to hard_max");
        wait_for(|| pool.stats().alive_workers == 16).await;

        pool.tune(2);
        assert_eq!(pool.stats().capacity, 2);
        // Idle workers notice the shrink once they come up for work.
        for _ in 0..32 {
            let _ = pool.submit(async {}).await;
        }
        wait_for(|| pool.stats().alive_workers <= 2).await;
    }

    #[tokio::test]
    async fn test_submit_with_context_sees_cancellation() {
        let pool = WorkerPool::new("ctx", test_config());
        let cancelled = Arc::new(AtomicU64::new(0));

        let flag = Arc::clone(&cancelled);
        pool.submit_with_context(move |token| async move {
            token.cancelled().await;
            flag.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .expect("submit");

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.close(Duration::from_secs(1)).await;
        wait_for(|| cancelled.load(Ordering::SeqCst) == 1).await;
    }
}
