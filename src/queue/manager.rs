//! Async task manager: task constructors, consumer workers, lifecycle.
//!
//! The manager owns the priority queue and a fixed set of consumer workers.
//! `Log` tasks are emitted straight to tracing by the consumer; `Business`
//! and `Cleanup` tasks run through the [`TaskExecutor`] the manager was built
//! with, so the wiring to caches and storage stays outside this module.
//!
//! Each task executes inside its own recovery scope and its callback fires
//! exactly once, with either the result or the error. With a single consumer
//! execution is strictly sequential in priority order; with several
//! consumers only dispatch order is guaranteed.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::types::{MiddlewareError, Result};

use super::heap::PriorityQueue;
use super::task::{
    AsyncTask, LogLevel, TaskCallback, TaskKind, TaskResult, PRIORITY_BUSINESS, PRIORITY_CLEANUP,
    PRIORITY_CRITICAL, PRIORITY_LOG,
};

/// Executes `Business` and `Cleanup` tasks against the real backends.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, kind: &TaskKind) -> TaskResult;
}

/// Executor that acknowledges everything; used when no backend is wired.
pub struct NoopExecutor;

#[async_trait]
impl TaskExecutor for NoopExecutor {
    async fn execute(&self, _kind: &TaskKind) -> TaskResult {
        Ok(Value::Null)
    }
}

/// Counter snapshot for operational endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct AsyncManagerStats {
    pub queued: usize,
    pub executed: u64,
    pub failed: u64,
    pub consumers: usize,
    pub closed: bool,
}

/// Owner of the priority queue and its consumer pool.
pub struct AsyncTaskManager {
    queue: Arc<PriorityQueue>,
    executor: Arc<dyn TaskExecutor>,
    consumer_count: usize,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
    executed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl AsyncTaskManager {
    pub fn new(consumer_count: usize, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            queue: Arc::new(PriorityQueue::new()),
            executor,
            consumer_count: consumer_count.max(1),
            handles: std::sync::Mutex::new(Vec::new()),
            executed: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
        }
    }

    // ------------------------------------------------------------------
    // Task constructors
    // ------------------------------------------------------------------

    /// Fire-and-forget structured log record.
    pub fn log_task(level: LogLevel, message: impl Into<String>, fields: Value) -> AsyncTask {
        AsyncTask::new(
            TaskKind::Log {
                level,
                message: message.into(),
                fields,
            },
            PRIORITY_LOG,
        )
    }

    /// Business follow-up. Login and other critical ops run ahead of the
    /// default business priority.
    pub fn business_task(
        op: impl Into<String>,
        params: Value,
        callback: Option<TaskCallback>,
    ) -> AsyncTask {
        let op = op.into();
        let priority = if is_critical_op(&op) {
            PRIORITY_CRITICAL
        } else {
            PRIORITY_BUSINESS
        };
        let mut task = AsyncTask::new(TaskKind::Business { op, params }, priority);
        task.callback = callback;
        task
    }

    /// Resource cleanup follow-up.
    pub fn cleanup_task(resource: impl Into<String>, id: impl Into<String>) -> AsyncTask {
        AsyncTask::new(
            TaskKind::Cleanup {
                resource: resource.into(),
                id: id.into(),
            },
            PRIORITY_CLEANUP,
        )
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Spawn the consumer workers. Tasks enqueued before `start` are held in
    /// priority order and drain once the consumers come up.
    pub fn start(&self) {
        let mut handles = self.handles.lock().expect("manager mutex poisoned");
        if !handles.is_empty() {
            warn!("async manager already started");
            return;
        }
        for worker_id in 0..self.consumer_count {
            let queue = Arc::clone(&self.queue);
            let executor = Arc::clone(&self.executor);
            let executed = Arc::clone(&self.executed);
            let failed = Arc::clone(&self.failed);
            handles.push(tokio::spawn(async move {
                consumer_loop(worker_id, queue, executor, executed, failed).await;
            }));
        }
        info!(consumers = self.consumer_count, "async task manager started");
    }

    /// Enqueue a constructed task.
    pub fn enqueue(&self, task: AsyncTask) -> Result<()> {
        debug!(task = ?task, "enqueueing async task");
        self.queue.enqueue(task)
    }

    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }

    pub fn stats(&self) -> AsyncManagerStats {
        AsyncManagerStats {
            queued: self.queue.size(),
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            consumers: self.consumer_count,
            closed: self.queue.is_closed(),
        }
    }

    /// Close the queue and wait up to `timeout` for consumers to drain what
    /// is already queued.
    pub async fn stop(&self, timeout: Duration) {
        info!(queued = self.queue.size(), "stopping async task manager");
        self.queue.close();

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().expect("manager mutex poisoned");
            guard.drain(..).collect()
        };
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(
                remaining = self.queue.size(),
                "async manager drain timed out"
            );
        } else {
            info!("async task manager drained");
        }
    }
}

fn is_critical_op(op: &str) -> bool {
    matches!(op, "login" | "register" | "payment" | "order_commit")
}

async fn consumer_loop(
    worker_id: usize,
    queue: Arc<PriorityQueue>,
    executor: Arc<dyn TaskExecutor>,
    executed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
) {
    debug!(worker_id, "async consumer started");
    while let Some(mut task) = queue.dequeue().await {
        let result = run_task(&task.kind, executor.as_ref()).await;
        match &result {
            Ok(_) => {
                executed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                failed.fetch_add(1, Ordering::Relaxed);
                warn!(task = %task.id, kind = task.kind.name(), error = %e, "async task failed");
            }
        }
        if let Some(callback) = task.callback.take() {
            callback(result);
        }
    }
    debug!(worker_id, "async consumer drained and exiting");
}

/// Execute one task inside its own recovery scope.
async fn run_task(kind: &TaskKind, executor: &dyn TaskExecutor) -> TaskResult {
    match kind {
        TaskKind::Log {
            level,
            message,
            fields,
        } => {
            match level {
                LogLevel::Debug => debug!(fields = %fields, "{message}"),
                LogLevel::Info => info!(fields = %fields, "{message}"),
                LogLevel::Warn => warn!(fields = %fields, "{message}"),
                LogLevel::Error => error!(fields = %fields, "{message}"),
            }
            Ok(json!({"logged": true}))
        }
        TaskKind::Business { .. } | TaskKind::Cleanup { .. } => {
            match AssertUnwindSafe(executor.execute(kind)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    error!(panic = %message, "async task panicked; consumer recovered");
                    Err(MiddlewareError::Internal(format!(
                        "async task panicked: {message}"
                    )))
                }
            }
        }
    }
}
