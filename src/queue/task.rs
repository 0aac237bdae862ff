//! Async task model: closed kind enumeration, priorities, callbacks.

use serde_json::Value;
use uuid::Uuid;

use crate::types::MiddlewareError;

/// Priority of fire-and-forget log records.
pub const PRIORITY_LOG: i32 = 1;
/// Priority of resource cleanup work.
pub const PRIORITY_CLEANUP: i32 = 2;
/// Default priority of business follow-ups.
pub const PRIORITY_BUSINESS: i32 = 5;
/// Priority of login/critical business follow-ups.
pub const PRIORITY_CRITICAL: i32 = 10;

/// Outcome delivered to a task callback, exactly once.
pub type TaskResult = std::result::Result<Value, MiddlewareError>;

/// Completion callback stored on the task.
pub type TaskCallback = Box<dyn FnOnce(TaskResult) + Send + 'static>;

/// Log severity carried by a `Log` task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// The closed set of task kinds the async manager constructs.
#[derive(Debug, Clone)]
pub enum TaskKind {
    Log {
        level: LogLevel,
        message: String,
        fields: Value,
    },
    Business {
        op: String,
        params: Value,
    },
    Cleanup {
        resource: String,
        id: String,
    },
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Log { .. } => "log",
            TaskKind::Business { .. } => "business",
            TaskKind::Cleanup { .. } => "cleanup",
        }
    }
}

/// One unit of queued work.
pub struct AsyncTask {
    pub id: Uuid,
    pub kind: TaskKind,
    /// Larger runs earlier.
    pub priority: i32,
    pub callback: Option<TaskCallback>,
}

impl AsyncTask {
    pub fn new(kind: TaskKind, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            priority,
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: TaskCallback) -> Self {
        self.callback = Some(callback);
        self
    }
}

impl std::fmt::Debug for AsyncTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTask")
            .field("id", &self.id)
            .field("kind", &self.kind.name())
            .field("priority", &self.priority)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}
