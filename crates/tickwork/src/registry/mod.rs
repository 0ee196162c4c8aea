//! Handler registry
//!
//! Jobs and workflow steps reference their code by a stable string id. At
//! startup the embedding application registers an invokable handler for
//! each id; dispatch resolves through the registry and an unknown id fails
//! the attempt with a `permanent` classification instead of a runtime
//! lookup exception.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::job::PerformOutcome;

/// Boxed future returned by a handler invocation.
pub type HandlerFuture = BoxFuture<'static, PerformOutcome>;

/// An invokable job or step body.
pub type JobHandler = Arc<dyn Fn(JobContext) -> HandlerFuture + Send + Sync>;

/// Everything a handler gets to see about the attempt it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Owning job name, or `workflow/step` for workflow steps.
    pub job_name: String,

    /// Execution id of this attempt.
    pub execution_id: Uuid,

    /// 1-based attempt number.
    pub attempt: u32,

    /// Opaque arguments (for steps: the current workflow context).
    pub args: Value,

    /// Cooperative cancellation signal; bodies should observe it at I/O
    /// points.
    pub cancellation: CancellationToken,
}

impl JobContext {
    /// True once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Maps stable string ids to invokable handlers.
///
/// # Example
///
/// ```
/// use tickwork::registry::HandlerRegistry;
/// use tickwork::job::PerformOutcome;
///
/// let registry = HandlerRegistry::new();
/// registry.register("reports.generate", |ctx| async move {
///     let _ = ctx.args;
///     PerformOutcome::Ok
/// });
/// assert!(registry.contains("reports.generate"));
/// ```
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler under `id`, replacing any previous registration.
    pub fn register<F, Fut>(&self, id: &str, handler: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PerformOutcome> + Send + 'static,
    {
        let handler: JobHandler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.handlers.write().insert(id.to_string(), handler);
    }

    /// Resolve a handler id.
    pub fn get(&self, id: &str) -> Option<JobHandler> {
        self.handlers.read().get(id).cloned()
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.handlers.read().contains_key(id)
    }

    /// Registered handler ids, for diagnostics.
    pub fn ids(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
