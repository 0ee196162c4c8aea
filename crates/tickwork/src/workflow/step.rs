//! Step definition

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

/// Accumulating key-value context threaded through a workflow run.
pub type Context = serde_json::Map<String, Value>;

/// Predicate over the current context; a step whose predicate evaluates
/// false is skipped and its successors treat it as satisfied.
pub type Predicate = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

/// One node of a workflow DAG.
///
/// Steps are declared with chained setters and handed to the workflow
/// builder:
///
/// ```
/// use tickwork::workflow::{Step, Workflow};
///
/// let wf = Workflow::builder("order")
///     .step(Step::new("reserve", "order.reserve").rollback("order.release"))
///     .step(Step::new("charge", "order.charge").depends_on("reserve"))
///     .build()
///     .unwrap();
/// assert_eq!(wf.roots(), vec!["reserve"]);
/// ```
#[derive(Clone)]
pub struct Step {
    pub name: String,

    /// Registry id of the step body.
    pub handler: String,

    /// Registry id invoked during the rollback chain, if any.
    pub rollback: Option<String>,

    /// Explicit predecessors; expanded into edges at build time.
    pub depends_on: Vec<String>,

    /// Group tag this step belongs to (fan-out side of a fan-in).
    pub group: Option<String>,

    /// Run only after every member of this group is completed or skipped.
    pub after_group: Option<String>,

    /// Gate on the current context; `None` always runs.
    pub when: Option<Predicate>,

    /// Dispatch only after an approval signal names this step.
    pub await_approval: bool,

    /// Retry budget override for this step.
    pub max_retries: Option<u32>,

    /// Per-attempt timeout override for this step.
    pub timeout: Option<Duration>,

    /// Queue override; defaults to the workflow's queue.
    pub queue: Option<String>,
}

impl Step {
    pub fn new(name: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler: handler.into(),
            rollback: None,
            depends_on: vec![],
            group: None,
            after_group: None,
            when: None,
            await_approval: false,
            max_retries: None,
            timeout: None,
            queue: None,
        }
    }

    pub fn rollback(mut self, handler: impl Into<String>) -> Self {
        self.rollback = Some(handler.into());
        self
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn after_group(mut self, group: impl Into<String>) -> Self {
        self.after_group = Some(group.into());
        self
    }

    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        self.when = Some(Arc::new(predicate));
        self
    }

    pub fn await_approval(mut self) -> Self {
        self.await_approval = true;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("handler", &self.handler)
            .field("rollback", &self.rollback)
            .field("depends_on", &self.depends_on)
            .field("group", &self.group)
            .field("after_group", &self.after_group)
            .field("when", &self.when.as_ref().map(|_| "<predicate>"))
            .field("await_approval", &self.await_approval)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("queue", &self.queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_accumulate() {
        let step = Step::new("charge", "order.charge")
            .rollback("order.refund")
            .depends_on("reserve")
            .in_group("billing")
            .max_retries(2)
            .timeout(Duration::from_secs(30))
            .queue("payments");

        assert_eq!(step.rollback.as_deref(), Some("order.refund"));
        assert_eq!(step.depends_on, vec!["reserve"]);
        assert_eq!(step.group.as_deref(), Some("billing"));
        assert_eq!(step.max_retries, Some(2));
        assert_eq!(step.queue.as_deref(), Some("payments"));
        assert!(!step.await_approval);
    }

    #[test]
    fn predicate_evaluates_against_context() {
        let step = Step::new("ship", "order.ship").when(|ctx| {
            ctx.get("paid").and_then(Value::as_bool).unwrap_or(false)
        });

        let when = step.when.as_ref().unwrap();
        let mut ctx = Context::new();
        assert!(!when(&ctx));
        ctx.insert("paid".into(), Value::Bool(true));
        assert!(when(&ctx));
    }
}
