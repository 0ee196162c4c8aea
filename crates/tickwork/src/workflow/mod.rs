//! Workflow definitions
//!
//! A [`Workflow`] is an immutable, validated DAG of [`Step`]s built through
//! [`WorkflowBuilder`]. Steps reference their workflow by name only; all
//! lookups go through the store, so definitions stay acyclic at the type
//! level as well as in the graph.

mod builder;
mod execution;
mod step;

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use builder::{WorkflowBuilder, WorkflowError};
pub use execution::{WorkflowExecState, WorkflowExecution};
pub use step::{Context, Predicate, Step};

/// How a workflow run is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Scheduled,
    Event,
}

/// Whether a workflow accepts new runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Enabled,
    Disabled,
}

/// A registered, validated DAG of steps.
///
/// Construct through [`Workflow::builder`]; the builder expands group and
/// `depends_on` references into explicit edges, rejects cycles and unknown
/// endpoints, and caches the topological order.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    /// Queue steps dispatch onto unless they override it.
    pub queue: String,
    pub steps: HashMap<String, Step>,
    /// Fully expanded edge set (explicit edges, `depends_on`, groups).
    pub edges: Vec<(String, String)>,
    /// Cached topological order over all steps.
    pub topo_order: Vec<String>,
    pub trigger: Trigger,
    /// Overall run budget; `None` means unbounded.
    pub timeout: Option<Duration>,
    pub state: WorkflowState,

    pub(crate) preds: HashMap<String, Vec<String>>,
    pub(crate) succs: HashMap<String, Vec<String>>,
}

impl Workflow {
    /// Start building a workflow definition.
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    /// Predecessors of `step` in the expanded edge set.
    pub fn predecessors(&self, step: &str) -> &[String] {
        self.preds.get(step).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Successors of `step` in the expanded edge set.
    pub fn successors(&self, step: &str) -> &[String] {
        self.succs.get(step).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Steps with no predecessors.
    pub fn roots(&self) -> Vec<String> {
        self.topo_order
            .iter()
            .filter(|s| self.predecessors(s).is_empty())
            .cloned()
            .collect()
    }

    /// Content fingerprint; identical definitions hash identically, which
    /// makes registration idempotent. Predicates are code and excluded.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.name.hash(&mut hasher);
        self.queue.hash(&mut hasher);
        format!("{:?}", self.trigger).hash(&mut hasher);
        self.timeout.hash(&mut hasher);

        let mut names: Vec<_> = self.steps.keys().collect();
        names.sort();
        for name in names {
            let step = &self.steps[name];
            step.name.hash(&mut hasher);
            step.handler.hash(&mut hasher);
            step.rollback.hash(&mut hasher);
            step.group.hash(&mut hasher);
            step.after_group.hash(&mut hasher);
            step.await_approval.hash(&mut hasher);
            step.max_retries.hash(&mut hasher);
            step.timeout.hash(&mut hasher);
            step.queue.hash(&mut hasher);
        }

        let mut edges = self.edges.clone();
        edges.sort();
        edges.hash(&mut hasher);

        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roots_and_neighbors() {
        let wf = Workflow::builder("pipeline")
            .step(Step::new("fetch", "p.fetch"))
            .step(Step::new("transform", "p.transform"))
            .step(Step::new("load", "p.load"))
            .edge("fetch", "transform")
            .edge("transform", "load")
            .build()
            .unwrap();

        assert_eq!(wf.roots(), vec!["fetch"]);
        assert_eq!(wf.successors("fetch"), ["transform"]);
        assert_eq!(wf.predecessors("load"), ["transform"]);
        assert_eq!(wf.topo_order, vec!["fetch", "transform", "load"]);
    }

    #[test]
    fn fingerprint_is_stable_for_identical_content() {
        let build = || {
            Workflow::builder("order")
                .step(Step::new("validate", "o.validate"))
                .step(Step::new("charge", "o.charge").rollback("o.refund"))
                .edge("validate", "charge")
                .build()
                .unwrap()
        };
        assert_eq!(build().fingerprint(), build().fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let a = Workflow::builder("order")
            .step(Step::new("validate", "o.validate"))
            .build()
            .unwrap();
        let b = Workflow::builder("order")
            .step(Step::new("validate", "o.validate_v2"))
            .build()
            .unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
