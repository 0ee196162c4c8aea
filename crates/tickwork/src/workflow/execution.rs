//! Workflow execution record

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::ErrorInfo;

use super::step::Context;
use super::Trigger;

/// State of one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowExecState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowExecState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One run of a workflow.
///
/// Step membership is partitioned across the five sets; `completed_steps`
/// is a vector because the rollback chain walks it in reverse completion
/// order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow: String,
    pub state: WorkflowExecState,

    pub pending_steps: BTreeSet<String>,
    pub running_steps: BTreeSet<String>,
    /// In completion order.
    pub completed_steps: Vec<String>,
    pub skipped_steps: BTreeSet<String>,
    pub cancelled_steps: BTreeSet<String>,

    pub step_results: HashMap<String, serde_json::Value>,
    pub step_errors: HashMap<String, ErrorInfo>,
    pub step_attempts: HashMap<String, u32>,

    /// Accumulating context; successful steps merge their changes in.
    pub context: Context,

    pub trigger: Trigger,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Terminal error, with the context preserved as it was at failure.
    pub error: Option<ErrorInfo>,
}

impl WorkflowExecution {
    /// A fresh pending run seeded with the workflow's roots.
    pub fn begin(
        workflow: impl Into<String>,
        roots: impl IntoIterator<Item = String>,
        context: Context,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow: workflow.into(),
            state: WorkflowExecState::Pending,
            pending_steps: roots.into_iter().collect(),
            running_steps: BTreeSet::new(),
            completed_steps: vec![],
            skipped_steps: BTreeSet::new(),
            cancelled_steps: BTreeSet::new(),
            step_results: HashMap::new(),
            step_errors: HashMap::new(),
            step_attempts: HashMap::new(),
            context,
            trigger,
            attempt: 1,
            started_at: now,
            completed_at: None,
            error: None,
        }
    }

    /// True once `step` counts as done for dependency purposes.
    pub fn is_satisfied(&self, step: &str) -> bool {
        self.skipped_steps.contains(step) || self.completed_steps.iter().any(|s| s == step)
    }

    /// True once `step` sits in any of the membership sets.
    pub fn knows_step(&self, step: &str) -> bool {
        self.pending_steps.contains(step)
            || self.running_steps.contains(step)
            || self.cancelled_steps.contains(step)
            || self.is_satisfied(step)
    }
}
