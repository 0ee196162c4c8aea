//! Step completion routing
//!
//! Step runs finish on dispatcher workers; the router forwards each
//! completion to the drive loop that owns the workflow execution.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::dispatch::{JobRun, RunKind, RunOutcome, RunSink, RunVerdict};
use crate::workflow::Context;

/// A finished step attempt, as seen by the drive loop.
#[derive(Debug)]
pub(crate) struct StepCompletion {
    pub step: String,
    pub verdict: RunVerdict,
    pub attempt: u32,
}

/// Control operations sent to a drive loop.
#[derive(Debug)]
pub(crate) enum ControlMsg {
    Approve { step: String },
    Pause,
    Resume { overlay: Option<Context> },
    Cancel { rollback: bool, reason: String },
}

/// Everything a drive loop can receive.
#[derive(Debug)]
pub(crate) enum DriverMsg {
    Completion(StepCompletion),
    Control(ControlMsg),
    /// A step's retry backoff elapsed.
    RetryDue(String),
}

/// Live drive loops, keyed by workflow execution id.
pub(crate) type DriverRoutes = Arc<DashMap<Uuid, mpsc::UnboundedSender<DriverMsg>>>;

/// Completion sink for step runs.
pub struct StepRouter {
    routes: DriverRoutes,
}

impl StepRouter {
    pub(crate) fn new(routes: DriverRoutes) -> Self {
        Self { routes }
    }
}

#[async_trait]
impl RunSink for StepRouter {
    async fn on_outcome(&self, run: JobRun, outcome: RunOutcome) {
        let RunKind::Step {
            workflow_execution,
            step,
        } = run.kind
        else {
            error!(job = %run.job_name, "step router received a job run");
            return;
        };

        let completion = DriverMsg::Completion(StepCompletion {
            step,
            verdict: outcome.verdict,
            attempt: run.attempt,
        });

        match self.routes.get(&workflow_execution) {
            Some(tx) => {
                if tx.send(completion).is_err() {
                    debug!(%workflow_execution, "drive loop gone, dropping completion");
                }
            }
            None => debug!(%workflow_execution, "no drive loop for completion"),
        }
    }
}
