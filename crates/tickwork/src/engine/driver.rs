//! Workflow drive loop
//!
//! One logical task per execution. Each iteration dispatches every ready
//! step, then waits for a completion, a control message, a retry timer, or
//! the workflow deadline. Steps observe topological order by construction:
//! a step dispatches only once all its predecessors are completed or
//! skipped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::dispatch::{Dispatcher, JobRun, RunKind, RunLock, RunVerdict};
use crate::job::{ErrorClass, ErrorInfo, PerformOutcome};
use crate::persistence::Store;
use crate::registry::{HandlerRegistry, JobContext};
use crate::workflow::{Workflow, WorkflowExecState, WorkflowExecution};

use super::router::{ControlMsg, DriverMsg, DriverRoutes, StepCompletion};
use super::EngineConfig;

/// Per-execution driver; owns the mutable execution record while the run
/// is alive and persists it through the store on every transition.
pub(crate) struct Driver {
    pub store: Arc<dyn Store>,
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<HandlerRegistry>,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
    pub routes: DriverRoutes,
    pub shutdown: CancellationToken,
}

impl Driver {
    pub async fn drive(
        self,
        workflow: Arc<Workflow>,
        mut exec: WorkflowExecution,
        mut rx: mpsc::UnboundedReceiver<DriverMsg>,
    ) {
        let exec_id = exec.id;
        info!(workflow = %workflow.name, execution = %exec_id, "workflow execution started");

        let mut approvals: HashSet<String> = HashSet::new();
        let mut held_retries: HashSet<String> = HashSet::new();
        let mut step_exec_ids: HashMap<String, Uuid> = HashMap::new();
        let mut paused = false;

        exec.state = WorkflowExecState::Running;
        self.persist(&exec).await;

        let deadline = workflow
            .timeout
            .map(|t| tokio::time::Instant::now() + t);
        let timeout_fut = async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timeout_fut);

        'drive: loop {
            if !paused {
                let progressed = self.advance(&workflow, &mut exec, &approvals, &mut step_exec_ids);
                if progressed {
                    self.persist(&exec).await;
                }

                if exec.running_steps.is_empty() {
                    if exec.pending_steps.is_empty() {
                        exec.state = WorkflowExecState::Completed;
                        exec.completed_at = Some(self.clock.now());
                        self.persist(&exec).await;
                        info!(execution = %exec_id, "workflow completed");
                        break 'drive;
                    }
                    if self.gated_on_approval(&workflow, &exec, &approvals) {
                        if exec.state != WorkflowExecState::Paused {
                            exec.state = WorkflowExecState::Paused;
                            self.persist(&exec).await;
                            debug!(execution = %exec_id, "waiting for approval");
                        }
                    } else {
                        // Unreachable for a validated DAG, but never spin.
                        exec.state = WorkflowExecState::Failed;
                        exec.error = Some(ErrorInfo::permanent(
                            "workflow deadlocked with no runnable steps",
                        ));
                        exec.completed_at = Some(self.clock.now());
                        self.persist(&exec).await;
                        warn!(execution = %exec_id, "workflow deadlocked");
                        break 'drive;
                    }
                }
            }

            let msg = tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break 'drive,
                },
                _ = &mut timeout_fut => {
                    let error = ErrorInfo::timeout("workflow exceeded its timeout");
                    self.fail_with_rollback(&workflow, &mut exec, error, &step_exec_ids)
                        .await;
                    break 'drive;
                }
                _ = self.shutdown.cancelled() => {
                    debug!(execution = %exec_id, "engine shutdown, parking execution");
                    break 'drive;
                }
            };

            match msg {
                DriverMsg::Completion(completion) => {
                    if !exec.running_steps.contains(&completion.step) {
                        debug!(step = %completion.step, "stale completion ignored");
                        continue;
                    }
                    if self
                        .handle_completion(
                            &workflow,
                            &mut exec,
                            completion,
                            &mut held_retries,
                            paused,
                            &step_exec_ids,
                        )
                        .await
                    {
                        break 'drive;
                    }
                }

                DriverMsg::RetryDue(step) => {
                    if !exec.running_steps.contains(&step) {
                        continue;
                    }
                    if paused {
                        held_retries.insert(step);
                        continue;
                    }
                    let attempt = exec.step_attempts.get(&step).copied().unwrap_or(0) + 1;
                    self.dispatch_step(&workflow, &mut exec, &step, attempt, &mut step_exec_ids);
                }

                DriverMsg::Control(ControlMsg::Approve { step }) => {
                    debug!(execution = %exec_id, step, "approval received");
                    approvals.insert(step);
                    if !paused && exec.state == WorkflowExecState::Paused {
                        exec.state = WorkflowExecState::Running;
                    }
                }

                DriverMsg::Control(ControlMsg::Pause) => {
                    paused = true;
                    exec.state = WorkflowExecState::Paused;
                    self.persist(&exec).await;
                    debug!(execution = %exec_id, "execution paused");
                }

                DriverMsg::Control(ControlMsg::Resume { overlay }) => {
                    if let Some(overlay) = overlay {
                        for (key, value) in overlay {
                            exec.context.insert(key, value);
                        }
                    }
                    paused = false;
                    if exec.state == WorkflowExecState::Paused {
                        exec.state = WorkflowExecState::Running;
                    }
                    // Retries that came due while paused fire now.
                    for step in held_retries.drain().collect::<Vec<_>>() {
                        if exec.running_steps.contains(&step) {
                            let attempt =
                                exec.step_attempts.get(&step).copied().unwrap_or(0) + 1;
                            self.dispatch_step(
                                &workflow,
                                &mut exec,
                                &step,
                                attempt,
                                &mut step_exec_ids,
                            );
                        }
                    }
                    self.persist(&exec).await;
                    debug!(execution = %exec_id, "execution resumed");
                }

                DriverMsg::Control(ControlMsg::Cancel { rollback, reason }) => {
                    self.cancel(&workflow, &mut exec, rollback, &reason, &step_exec_ids)
                        .await;
                    break 'drive;
                }
            }
        }

        self.routes.remove(&exec_id);
    }

    /// Dispatch every ready step, cascading skips. Returns whether any
    /// membership changed.
    fn advance(
        &self,
        workflow: &Workflow,
        exec: &mut WorkflowExecution,
        approvals: &HashSet<String>,
        step_exec_ids: &mut HashMap<String, Uuid>,
    ) -> bool {
        let mut any_change = false;
        loop {
            let mut changed = false;
            let candidates: Vec<String> = exec
                .pending_steps
                .iter()
                .filter(|name| {
                    workflow
                        .predecessors(name)
                        .iter()
                        .all(|pred| exec.is_satisfied(pred))
                })
                .cloned()
                .collect();

            for name in candidates {
                let Some(step) = workflow.steps.get(&name) else {
                    continue;
                };

                // Predicate gate: false means skipped, and successors
                // treat the step as satisfied.
                if let Some(when) = &step.when {
                    if !when(&exec.context) {
                        exec.pending_steps.remove(&name);
                        exec.skipped_steps.insert(name.clone());
                        self.enable_successors(workflow, exec, &name);
                        debug!(step = %name, "step skipped by predicate");
                        changed = true;
                        continue;
                    }
                }

                // Approval gate: stays pending until the signal arrives.
                if step.await_approval && !approvals.contains(&name) {
                    continue;
                }

                exec.pending_steps.remove(&name);
                exec.running_steps.insert(name.clone());
                if exec.state == WorkflowExecState::Paused {
                    exec.state = WorkflowExecState::Running;
                }
                let attempt = exec.step_attempts.get(&name).copied().unwrap_or(0) + 1;
                self.dispatch_step(workflow, exec, &name, attempt, step_exec_ids);
                changed = true;
            }

            if !changed {
                break;
            }
            any_change = true;
        }
        any_change
    }

    /// Handle a step completion; returns true when the execution is done.
    #[allow(clippy::too_many_arguments)]
    async fn handle_completion(
        &self,
        workflow: &Workflow,
        exec: &mut WorkflowExecution,
        completion: StepCompletion,
        held_retries: &mut HashSet<String>,
        paused: bool,
        step_exec_ids: &HashMap<String, Uuid>,
    ) -> bool {
        let step_name = completion.step.clone();
        match completion.verdict {
            RunVerdict::Success(result) => {
                exec.running_steps.remove(&step_name);
                exec.completed_steps.push(step_name.clone());
                if let Some(result) = result {
                    // Object results merge into the shared context.
                    if let Value::Object(changes) = &result {
                        for (key, value) in changes {
                            exec.context.insert(key.clone(), value.clone());
                        }
                    }
                    exec.step_results.insert(step_name.clone(), result);
                }
                self.enable_successors(workflow, exec, &step_name);
                self.persist(exec).await;
                false
            }

            RunVerdict::Discarded { reason } => {
                // A discarded step counts as skipped: downstream steps
                // proceed without its contribution.
                debug!(step = %step_name, reason, "step discarded");
                exec.running_steps.remove(&step_name);
                exec.skipped_steps.insert(step_name.clone());
                self.enable_successors(workflow, exec, &step_name);
                self.persist(exec).await;
                false
            }

            RunVerdict::Cancelled { reason } => {
                let error = ErrorInfo::new(ErrorClass::Unknown, format!("step cancelled: {reason}"));
                exec.step_errors.insert(step_name.clone(), error.clone());
                self.fail_with_rollback(workflow, exec, error, step_exec_ids)
                    .await;
                true
            }

            RunVerdict::Failure(_) | RunVerdict::TimedOut | RunVerdict::RetryRequested { .. } => {
                let (error, explicit_delay) = match completion.verdict {
                    RunVerdict::Failure(error) => (error, None),
                    RunVerdict::TimedOut => (
                        ErrorInfo::timeout("step exceeded its timeout budget"),
                        None,
                    ),
                    RunVerdict::RetryRequested { delay } => (
                        ErrorInfo::retryable("retry requested by step"),
                        Some(delay),
                    ),
                    _ => unreachable!(),
                };

                let step = &workflow.steps[&step_name];
                let budget = step.max_retries.unwrap_or(self.config.default_step_retries);
                let attempt = completion.attempt;
                exec.step_attempts.insert(step_name.clone(), attempt);

                if error.class != ErrorClass::Permanent && attempt <= budget {
                    let delay = explicit_delay
                        .unwrap_or_else(|| self.config.step_retry.delay_after_attempt(attempt));
                    debug!(
                        step = %step_name,
                        attempt,
                        delay_ms = delay.as_millis(),
                        "scheduling step retry"
                    );
                    if paused {
                        held_retries.insert(step_name);
                        return false;
                    }
                    // The step stays in running_steps while it waits.
                    let routes = Arc::clone(&self.routes);
                    let exec_id = exec.id;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Some(tx) = routes.get(&exec_id) {
                            let _ = tx.send(DriverMsg::RetryDue(step_name));
                        }
                    });
                    return false;
                }

                exec.step_errors.insert(step_name.clone(), error.clone());
                self.fail_with_rollback(workflow, exec, error, step_exec_ids)
                    .await;
                true
            }
        }
    }

    /// True when some pending step is only waiting on a human approval.
    fn gated_on_approval(
        &self,
        workflow: &Workflow,
        exec: &WorkflowExecution,
        approvals: &HashSet<String>,
    ) -> bool {
        exec.pending_steps.iter().any(|name| {
            workflow.steps.get(name).map_or(false, |step| {
                step.await_approval
                    && !approvals.contains(name)
                    && workflow
                        .predecessors(name)
                        .iter()
                        .all(|pred| exec.is_satisfied(pred))
            })
        })
    }

    /// Make every successor of `step` eligible for consideration.
    fn enable_successors(&self, workflow: &Workflow, exec: &mut WorkflowExecution, step: &str) {
        for succ in workflow.successors(step) {
            if !exec.knows_step(succ) {
                exec.pending_steps.insert(succ.clone());
            }
        }
    }

    fn dispatch_step(
        &self,
        workflow: &Workflow,
        exec: &mut WorkflowExecution,
        name: &str,
        attempt: u32,
        step_exec_ids: &mut HashMap<String, Uuid>,
    ) {
        let step = &workflow.steps[name];
        let run = JobRun {
            execution_id: Uuid::now_v7(),
            job_name: format!("{}/{}", workflow.name, name),
            handler: step.handler.clone(),
            args: Value::Object(exec.context.clone()),
            queue: step.queue.clone().unwrap_or_else(|| workflow.queue.clone()),
            priority: 5,
            attempt,
            max_retries: step.max_retries.unwrap_or(self.config.default_step_retries),
            timeout: step.timeout.unwrap_or(self.config.default_step_timeout),
            lock: RunLock::None,
            kind: RunKind::Step {
                workflow_execution: exec.id,
                step: name.to_string(),
            },
            first_failed_at: None,
        };
        step_exec_ids.insert(name.to_string(), run.execution_id);
        exec.step_attempts.insert(name.to_string(), attempt);

        if let Err(e) = self.dispatcher.push(run) {
            // Feed the rejection back through the normal completion path.
            warn!(step = name, "step push rejected: {e}");
            if let Some(tx) = self.routes.get(&exec.id) {
                let _ = tx.send(DriverMsg::Completion(StepCompletion {
                    step: name.to_string(),
                    verdict: RunVerdict::Failure(ErrorInfo::retryable(e.to_string())),
                    attempt,
                }));
            }
        }
    }

    /// Terminal failure: cancel in-flight steps, run the rollback chain,
    /// and preserve the context as it was at failure.
    async fn fail_with_rollback(
        &self,
        workflow: &Workflow,
        exec: &mut WorkflowExecution,
        error: ErrorInfo,
        step_exec_ids: &HashMap<String, Uuid>,
    ) {
        for step in exec.running_steps.clone() {
            if let Some(id) = step_exec_ids.get(&step) {
                self.dispatcher.cancel(*id, "workflow failed").await;
            }
        }
        let in_flight: Vec<String> = exec.running_steps.iter().cloned().collect();
        exec.running_steps.clear();
        exec.cancelled_steps.extend(in_flight);

        exec.state = WorkflowExecState::Failed;
        exec.error = Some(error);
        exec.completed_at = Some(self.clock.now());

        self.run_rollback_chain(workflow, exec).await;
        self.persist(exec).await;
        warn!(
            workflow = %workflow.name,
            execution = %exec.id,
            "workflow failed"
        );
    }

    async fn cancel(
        &self,
        workflow: &Workflow,
        exec: &mut WorkflowExecution,
        rollback: bool,
        reason: &str,
        step_exec_ids: &HashMap<String, Uuid>,
    ) {
        for step in exec.running_steps.clone() {
            if let Some(id) = step_exec_ids.get(&step) {
                self.dispatcher.cancel(*id, reason).await;
            }
        }
        let in_flight: Vec<String> = exec.running_steps.iter().cloned().collect();
        exec.running_steps.clear();
        exec.cancelled_steps.extend(in_flight);
        // Pending work is dropped without a record.
        exec.pending_steps.clear();

        exec.state = WorkflowExecState::Cancelled;
        exec.error = Some(ErrorInfo::new(ErrorClass::Unknown, reason.to_string()));
        exec.completed_at = Some(self.clock.now());

        if rollback {
            self.run_rollback_chain(workflow, exec).await;
        }
        self.persist(exec).await;
        info!(execution = %exec.id, reason, "workflow cancelled");
    }

    /// Invoke rollback handlers in reverse completion order. Rollback
    /// errors are logged and never halt the chain.
    async fn run_rollback_chain(&self, workflow: &Workflow, exec: &WorkflowExecution) {
        for name in exec.completed_steps.iter().rev() {
            let Some(step) = workflow.steps.get(name) else {
                continue;
            };
            let Some(rollback) = &step.rollback else {
                continue;
            };
            let Some(handler) = self.registry.get(rollback) else {
                warn!(step = %name, handler = %rollback, "rollback handler not registered");
                continue;
            };

            debug!(step = %name, handler = %rollback, "running rollback");
            let ctx = JobContext {
                job_name: format!("{}/{}:rollback", workflow.name, name),
                execution_id: Uuid::now_v7(),
                attempt: 1,
                args: Value::Object(exec.context.clone()),
                cancellation: CancellationToken::new(),
            };
            let budget = step.timeout.unwrap_or(self.config.default_step_timeout);
            match tokio::time::timeout(budget, handler(ctx)).await {
                Ok(PerformOutcome::Ok) | Ok(PerformOutcome::OkWith(_)) => {}
                Ok(other) => warn!(step = %name, ?other, "rollback reported failure"),
                Err(_) => warn!(step = %name, "rollback timed out"),
            }
        }
    }

    async fn persist(&self, exec: &WorkflowExecution) {
        if let Err(e) = self.store.record_workflow_update(exec.clone()).await {
            warn!(execution = %exec.id, "workflow update failed: {e}");
        }
    }
}
