//! Workflow builder and DAG validation
//!
//! Validation rules, enforced in [`WorkflowBuilder::build`]:
//! 1. Step names are unique within the workflow.
//! 2. Every edge, `depends_on`, and group reference names an existing step.
//! 3. The expanded graph is acyclic (topological sort must succeed).

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;

use super::step::Step;
use super::{Trigger, Workflow, WorkflowState};

/// Errors from workflow construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    /// Workflow names share the job charset.
    #[error("invalid workflow name {0:?}: expected [a-z0-9_]+")]
    InvalidName(String),

    /// A workflow needs at least one step.
    #[error("workflow {0:?} has no steps")]
    Empty(String),

    /// Two steps share a name.
    #[error("duplicate step name {0:?}")]
    DuplicateStep(String),

    /// An edge or `depends_on` references a missing step.
    #[error("step {referenced:?} referenced by {by:?} does not exist")]
    UnknownStep { referenced: String, by: String },

    /// `after_group` names a group no step belongs to.
    #[error("group {group:?} referenced by {by:?} has no members")]
    UnknownGroup { group: String, by: String },

    /// The graph contains a cycle.
    #[error("workflow graph contains a cycle")]
    CycleDetected,
}

/// Builder producing an immutable, validated [`Workflow`].
///
/// The builder is the only way to make one; it is carried explicitly on
/// the call stack, so there is no hidden registration state anywhere.
#[derive(Debug)]
pub struct WorkflowBuilder {
    name: String,
    queue: String,
    steps: Vec<Step>,
    edges: Vec<(String, String)>,
    trigger: Trigger,
    timeout: Option<Duration>,
}

impl WorkflowBuilder {
    pub(super) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: "default".to_string(),
            steps: vec![],
            edges: vec![],
            trigger: Trigger::Manual,
            timeout: None,
        }
    }

    /// Add a step.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Add a directed edge `from -> to`.
    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    /// Default queue for steps without an override.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Overall run budget.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Validate and produce the workflow.
    pub fn build(self) -> Result<Workflow, WorkflowError> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(WorkflowError::InvalidName(self.name));
        }
        if self.steps.is_empty() {
            return Err(WorkflowError::Empty(self.name));
        }

        // Unique step names.
        let mut steps: HashMap<String, Step> = HashMap::with_capacity(self.steps.len());
        for step in self.steps {
            if steps.contains_key(&step.name) {
                return Err(WorkflowError::DuplicateStep(step.name));
            }
            steps.insert(step.name.clone(), step);
        }

        // Group membership, needed to expand `after_group`.
        let mut groups: HashMap<String, Vec<String>> = HashMap::new();
        for step in steps.values() {
            if let Some(group) = &step.group {
                groups.entry(group.clone()).or_default().push(step.name.clone());
            }
        }

        // Expand explicit edges, `depends_on`, and group fan-ins into one
        // deduplicated edge set.
        let mut edges: BTreeSet<(String, String)> = BTreeSet::new();
        for (from, to) in &self.edges {
            for endpoint in [from, to] {
                if !steps.contains_key(endpoint) {
                    return Err(WorkflowError::UnknownStep {
                        referenced: endpoint.clone(),
                        by: format!("edge {from} -> {to}"),
                    });
                }
            }
            edges.insert((from.clone(), to.clone()));
        }
        for step in steps.values() {
            for dep in &step.depends_on {
                if !steps.contains_key(dep) {
                    return Err(WorkflowError::UnknownStep {
                        referenced: dep.clone(),
                        by: step.name.clone(),
                    });
                }
                edges.insert((dep.clone(), step.name.clone()));
            }
            if let Some(group) = &step.after_group {
                let members = groups.get(group).ok_or_else(|| WorkflowError::UnknownGroup {
                    group: group.clone(),
                    by: step.name.clone(),
                })?;
                for member in members {
                    edges.insert((member.clone(), step.name.clone()));
                }
            }
        }
        let edges: Vec<(String, String)> = edges.into_iter().collect();

        let topo_order = topological_sort(&steps, &edges)?;

        let mut preds: HashMap<String, Vec<String>> = HashMap::new();
        let mut succs: HashMap<String, Vec<String>> = HashMap::new();
        for (from, to) in &edges {
            preds.entry(to.clone()).or_default().push(from.clone());
            succs.entry(from.clone()).or_default().push(to.clone());
        }

        Ok(Workflow {
            name: self.name,
            queue: self.queue,
            steps,
            edges,
            topo_order,
            trigger: self.trigger,
            timeout: self.timeout,
            state: WorkflowState::Enabled,
            preds,
            succs,
        })
    }
}

/// Kahn's algorithm; fails iff the graph has a cycle.
fn topological_sort(
    steps: &HashMap<String, Step>,
    edges: &[(String, String)],
) -> Result<Vec<String>, WorkflowError> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();

    let mut names: Vec<&str> = steps.keys().map(String::as_str).collect();
    names.sort();
    for name in &names {
        adjacency.entry(name).or_default();
        in_degree.entry(name).or_insert(0);
    }
    for (from, to) in edges {
        adjacency.entry(from.as_str()).or_default().push(to.as_str());
        *in_degree.entry(to.as_str()).or_insert(0) += 1;
    }

    let mut queue: VecDeque<&str> = names
        .iter()
        .filter(|name| in_degree[*name] == 0)
        .copied()
        .collect();

    let mut sorted: Vec<String> = Vec::with_capacity(steps.len());
    let mut visited: HashSet<&str> = HashSet::new();

    while let Some(name) = queue.pop_front() {
        if !visited.insert(name) {
            continue;
        }
        sorted.push(name.to_owned());
        if let Some(neighbors) = adjacency.get(name) {
            for &next in neighbors {
                let degree = in_degree.entry(next).or_insert(0);
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if sorted.len() != steps.len() {
        return Err(WorkflowError::CycleDetected);
    }
    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_chain_sorts_in_order() {
        let wf = Workflow::builder("etl")
            .step(Step::new("extract", "etl.extract"))
            .step(Step::new("transform", "etl.transform"))
            .step(Step::new("load", "etl.load"))
            .edge("extract", "transform")
            .edge("transform", "load")
            .build()
            .unwrap();
        assert_eq!(wf.topo_order, vec!["extract", "transform", "load"]);
    }

    #[test]
    fn diamond_keeps_root_first_and_sink_last() {
        let wf = Workflow::builder("diamond")
            .step(Step::new("a", "h.a"))
            .step(Step::new("b", "h.b"))
            .step(Step::new("c", "h.c"))
            .step(Step::new("d", "h.d"))
            .edge("a", "b")
            .edge("a", "c")
            .edge("b", "d")
            .edge("c", "d")
            .build()
            .unwrap();
        assert_eq!(wf.topo_order.first().unwrap(), "a");
        assert_eq!(wf.topo_order.last().unwrap(), "d");
    }

    #[test]
    fn cycle_is_rejected() {
        let result = Workflow::builder("loopy")
            .step(Step::new("a", "h.a"))
            .step(Step::new("b", "h.b"))
            .edge("a", "b")
            .edge("b", "a")
            .build();
        assert_eq!(result.unwrap_err(), WorkflowError::CycleDetected);
    }

    #[test]
    fn self_edge_is_a_cycle() {
        let result = Workflow::builder("selfie")
            .step(Step::new("a", "h.a"))
            .edge("a", "a")
            .build();
        assert_eq!(result.unwrap_err(), WorkflowError::CycleDetected);
    }

    #[test]
    fn unknown_edge_endpoint_is_rejected() {
        let result = Workflow::builder("w")
            .step(Step::new("a", "h.a"))
            .edge("a", "ghost")
            .build();
        assert!(matches!(
            result,
            Err(WorkflowError::UnknownStep { referenced, .. }) if referenced == "ghost"
        ));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let result = Workflow::builder("w")
            .step(Step::new("a", "h.a").depends_on("ghost"))
            .build();
        assert!(matches!(result, Err(WorkflowError::UnknownStep { .. })));
    }

    #[test]
    fn duplicate_step_is_rejected() {
        let result = Workflow::builder("w")
            .step(Step::new("a", "h.a"))
            .step(Step::new("a", "h.other"))
            .build();
        assert_eq!(result.unwrap_err(), WorkflowError::DuplicateStep("a".into()));
    }

    #[test]
    fn group_fan_in_expands_to_edges() {
        let wf = Workflow::builder("pipeline")
            .step(Step::new("fetch", "p.fetch"))
            .step(Step::new("a", "p.a").depends_on("fetch").in_group("transforms"))
            .step(Step::new("b", "p.b").depends_on("fetch").in_group("transforms"))
            .step(Step::new("c", "p.c").depends_on("fetch").in_group("transforms"))
            .step(Step::new("merge", "p.merge").after_group("transforms"))
            .build()
            .unwrap();

        let mut merge_preds = wf.predecessors("merge").to_vec();
        merge_preds.sort();
        assert_eq!(merge_preds, vec!["a", "b", "c"]);
        assert_eq!(wf.roots(), vec!["fetch"]);
    }

    #[test]
    fn empty_group_reference_is_rejected() {
        let result = Workflow::builder("w")
            .step(Step::new("merge", "h.merge").after_group("transforms"))
            .build();
        assert!(matches!(result, Err(WorkflowError::UnknownGroup { .. })));
    }

    #[test]
    fn empty_workflow_is_rejected() {
        assert!(matches!(
            Workflow::builder("w").build(),
            Err(WorkflowError::Empty(_))
        ));
    }

    #[test]
    fn invalid_name_is_rejected() {
        assert!(matches!(
            Workflow::builder("Bad Name").step(Step::new("a", "h.a")).build(),
            Err(WorkflowError::InvalidName(_))
        ));
    }
}
