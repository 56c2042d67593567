//! Transition tables, retry policy, and the step graph.
//!
//! Both state machines are fail-closed: a (state, target) pair absent from
//! the table is rejected with a typed error, never silently ignored. The
//! retry policy and the graph's ordering rules live here too, so the
//! executor holds no transition logic of its own.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::domain::{ErrorClass, RunState, StepDefinition, StepState};

/// An attempted transition not present in the table
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid run state transition: {from} -> {to}")]
    Run { from: RunState, to: RunState },

    #[error("invalid step state transition: {from} -> {to} (step '{step_id}')")]
    Step {
        step_id: String,
        from: StepState,
        to: StepState,
    },
}

/// Run-level state machine
pub struct RunStateMachine;

impl RunStateMachine {
    /// States reachable from `current`
    fn allowed(current: RunState) -> &'static [RunState] {
        match current {
            RunState::Created => &[RunState::PreflightValidated, RunState::Failed],
            RunState::PreflightValidated => &[RunState::Executing, RunState::Failed],
            RunState::Executing => &[RunState::Blocked, RunState::Failed, RunState::Succeeded],
            RunState::Blocked => &[
                RunState::Executing,
                RunState::Failed,
                RunState::RolledBack,
            ],
            RunState::Failed => &[RunState::RolledBack],
            RunState::Succeeded => &[],
            RunState::RolledBack => &[],
        }
    }

    /// Check whether a transition is valid
    pub fn can_transition(current: RunState, target: RunState) -> bool {
        Self::allowed(current).contains(&target)
    }

    /// Validate a transition, rejecting anything absent from the table
    pub fn validate_transition(current: RunState, target: RunState) -> Result<(), TransitionError> {
        if !Self::can_transition(current, target) {
            return Err(TransitionError::Run {
                from: current,
                to: target,
            });
        }
        Ok(())
    }
}

/// Step-level state machine
pub struct StepStateMachine;

impl StepStateMachine {
    fn allowed(current: StepState) -> &'static [StepState] {
        match current {
            StepState::Pending => &[StepState::Running, StepState::Skipped],
            // Running -> Pending is the retry transition; Running -> Running
            // supersedes an attempt interrupted mid-step
            StepState::Running => &[
                StepState::Succeeded,
                StepState::Failed,
                StepState::Pending,
                StepState::Running,
            ],
            // Failed -> Running is a re-run after resumption
            StepState::Failed => &[StepState::Running, StepState::Compensated],
            StepState::Succeeded => &[],
            StepState::Compensated => &[],
            StepState::Skipped => &[],
        }
    }

    /// Check whether a transition is valid
    pub fn can_transition(current: StepState, target: StepState) -> bool {
        Self::allowed(current).contains(&target)
    }

    /// Validate a transition, rejecting anything absent from the table
    pub fn validate_transition(
        step_id: &str,
        current: StepState,
        target: StepState,
    ) -> Result<(), TransitionError> {
        if !Self::can_transition(current, target) {
            return Err(TransitionError::Step {
                step_id: step_id.to_string(),
                from: current,
                to: target,
            });
        }
        Ok(())
    }
}

/// Base backoff delay in seconds
const BACKOFF_BASE_SECS: f64 = 2.0;

/// Cap on the backoff delay before jitter
const BACKOFF_CAP_SECS: f64 = 60.0;

/// Retry eligibility and backoff schedule
pub struct RetryPolicy;

impl RetryPolicy {
    /// Check whether a failed attempt may be retried.
    ///
    /// Hard-gate failures on hard-gate steps never retry; everything else
    /// follows the step's own class list and budget.
    pub fn allows_retry(step: &StepDefinition, error_class: ErrorClass, attempt: u32) -> bool {
        if step.hard_gate && error_class == ErrorClass::HardGateFailed {
            return false;
        }
        step.allows_retry(error_class, attempt)
    }

    /// Exponential backoff: 2s doubling per attempt, capped at 60s,
    /// with +/-10% jitter so retries across steps do not synchronize.
    pub fn backoff_delay(attempt: u32) -> Duration {
        let exponent = attempt.min(31) as i32;
        let delay = (BACKOFF_BASE_SECS * 2f64.powi(exponent)).min(BACKOFF_CAP_SECS);
        let jitter = rand::thread_rng().gen_range(-0.1..=0.1) * delay;
        Duration::from_secs_f64((delay + jitter).max(0.0))
    }
}

/// A structurally invalid step graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("duplicate step id: '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle involving steps: {0:?}")]
    Cycle(Vec<String>),
}

/// Validated step graph with a deterministic execution order.
///
/// The order is topological over the declared dependencies; ties break by
/// declaration order, so the same definitions always produce the same walk.
#[derive(Debug, Clone)]
pub struct StepGraph {
    steps: HashMap<String, StepDefinition>,
    order: Vec<String>,
}

impl StepGraph {
    /// Validate definitions and compute the execution order.
    ///
    /// Rejects duplicate step ids, references to unknown steps, and cycles.
    pub fn new(definitions: &[StepDefinition]) -> Result<Self, GraphError> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, step) in definitions.iter().enumerate() {
            if index.insert(step.step_id.as_str(), i).is_some() {
                return Err(GraphError::DuplicateStep(step.step_id.clone()));
            }
        }

        for step in definitions {
            for dep in &step.depends_on {
                if !index.contains_key(dep.as_str()) {
                    return Err(GraphError::UnknownDependency {
                        step: step.step_id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Kahn's algorithm; the ready set is ordered by declaration index
        let mut indegree: Vec<usize> = definitions.iter().map(|s| s.depends_on.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); definitions.len()];
        for (i, step) in definitions.iter().enumerate() {
            for dep in &step.depends_on {
                dependents[index[dep.as_str()]].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(definitions.len());
        while let Some(&i) = ready.iter().next() {
            ready.remove(&i);
            order.push(definitions[i].step_id.clone());
            for &j in &dependents[i] {
                indegree[j] -= 1;
                if indegree[j] == 0 {
                    ready.insert(j);
                }
            }
        }

        if order.len() != definitions.len() {
            let ordered: HashSet<&str> = order.iter().map(|s| s.as_str()).collect();
            let cycle: Vec<String> = definitions
                .iter()
                .filter(|s| !ordered.contains(s.step_id.as_str()))
                .map(|s| s.step_id.clone())
                .collect();
            return Err(GraphError::Cycle(cycle));
        }

        let steps = definitions
            .iter()
            .map(|s| (s.step_id.clone(), s.clone()))
            .collect();

        Ok(Self { steps, order })
    }

    /// Execution order (topological, declaration-order ties)
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Look up a step definition by id
    pub fn get(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.get(step_id)
    }

    /// Direct dependencies of `step_id` that have not succeeded yet
    pub fn unmet_dependencies(&self, step_id: &str, completed: &HashSet<String>) -> Vec<String> {
        match self.steps.get(step_id) {
            Some(step) => step
                .depends_on
                .iter()
                .filter(|d| !completed.contains(*d))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }
}
