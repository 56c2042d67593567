//! Run states and the in-memory execution context.
//!
//! A [`RunContext`] is a cache of what the event log already records. It is
//! reconstructable from the log at any time and holds nothing the log does
//! not; the log is the source of truth, never the other way around.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::step::{StepDefinition, StepState};

/// Run-level states with fail-closed semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Run created, graph not yet validated
    Created,

    /// Step graph validated, execution not yet started
    PreflightValidated,

    /// Steps are executing
    Executing,

    /// Waiting on an external manual action
    Blocked,

    /// Run failed
    Failed,

    /// All reachable steps resolved successfully
    Succeeded,

    /// Compensation applied after failure (reserved)
    RolledBack,
}

impl RunState {
    /// Terminal states refuse resumption
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::RolledBack)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::PreflightValidated => "preflight_validated",
            Self::Executing => "executing",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::Succeeded => "succeeded",
            Self::RolledBack => "rolled_back",
        }
    }

    /// Parse the wire name back into a state
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "preflight_validated" => Some(Self::PreflightValidated),
            "executing" => Some(Self::Executing),
            "blocked" => Some(Self::Blocked),
            "failed" => Some(Self::Failed),
            "succeeded" => Some(Self::Succeeded),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime execution context for one pipeline run.
///
/// Every field is derivable by replaying the run's event log.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    /// Run identifier
    pub run_id: String,

    /// Current run state
    pub run_state: RunState,

    /// Per-step derived state
    pub step_states: HashMap<String, StepState>,

    /// Per-step attempt counters
    pub step_attempts: HashMap<String, u32>,

    /// Steps that have succeeded
    pub completed_steps: HashSet<String>,

    /// Hard gates that failed permanently
    pub failed_hard_gates: HashSet<String>,

    /// Gated steps with a recorded external approval
    pub overrides: HashSet<String>,

    /// Artifact paths by emitting step
    pub artifacts: HashMap<String, String>,
}

impl RunContext {
    /// Create a fresh context in the created state
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            run_state: RunState::Created,
            step_states: HashMap::new(),
            step_attempts: HashMap::new(),
            completed_steps: HashSet::new(),
            failed_hard_gates: HashSet::new(),
            overrides: HashSet::new(),
            artifacts: HashMap::new(),
        }
    }

    /// Initialize every defined step to pending, leaving known states alone
    pub fn initialize_steps(&mut self, steps: &[StepDefinition]) {
        for step in steps {
            self.step_states
                .entry(step.step_id.clone())
                .or_insert(StepState::Pending);
            self.step_attempts.entry(step.step_id.clone()).or_insert(0);
        }
    }

    /// Current state of a step, pending if the log never mentioned it
    pub fn step_state(&self, step_id: &str) -> StepState {
        self.step_states
            .get(step_id)
            .copied()
            .unwrap_or(StepState::Pending)
    }

    /// Current attempt counter for a step
    pub fn attempt(&self, step_id: &str) -> u32 {
        self.step_attempts.get(step_id).copied().unwrap_or(0)
    }

    /// Hard gates that failed and have no recorded override
    pub fn unresolved_hard_gates(&self) -> Vec<String> {
        let mut gates: Vec<String> = self
            .failed_hard_gates
            .difference(&self.overrides)
            .cloned()
            .collect();
        gates.sort();
        gates
    }

    /// First step, in the given order, that is not yet resolved.
    ///
    /// Resolved means succeeded or skipped; a failed step still counts as
    /// unresolved because resumption may re-run it.
    pub fn first_unresolved<'a>(&self, order: &'a [String]) -> Option<&'a str> {
        order
            .iter()
            .map(|s| s.as_str())
            .find(|step_id| !matches!(self.step_state(step_id), StepState::Succeeded | StepState::Skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_parse_roundtrip() {
        for state in [
            RunState::Created,
            RunState::PreflightValidated,
            RunState::Executing,
            RunState::Blocked,
            RunState::Failed,
            RunState::Succeeded,
            RunState::RolledBack,
        ] {
            assert_eq!(RunState::parse(state.as_str()), Some(state));
        }
        assert_eq!(RunState::parse("paused"), None);
    }

    #[test]
    fn test_terminal_run_states() {
        assert!(RunState::Succeeded.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::RolledBack.is_terminal());
        assert!(!RunState::Blocked.is_terminal());
        assert!(!RunState::Executing.is_terminal());
    }

    #[test]
    fn test_first_unresolved_skips_resolved_steps() {
        let mut ctx = RunContext::new("run-1");
        let order = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        ctx.step_states.insert("a".into(), StepState::Succeeded);
        ctx.step_states.insert("b".into(), StepState::Skipped);

        assert_eq!(ctx.first_unresolved(&order), Some("c"));

        ctx.step_states.insert("c".into(), StepState::Succeeded);
        assert_eq!(ctx.first_unresolved(&order), None);
    }

    #[test]
    fn test_failed_step_is_unresolved() {
        let mut ctx = RunContext::new("run-1");
        let order = vec!["a".to_string(), "b".to_string()];

        ctx.step_states.insert("a".into(), StepState::Failed);
        assert_eq!(ctx.first_unresolved(&order), Some("a"));
    }

    #[test]
    fn test_unresolved_hard_gates_respects_overrides() {
        let mut ctx = RunContext::new("run-1");
        ctx.failed_hard_gates.insert("verify_artifacts".into());
        ctx.failed_hard_gates.insert("phase_benchmark".into());
        ctx.overrides.insert("phase_benchmark".into());

        assert_eq!(ctx.unresolved_hard_gates(), vec!["verify_artifacts"]);
    }
}
