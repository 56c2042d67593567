//! Run reconstruction and resume guards.
//!
//! Resumption trusts nothing but the event log: the context is rebuilt by a
//! strict left-fold of the log through the state machine's transition
//! tables. Any record the fold does not fully understand (unknown type,
//! missing field, unparseable state, illegal transition) is a fatal error,
//! never skipped, so a run is never resumed from a misunderstood state.

use std::path::Path;

use anyhow::{Context, Result};
use thiserror::Error;

use crate::domain::{Event, EventType, RunContext, RunState, StepState};

use super::event_log::{EventLog, EVENTS_FILE};
use super::state_machine::{RunStateMachine, StepStateMachine, TransitionError};

/// Why a run could not be reconstructed or resumed
#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("event log not found: {0}")]
    MissingLog(String),

    #[error("event log is empty")]
    EmptyLog,

    #[error("first event must be run.created, got {0:?}")]
    FirstEventNotRunCreated(EventType),

    #[error("unexpected run.created after the first event")]
    DuplicateRunCreated,

    #[error("event {event_id} belongs to run '{actual}', expected '{expected}'")]
    RunIdMismatch {
        event_id: String,
        expected: String,
        actual: String,
    },

    #[error("{event_type:?} event {event_id} is missing required field '{field}'")]
    MissingField {
        event_id: String,
        event_type: EventType,
        field: &'static str,
    },

    #[error("event {event_id} carries unknown state '{value}'")]
    UnknownState { event_id: String, value: String },

    #[error(transparent)]
    IllegalTransition(#[from] TransitionError),

    #[error("run is in terminal state {0}")]
    Terminal(RunState),

    #[error("unresolved hard gate failures block resume: {0:?}")]
    GateFailuresBlock(Vec<String>),
}

/// Rebuild a run context by folding events through the transition tables
pub fn reconstruct(events: &[Event]) -> Result<RunContext, ResumeError> {
    let first = events.first().ok_or(ResumeError::EmptyLog)?;
    if first.event_type != EventType::RunCreated {
        return Err(ResumeError::FirstEventNotRunCreated(first.event_type));
    }

    let mut ctx = RunContext::new(&first.run_id);

    for event in &events[1..] {
        if event.run_id != ctx.run_id {
            return Err(ResumeError::RunIdMismatch {
                event_id: event.event_id.to_string(),
                expected: ctx.run_id.clone(),
                actual: event.run_id.clone(),
            });
        }
        apply_event(&mut ctx, event)?;
    }

    Ok(ctx)
}

fn apply_event(ctx: &mut RunContext, event: &Event) -> Result<(), ResumeError> {
    match event.event_type {
        EventType::RunCreated => Err(ResumeError::DuplicateRunCreated),

        EventType::RunStateChanged => {
            let new_state = parse_run_state(event)?;
            RunStateMachine::validate_transition(ctx.run_state, new_state)?;
            ctx.run_state = new_state;
            Ok(())
        }

        EventType::RunCompleted => {
            let new_state = parse_run_state(event)?;
            if new_state != ctx.run_state {
                RunStateMachine::validate_transition(ctx.run_state, new_state)?;
                ctx.run_state = new_state;
            }
            Ok(())
        }

        EventType::StepStarted => {
            let step_id = require_step_id(event)?;
            transition_step(ctx, step_id, StepState::Running)?;
            ctx.step_attempts.insert(step_id.to_string(), event.attempt);
            Ok(())
        }

        EventType::StepSucceeded => {
            let step_id = require_step_id(event)?;
            transition_step(ctx, step_id, StepState::Succeeded)?;
            ctx.completed_steps.insert(step_id.to_string());
            ctx.failed_hard_gates.remove(step_id);
            Ok(())
        }

        EventType::StepFailed => {
            let step_id = require_step_id(event)?;
            transition_step(ctx, step_id, StepState::Failed)
        }

        EventType::StepRetried => {
            let step_id = require_step_id(event)?;
            transition_step(ctx, step_id, StepState::Pending)?;
            ctx.step_attempts.insert(step_id.to_string(), event.attempt);
            Ok(())
        }

        EventType::StepSkipped => {
            let step_id = require_step_id(event)?;
            transition_step(ctx, step_id, StepState::Skipped)
        }

        EventType::GateFailed => {
            let step_id = require_step_id(event)?;
            ctx.failed_hard_gates.insert(step_id.to_string());
            Ok(())
        }

        EventType::ArtifactEmitted => {
            let step_id = require_step_id(event)?;
            let path = event
                .artifact_path
                .as_deref()
                .ok_or(ResumeError::MissingField {
                    event_id: event.event_id.to_string(),
                    event_type: event.event_type,
                    field: "artifact_path",
                })?;
            ctx.artifacts.insert(step_id.to_string(), path.to_string());
            Ok(())
        }

        EventType::RunOverrideApplied => {
            let step_id = require_step_id(event)?;
            ctx.overrides.insert(step_id.to_string());
            Ok(())
        }
    }
}

fn transition_step(
    ctx: &mut RunContext,
    step_id: &str,
    target: StepState,
) -> Result<(), ResumeError> {
    let current = ctx.step_state(step_id);
    StepStateMachine::validate_transition(step_id, current, target)?;
    ctx.step_states.insert(step_id.to_string(), target);
    ctx.step_attempts.entry(step_id.to_string()).or_insert(0);
    Ok(())
}

fn require_step_id(event: &Event) -> Result<&str, ResumeError> {
    event.step_id.as_deref().ok_or(ResumeError::MissingField {
        event_id: event.event_id.to_string(),
        event_type: event.event_type,
        field: "step_id",
    })
}

fn parse_run_state(event: &Event) -> Result<RunState, ResumeError> {
    let value = event.new_state.as_deref().ok_or(ResumeError::MissingField {
        event_id: event.event_id.to_string(),
        event_type: event.event_type,
        field: "new_state",
    })?;
    RunState::parse(value).ok_or_else(|| ResumeError::UnknownState {
        event_id: event.event_id.to_string(),
        value: value.to_string(),
    })
}

/// Guards deciding whether a reconstructed run may be resumed
pub struct ResumeGuard;

impl ResumeGuard {
    /// Refuse terminal runs and unresolved hard-gate failures.
    ///
    /// A hard-gate failure blocks resume unless an override event names
    /// that gate.
    pub fn validate(ctx: &RunContext) -> Result<(), ResumeError> {
        if ctx.run_state.is_terminal() {
            return Err(ResumeError::Terminal(ctx.run_state));
        }

        let unresolved = ctx.unresolved_hard_gates();
        if !unresolved.is_empty() {
            return Err(ResumeError::GateFailuresBlock(unresolved));
        }

        Ok(())
    }
}

/// Reconstruct a run context from the log in a run directory, without
/// checking resumability. Status reporting uses this.
pub async fn reconstruct_run(run_dir: &Path) -> Result<RunContext> {
    let log_path = run_dir.join(EVENTS_FILE);
    if !log_path.exists() {
        return Err(ResumeError::MissingLog(log_path.display().to_string()).into());
    }

    let log = EventLog::open(run_dir).await?;
    let events = log.read_all().await?;
    let ctx = reconstruct(&events)
        .with_context(|| format!("failed to reconstruct run from {}", log_path.display()))?;

    Ok(ctx)
}

/// Reconstruct and validate resumability, returning a context positioned at
/// the first unresolved step
pub async fn resume_run(run_dir: &Path) -> Result<RunContext> {
    let ctx = reconstruct_run(run_dir).await?;
    ResumeGuard::validate(&ctx)
        .with_context(|| format!("cannot resume run '{}'", ctx.run_id))?;
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(run_id: &str) -> Event {
        Event::new(EventType::RunCreated, run_id).with_new_state(RunState::Created.as_str())
    }

    fn state_change(run_id: &str, from: RunState, to: RunState) -> Event {
        Event::new(EventType::RunStateChanged, run_id)
            .with_previous_state(from.as_str())
            .with_new_state(to.as_str())
    }

    #[test]
    fn test_reconstruct_requires_run_created_first() {
        let events = vec![Event::new(EventType::StepStarted, "run-1").with_step("a")];
        let err = reconstruct(&events).unwrap_err();
        assert!(matches!(err, ResumeError::FirstEventNotRunCreated(_)));
    }

    #[test]
    fn test_reconstruct_empty_log_fails() {
        assert!(matches!(reconstruct(&[]).unwrap_err(), ResumeError::EmptyLog));
    }

    #[test]
    fn test_reconstruct_rejects_run_id_mismatch() {
        let events = vec![
            created("run-1"),
            Event::new(EventType::StepStarted, "run-2").with_step("a"),
        ];
        assert!(matches!(
            reconstruct(&events).unwrap_err(),
            ResumeError::RunIdMismatch { .. }
        ));
    }

    #[test]
    fn test_reconstruct_rejects_illegal_transition() {
        // step.succeeded without a prior step.started
        let events = vec![
            created("run-1"),
            Event::new(EventType::StepSucceeded, "run-1").with_step("a"),
        ];
        assert!(matches!(
            reconstruct(&events).unwrap_err(),
            ResumeError::IllegalTransition(_)
        ));
    }

    #[test]
    fn test_reconstruct_rejects_missing_step_id() {
        let events = vec![created("run-1"), Event::new(EventType::StepStarted, "run-1")];
        assert!(matches!(
            reconstruct(&events).unwrap_err(),
            ResumeError::MissingField { field: "step_id", .. }
        ));
    }

    #[test]
    fn test_reconstruct_rejects_unknown_state() {
        let events = vec![
            created("run-1"),
            Event::new(EventType::RunStateChanged, "run-1").with_new_state("warming_up"),
        ];
        assert!(matches!(
            reconstruct(&events).unwrap_err(),
            ResumeError::UnknownState { .. }
        ));
    }

    #[test]
    fn test_guard_refuses_terminal_states() {
        let mut ctx = RunContext::new("run-1");
        ctx.run_state = RunState::Succeeded;
        assert!(matches!(
            ResumeGuard::validate(&ctx).unwrap_err(),
            ResumeError::Terminal(RunState::Succeeded)
        ));

        ctx.run_state = RunState::Failed;
        assert!(matches!(
            ResumeGuard::validate(&ctx).unwrap_err(),
            ResumeError::Terminal(RunState::Failed)
        ));
    }

    #[test]
    fn test_guard_refuses_unresolved_gate_failure() {
        let mut ctx = RunContext::new("run-1");
        ctx.run_state = RunState::Executing;
        ctx.failed_hard_gates.insert("verify".into());

        assert!(matches!(
            ResumeGuard::validate(&ctx).unwrap_err(),
            ResumeError::GateFailuresBlock(_)
        ));

        // An override for the gate unlocks resume
        ctx.overrides.insert("verify".into());
        assert!(ResumeGuard::validate(&ctx).is_ok());
    }

    #[test]
    fn test_fold_tracks_retry_attempts() {
        let events = vec![
            created("run-1"),
            state_change("run-1", RunState::Created, RunState::PreflightValidated),
            state_change("run-1", RunState::PreflightValidated, RunState::Executing),
            Event::new(EventType::StepStarted, "run-1")
                .with_step("a")
                .with_attempt(0),
            Event::new(EventType::StepRetried, "run-1")
                .with_step("a")
                .with_attempt(1),
            Event::new(EventType::StepStarted, "run-1")
                .with_step("a")
                .with_attempt(1),
            Event::new(EventType::StepSucceeded, "run-1")
                .with_step("a")
                .with_attempt(1),
        ];

        let ctx = reconstruct(&events).unwrap();
        assert_eq!(ctx.run_state, RunState::Executing);
        assert_eq!(ctx.attempt("a"), 1);
        assert_eq!(ctx.step_state("a"), StepState::Succeeded);
        assert!(ctx.completed_steps.contains("a"));
    }
}
