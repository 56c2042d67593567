//! Event types for the append-only run log.
//!
//! Events are the source of truth for run state. The current state of any run
//! can be reconstructed by replaying its events in order; no field of an
//! event is ever mutated after it is appended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::step::ErrorClass;

/// A single event in the append-only event log.
///
/// Required fields are always serialized; optional fields are omitted from
/// the wire format when absent, and decoding tolerates any subset of them
/// being missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub event_id: Uuid,

    /// Type of event
    pub event_type: EventType,

    /// The run this event belongs to
    pub run_id: String,

    /// When this event occurred (UTC, non-decreasing per run)
    pub timestamp_utc: DateTime<Utc>,

    /// Entity that triggered the event
    pub actor: Actor,

    /// Attempt number for retry tracking (0 for the first attempt)
    #[serde(default)]
    pub attempt: u32,

    /// Step this event is scoped to (absent for run-level events)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,

    /// Failure classification, when the event records a failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,

    /// Compact human-readable explanation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// State before a transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<String>,

    /// State after a transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_state: Option<String>,

    /// Hash of the inputs a step consumed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs_hash: Option<String>,

    /// Hash of the outputs a step produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs_hash: Option<String>,

    /// Path of an emitted artifact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp, attributed to the runner
    pub fn new(event_type: EventType, run_id: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            run_id: run_id.into(),
            timestamp_utc: Utc::now(),
            actor: Actor::Runner,
            attempt: 0,
            step_id: None,
            error_class: None,
            reason: None,
            previous_state: None,
            new_state: None,
            inputs_hash: None,
            outputs_hash: None,
            artifact_path: None,
        }
    }

    /// Attribute the event to a different actor
    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    /// Scope the event to a step
    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    /// Record the attempt number
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Attach a human-readable reason
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach a failure classification and reason
    pub fn with_error(mut self, error_class: ErrorClass, reason: impl Into<String>) -> Self {
        self.error_class = Some(error_class);
        self.reason = Some(reason.into());
        self
    }

    /// Record the state before a transition
    pub fn with_previous_state(mut self, state: impl Into<String>) -> Self {
        self.previous_state = Some(state.into());
        self
    }

    /// Record the state after a transition
    pub fn with_new_state(mut self, state: impl Into<String>) -> Self {
        self.new_state = Some(state.into());
        self
    }

    /// Attach an inputs hash
    pub fn with_inputs_hash(mut self, hash: impl Into<String>) -> Self {
        self.inputs_hash = Some(hash.into());
        self
    }

    /// Attach an outputs hash
    pub fn with_outputs_hash(mut self, hash: impl Into<String>) -> Self {
        self.outputs_hash = Some(hash.into());
        self
    }

    /// Attach an artifact path
    pub fn with_artifact_path(mut self, path: impl Into<String>) -> Self {
        self.artifact_path = Some(path.into());
        self
    }
}

/// All event types the runner emits.
///
/// The set is closed: replay rejects any record whose type is not listed
/// here rather than guessing at its meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// A new run was created
    #[serde(rename = "run.created")]
    RunCreated,

    /// The run moved to a new state
    #[serde(rename = "run.state_changed")]
    RunStateChanged,

    /// The run reached a terminal state
    #[serde(rename = "run.completed")]
    RunCompleted,

    /// A step began an execution attempt
    #[serde(rename = "step.started")]
    StepStarted,

    /// A step attempt succeeded
    #[serde(rename = "step.succeeded")]
    StepSucceeded,

    /// A step failed permanently
    #[serde(rename = "step.failed")]
    StepFailed,

    /// A step failed retryably and went back to pending
    #[serde(rename = "step.retried")]
    StepRetried,

    /// A step was skipped, attributed to a failed gate or dependency
    #[serde(rename = "step.skipped")]
    StepSkipped,

    /// A hard gate failed permanently
    #[serde(rename = "gate.failed")]
    GateFailed,

    /// A step emitted an artifact
    #[serde(rename = "artifact.emitted")]
    ArtifactEmitted,

    /// An external approval was recorded for a gated step
    #[serde(rename = "run.override_applied")]
    RunOverrideApplied,
}

impl EventType {
    /// Wire name of the event type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCreated => "run.created",
            Self::RunStateChanged => "run.state_changed",
            Self::RunCompleted => "run.completed",
            Self::StepStarted => "step.started",
            Self::StepSucceeded => "step.succeeded",
            Self::StepFailed => "step.failed",
            Self::StepRetried => "step.retried",
            Self::StepSkipped => "step.skipped",
            Self::GateFailed => "gate.failed",
            Self::ArtifactEmitted => "artifact.emitted",
            Self::RunOverrideApplied => "run.override_applied",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity that triggered an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// The runner itself
    Runner,

    /// An external manual action
    Manual,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_wire_names() {
        let json = serde_json::to_string(&EventType::RunStateChanged).unwrap();
        assert_eq!(json, "\"run.state_changed\"");

        let parsed: EventType = serde_json::from_str("\"gate.failed\"").unwrap();
        assert_eq!(parsed, EventType::GateFailed);
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let result = serde_json::from_str::<EventType>("\"step.paused\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_absent_optional_fields_omitted() {
        let event = Event::new(EventType::RunCreated, "run-1");
        let json = serde_json::to_string(&event).unwrap();

        assert!(!json.contains("step_id"));
        assert!(!json.contains("error_class"));
        assert!(!json.contains("artifact_path"));
        assert!(json.contains("\"event_type\":\"run.created\""));
    }

    #[test]
    fn test_roundtrip_with_optional_fields() {
        let event = Event::new(EventType::StepFailed, "run-1")
            .with_step("phase_benchmark")
            .with_attempt(2)
            .with_error(ErrorClass::TransientIo, "connection reset");

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, event);
        assert_eq!(parsed.error_class, Some(ErrorClass::TransientIo));
        assert_eq!(parsed.attempt, 2);
    }

    #[test]
    fn test_decoding_tolerates_missing_optionals() {
        let line = r#"{"event_id":"550e8400-e29b-41d4-a716-446655440000","event_type":"run.created","run_id":"run-1","timestamp_utc":"2026-08-05T12:00:00Z","actor":"runner"}"#;
        let event: Event = serde_json::from_str(line).unwrap();

        assert_eq!(event.event_type, EventType::RunCreated);
        assert_eq!(event.attempt, 0);
        assert!(event.step_id.is_none());
    }
}
