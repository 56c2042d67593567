//! Step definitions and the pluggable step implementation contract.
//!
//! A step is one DAG node: a stable identifier, the set of steps it depends
//! on, gate flags, and a retry budget. The work itself lives behind the
//! [`StepHandler`] capability, keyed by step_id.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::run::RunContext;

/// Lifecycle states of a step, derived by folding its events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Not yet started
    Pending,

    /// Currently executing an attempt
    Running,

    /// Completed successfully
    Succeeded,

    /// Failed permanently
    Failed,

    /// Rolled back by compensation (reserved)
    Compensated,

    /// Skipped because of a failed gate or unmet dependency
    Skipped,
}

impl StepState {
    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Compensated | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Compensated => "compensated",
            Self::Skipped => "skipped",
        }
    }

    /// Parse the wire name back into a state
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "compensated" => Some(Self::Compensated),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed failure classification driving retry eligibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient I/O problem, retryable with backoff
    TransientIo,

    /// A required input was missing, not retryable
    ContractInputMissing,

    /// A hard gate check failed, never retryable
    HardGateFailed,

    /// Output validation failed, not retryable
    ValidationFailed,

    /// Unclassified failure, not retryable by default
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientIo => "transient_io",
            Self::ContractInputMissing => "contract_input_missing",
            Self::HardGateFailed => "hard_gate_failed",
            Self::ValidationFailed => "validation_failed",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static definition of one pipeline step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique identifier within the run
    pub step_id: String,

    /// Human-readable description
    pub description: String,

    /// Steps that must succeed before this one may start
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// A permanent failure of this step halts all unresolved downstream work
    #[serde(default)]
    pub hard_gate: bool,

    /// Execution blocks here until an external approval event is recorded
    #[serde(default)]
    pub manual_gate: bool,

    /// Maximum number of retries after the initial attempt
    #[serde(default)]
    pub max_retries: u32,

    /// Error classes eligible for retry
    #[serde(default = "default_retry_classes")]
    pub retry_classes: Vec<ErrorClass>,
}

fn default_retry_classes() -> Vec<ErrorClass> {
    vec![ErrorClass::TransientIo]
}

impl StepDefinition {
    /// Create a step with no dependencies and the default retry policy
    pub fn new(step_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            description: description.into(),
            depends_on: Vec::new(),
            hard_gate: false,
            manual_gate: false,
            max_retries: 0,
            retry_classes: default_retry_classes(),
        }
    }

    /// Declare upstream dependencies
    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    /// Mark this step as a hard gate
    pub fn hard_gate(mut self) -> Self {
        self.hard_gate = true;
        self
    }

    /// Mark this step as manually gated
    pub fn manual_gate(mut self) -> Self {
        self.manual_gate = true;
        self
    }

    /// Set the retry budget
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the error classes eligible for retry
    pub fn retry_on(mut self, classes: &[ErrorClass]) -> Self {
        self.retry_classes = classes.to_vec();
        self
    }

    /// Check whether this step's own policy permits a retry
    pub fn allows_retry(&self, error_class: ErrorClass, current_attempt: u32) -> bool {
        if current_attempt >= self.max_retries {
            return false;
        }
        self.retry_classes.contains(&error_class)
    }
}

/// Result of one step execution attempt.
///
/// This is the only channel from a step implementation back to the runner:
/// anything the step wants recorded (hashes, artifact paths) must ride here
/// and becomes event fields.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Whether the attempt succeeded
    pub succeeded: bool,

    /// Failure classification, when the attempt failed
    pub error_class: Option<ErrorClass>,

    /// Compact explanation of the outcome
    pub reason: Option<String>,

    /// Hash of the inputs the step consumed
    pub inputs_hash: Option<String>,

    /// Hash of the outputs the step produced
    pub outputs_hash: Option<String>,

    /// Path of an artifact the step wrote
    pub artifact_path: Option<String>,
}

impl StepOutcome {
    /// A successful attempt
    pub fn success() -> Self {
        Self {
            succeeded: true,
            error_class: None,
            reason: None,
            inputs_hash: None,
            outputs_hash: None,
            artifact_path: None,
        }
    }

    /// A failed attempt with its classification
    pub fn failure(error_class: ErrorClass, reason: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            error_class: Some(error_class),
            reason: Some(reason.into()),
            inputs_hash: None,
            outputs_hash: None,
            artifact_path: None,
        }
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

/// The pluggable step implementation capability.
///
/// One handler per step_id; the runner resolves the handler from its map
/// and calls it with the current context. Failures are reported in-band via
/// [`StepOutcome`], never by panicking.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Execute one attempt of the step
    async fn run(&self, ctx: &RunContext, step_id: &str) -> StepOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_retry_respects_budget_and_class() {
        let step = StepDefinition::new("stage_data", "Stage data")
            .max_retries(2)
            .retry_on(&[ErrorClass::TransientIo]);

        assert!(step.allows_retry(ErrorClass::TransientIo, 0));
        assert!(step.allows_retry(ErrorClass::TransientIo, 1));
        assert!(!step.allows_retry(ErrorClass::TransientIo, 2));
        assert!(!step.allows_retry(ErrorClass::ValidationFailed, 0));
    }

    #[test]
    fn test_default_retry_classes() {
        let step = StepDefinition::new("build", "Build bundle").max_retries(1);
        assert_eq!(step.retry_classes, vec![ErrorClass::TransientIo]);
        assert!(!step.hard_gate);
    }

    #[test]
    fn test_step_state_parse_roundtrip() {
        for state in [
            StepState::Pending,
            StepState::Running,
            StepState::Succeeded,
            StepState::Failed,
            StepState::Compensated,
            StepState::Skipped,
        ] {
            assert_eq!(StepState::parse(state.as_str()), Some(state));
        }
        assert_eq!(StepState::parse("paused"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(StepState::Succeeded.is_terminal());
        assert!(StepState::Skipped.is_terminal());
        assert!(!StepState::Failed.is_terminal());
        assert!(!StepState::Pending.is_terminal());
    }
}
