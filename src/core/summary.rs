//! Run summary generation from the event log.
//!
//! Pure aggregation over `read_all()`: no writes, no live state. Running it
//! against an in-progress run yields a point-in-time snapshot.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{ErrorClass, Event, EventType, RunState, StepState};

use super::event_log::{EventLog, EVENTS_FILE};

/// Summary of a single step's execution
#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub step_id: String,
    pub state: StepState,

    /// Total attempts (initial attempt plus retries)
    pub attempts: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

/// Summary of a complete or in-progress run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub final_state: RunState,
    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,

    pub steps: Vec<StepSummary>,
    pub succeeded_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub total_retries: usize,
    pub failed_hard_gates: Vec<String>,
}

impl RunSummary {
    /// Human-readable report.
    ///
    /// Highlights the hard-gate failures and every failed step.
    pub fn to_text(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Run Summary: {}", self.run_id));
        lines.push("=".repeat(60));

        let status_mark = match self.final_state {
            RunState::Succeeded => "✓",
            RunState::Failed => "✗",
            RunState::RolledBack => "↺",
            _ => "•",
        };
        lines.push(format!("Status: {} {}", status_mark, self.final_state.as_str().to_uppercase()));
        lines.push(format!("Created: {}", self.created_at.to_rfc3339()));
        if let Some(completed) = self.completed_at {
            lines.push(format!("Completed: {}", completed.to_rfc3339()));
        }
        if let Some(duration_ms) = self.duration_ms {
            lines.push(format!("Duration: {:.2}s", duration_ms as f64 / 1000.0));
        }
        lines.push(String::new());

        lines.push(format!(
            "Steps: {} total ({} succeeded, {} failed, {} skipped)",
            self.steps.len(),
            self.succeeded_steps,
            self.failed_steps,
            self.skipped_steps
        ));
        lines.push(format!("Retries: {}", self.total_retries));
        if !self.failed_hard_gates.is_empty() {
            lines.push(format!(
                "Hard gate failures: {}",
                self.failed_hard_gates.join(", ")
            ));
        }
        lines.push(String::new());

        lines.push("Steps:".to_string());
        lines.push("-".repeat(60));
        for step in &self.steps {
            let mark = match step.state {
                StepState::Succeeded => "✓",
                StepState::Failed => "✗",
                StepState::Skipped => "⊘",
                StepState::Compensated => "↺",
                _ => "•",
            };

            let mut line = format!("  {} {:<30} {}", mark, step.step_id, step.state);
            if step.attempts > 1 {
                line.push_str(&format!(" (attempts: {})", step.attempts));
            }
            lines.push(line);

            if let Some(reason) = &step.error_reason {
                lines.push(format!("      Error: {reason}"));
            }
        }

        lines.join("\n")
    }
}

/// Aggregate a run's events into a summary
pub fn summarize(events: &[Event]) -> Result<RunSummary> {
    let first = events
        .first()
        .context("event log is empty, nothing to summarize")?;

    let mut final_state = RunState::Created;
    let mut completed_at: Option<DateTime<Utc>> = None;

    let mut step_states: BTreeMap<String, StepState> = BTreeMap::new();
    let mut step_attempts: BTreeMap<String, u32> = BTreeMap::new();
    let mut step_started: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
    let mut step_finished: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
    let mut step_errors: BTreeMap<String, (Option<ErrorClass>, Option<String>)> = BTreeMap::new();
    let mut gate_failures: Vec<String> = Vec::new();
    let mut total_retries = 0usize;

    for event in events {
        match event.event_type {
            EventType::RunStateChanged | EventType::RunCompleted => {
                if let Some(state) = event.new_state.as_deref().and_then(RunState::parse) {
                    final_state = state;
                }
                completed_at = Some(event.timestamp_utc);
            }
            EventType::StepStarted => {
                if let Some(step_id) = &event.step_id {
                    step_states.insert(step_id.clone(), StepState::Running);
                    step_attempts.insert(step_id.clone(), event.attempt);
                    step_started.entry(step_id.clone()).or_insert(event.timestamp_utc);
                }
            }
            EventType::StepSucceeded => {
                if let Some(step_id) = &event.step_id {
                    step_states.insert(step_id.clone(), StepState::Succeeded);
                    step_finished.insert(step_id.clone(), event.timestamp_utc);
                }
            }
            EventType::StepFailed => {
                if let Some(step_id) = &event.step_id {
                    step_states.insert(step_id.clone(), StepState::Failed);
                    step_finished.insert(step_id.clone(), event.timestamp_utc);
                    step_errors.insert(
                        step_id.clone(),
                        (event.error_class, event.reason.clone()),
                    );
                }
            }
            EventType::StepRetried => {
                total_retries += 1;
                if let Some(step_id) = &event.step_id {
                    step_attempts.insert(step_id.clone(), event.attempt);
                }
            }
            EventType::StepSkipped => {
                if let Some(step_id) = &event.step_id {
                    step_states.insert(step_id.clone(), StepState::Skipped);
                }
            }
            EventType::GateFailed => {
                if let Some(step_id) = &event.step_id {
                    if !gate_failures.contains(step_id) {
                        gate_failures.push(step_id.clone());
                    }
                }
            }
            EventType::RunCreated | EventType::ArtifactEmitted | EventType::RunOverrideApplied => {}
        }
    }

    let mut steps = Vec::with_capacity(step_states.len());
    let mut succeeded_steps = 0;
    let mut failed_steps = 0;
    let mut skipped_steps = 0;

    for (step_id, state) in &step_states {
        match state {
            StepState::Succeeded => succeeded_steps += 1,
            StepState::Failed => failed_steps += 1,
            StepState::Skipped => skipped_steps += 1,
            _ => {}
        }

        let started_at = step_started.get(step_id).copied();
        let duration_ms = match (started_at, step_finished.get(step_id)) {
            (Some(start), Some(end)) => Some((*end - start).num_milliseconds()),
            _ => None,
        };
        let (error_class, error_reason) = step_errors
            .get(step_id)
            .cloned()
            .unwrap_or((None, None));

        steps.push(StepSummary {
            step_id: step_id.clone(),
            state: *state,
            attempts: step_attempts.get(step_id).copied().unwrap_or(0) + 1,
            error_class,
            error_reason,
            started_at,
            duration_ms,
        });
    }

    let duration_ms = completed_at.map(|end| (end - first.timestamp_utc).num_milliseconds());

    Ok(RunSummary {
        run_id: first.run_id.clone(),
        final_state,
        created_at: first.timestamp_utc,
        completed_at,
        duration_ms,
        steps,
        succeeded_steps,
        failed_steps,
        skipped_steps,
        total_retries,
        failed_hard_gates: gate_failures,
    })
}

/// Generate a summary for the run recorded under `run_dir`
pub async fn generate_summary(run_dir: &Path) -> Result<RunSummary> {
    let log_path = run_dir.join(EVENTS_FILE);
    if !log_path.exists() {
        anyhow::bail!("event log not found: {}", log_path.display());
    }

    let log = EventLog::open(run_dir).await?;
    let events = log.read_all().await?;
    summarize(&events)
}
