//! Pipeline executor.
//!
//! Drives one run on a single logical thread of control: steps execute
//! strictly in topological order, every state change is appended to the
//! event log before in-memory state moves, and a failed hard gate halts all
//! unresolved downstream work. The executor keeps nothing that cannot be
//! reconstructed from the log.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{error, info, instrument, warn};

use crate::domain::{
    Actor, ErrorClass, Event, EventType, RunContext, RunState, StepDefinition, StepHandler,
    StepOutcome, StepState,
};

use super::event_log::EventLog;
use super::state_machine::{RetryPolicy, RunStateMachine, StepGraph, StepStateMachine};

/// Orchestrates execution of one run against its event log
pub struct Executor {
    /// Directory holding the run's event log and artifacts
    run_dir: PathBuf,

    /// Durable event record; the only effect channel
    event_log: EventLog,

    /// Static step definitions, in declaration order
    definitions: Vec<StepDefinition>,

    /// Step implementations keyed by step_id
    handlers: HashMap<String, Box<dyn StepHandler>>,
}

impl Executor {
    /// Create an executor over a run directory.
    ///
    /// The step graph is validated in `start`, where the failure can be
    /// recorded in the event log.
    pub async fn new(
        run_dir: impl Into<PathBuf>,
        definitions: Vec<StepDefinition>,
        handlers: HashMap<String, Box<dyn StepHandler>>,
    ) -> Result<Self> {
        let run_dir = run_dir.into();
        let event_log = EventLog::open(&run_dir).await?;

        Ok(Self {
            run_dir,
            event_log,
            definitions,
            handlers,
        })
    }

    /// Directory holding this run's event log
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Start a new run: emit run.created, validate the step graph, and
    /// transition to preflight_validated.
    ///
    /// A graph validation failure is fatal and never retried: the run is
    /// failed in the log and the error propagates.
    #[instrument(skip(self, reason), fields(run_id = %run_id))]
    pub async fn start(&mut self, run_id: &str, reason: Option<&str>) -> Result<RunContext> {
        info!("starting run");

        let mut created = Event::new(EventType::RunCreated, run_id)
            .with_new_state(RunState::Created.as_str());
        if let Some(reason) = reason {
            created = created.with_reason(reason);
        }
        self.event_log.append(created).await?;

        let mut ctx = RunContext::new(run_id);

        if let Err(err) = StepGraph::new(&self.definitions) {
            let reason = format!("step graph validation failed: {err}");
            error!(%reason, "preflight failed");
            self.transition_run(&mut ctx, RunState::Failed, Some(&reason))
                .await?;
            self.event_log
                .append(
                    Event::new(EventType::RunCompleted, run_id)
                        .with_new_state(RunState::Failed.as_str())
                        .with_error(ErrorClass::ValidationFailed, reason),
                )
                .await?;
            return Err(anyhow::Error::new(err).context("step graph validation failed"));
        }

        ctx.initialize_steps(&self.definitions);
        self.transition_run(&mut ctx, RunState::PreflightValidated, Some("step graph validated"))
            .await?;

        Ok(ctx)
    }

    /// Execute the full pipeline, returning the terminal run state
    #[instrument(skip(self, ctx), fields(run_id = %ctx.run_id))]
    pub async fn execute(&mut self, ctx: &mut RunContext) -> Result<RunState> {
        let graph = StepGraph::new(&self.definitions).context("step graph validation failed")?;

        self.transition_run(ctx, RunState::Executing, None).await?;
        self.run_steps(ctx, &graph).await
    }

    /// Continue a reconstructed run from its first unresolved step.
    ///
    /// Steps that already succeeded are not re-started; steps the log never
    /// mentioned are initialized to pending.
    #[instrument(skip(self, ctx), fields(run_id = %ctx.run_id))]
    pub async fn resume(&mut self, ctx: &mut RunContext) -> Result<RunState> {
        if ctx.run_state.is_terminal() {
            anyhow::bail!(
                "cannot resume run '{}' in terminal state {}",
                ctx.run_id,
                ctx.run_state
            );
        }

        let graph = StepGraph::new(&self.definitions).context("step graph validation failed")?;
        ctx.initialize_steps(&self.definitions);

        match ctx.run_state {
            RunState::Created => {
                self.transition_run(
                    ctx,
                    RunState::PreflightValidated,
                    Some("step graph validated on resume"),
                )
                .await?;
                self.transition_run(ctx, RunState::Executing, Some("resuming execution"))
                    .await?;
            }
            RunState::PreflightValidated => {
                self.transition_run(ctx, RunState::Executing, Some("resuming execution"))
                    .await?;
            }
            RunState::Blocked => {
                self.transition_run(ctx, RunState::Executing, Some("resuming after manual action"))
                    .await?;
            }
            _ => {}
        }

        info!(
            resume_point = ?ctx.first_unresolved(graph.order()),
            "resuming run"
        );
        self.run_steps(ctx, &graph).await
    }

    /// Record an external approval for a gated step.
    ///
    /// This is the hook a manual-gate or gate-override workflow calls; the
    /// approval mechanism itself lives outside the core.
    pub async fn apply_override(
        &mut self,
        ctx: &mut RunContext,
        step_id: &str,
        reason: &str,
    ) -> Result<()> {
        self.event_log
            .append(
                Event::new(EventType::RunOverrideApplied, &ctx.run_id)
                    .with_actor(Actor::Manual)
                    .with_step(step_id)
                    .with_reason(reason),
            )
            .await?;
        ctx.overrides.insert(step_id.to_string());
        info!(step = %step_id, %reason, "external approval recorded");
        Ok(())
    }

    /// Walk the step graph in order under fail-closed rules
    async fn run_steps(&mut self, ctx: &mut RunContext, graph: &StepGraph) -> Result<RunState> {
        for step_id in graph.order() {
            let Some(step) = graph.get(step_id) else {
                continue;
            };

            let state = ctx.step_state(step_id);
            if state.is_terminal() {
                continue;
            }

            if step.manual_gate && !ctx.overrides.contains(step_id.as_str()) {
                let reason = format!("step '{step_id}' requires manual approval");
                warn!(step = %step_id, "blocking run for manual gate");
                self.transition_run(ctx, RunState::Blocked, Some(&reason))
                    .await?;
                return Ok(ctx.run_state);
            }

            let unmet = graph.unmet_dependencies(step_id, &ctx.completed_steps);
            if !unmet.is_empty() {
                if ctx.step_state(step_id) == StepState::Pending {
                    let reason =
                        format!("unresolved upstream dependencies: {}", unmet.join(", "));
                    self.skip_step(ctx, step_id, &reason).await?;
                }
                continue;
            }

            let succeeded = self.execute_step(ctx, step).await?;

            if !succeeded && step.hard_gate {
                self.halt_for_gate(ctx, graph, step_id).await?;
                return Ok(ctx.run_state);
            }
        }

        let failed_steps: Vec<&str> = graph
            .order()
            .iter()
            .map(|id| id.as_str())
            .filter(|id| ctx.step_state(id) == StepState::Failed)
            .collect();

        if !ctx.failed_hard_gates.is_empty() {
            let gates = ctx.unresolved_hard_gates();
            let reason = format!("hard gate failures: {}", gates.join(", "));
            self.fail_run(ctx, &reason).await?;
        } else if !failed_steps.is_empty() {
            let reason = format!("failed steps: {}", failed_steps.join(", "));
            self.fail_run(ctx, &reason).await?;
        } else {
            self.complete_run(ctx, "all steps resolved").await?;
        }

        Ok(ctx.run_state)
    }

    /// Execute one step to resolution, looping through retries with backoff
    async fn execute_step(&mut self, ctx: &mut RunContext, step: &StepDefinition) -> Result<bool> {
        let step_id = step.step_id.as_str();
        let mut attempt = ctx.attempt(step_id);

        loop {
            StepStateMachine::validate_transition(step_id, ctx.step_state(step_id), StepState::Running)?;
            self.event_log
                .append(
                    Event::new(EventType::StepStarted, &ctx.run_id)
                        .with_step(step_id)
                        .with_attempt(attempt)
                        .with_new_state(StepState::Running.as_str()),
                )
                .await?;
            ctx.step_states.insert(step_id.to_string(), StepState::Running);
            ctx.step_attempts.insert(step_id.to_string(), attempt);
            info!(step = %step_id, attempt, "step started");

            let outcome = match self.handlers.get(step_id) {
                Some(handler) => handler.run(ctx, step_id).await,
                None => StepOutcome::failure(
                    ErrorClass::Unknown,
                    format!("no implementation registered for step '{step_id}'"),
                ),
            };

            if outcome.succeeded {
                let mut event = Event::new(EventType::StepSucceeded, &ctx.run_id)
                    .with_step(step_id)
                    .with_attempt(attempt)
                    .with_new_state(StepState::Succeeded.as_str());
                if let Some(hash) = &outcome.inputs_hash {
                    event = event.with_inputs_hash(hash);
                }
                if let Some(hash) = &outcome.outputs_hash {
                    event = event.with_outputs_hash(hash);
                }
                self.event_log.append(event).await?;
                ctx.step_states
                    .insert(step_id.to_string(), StepState::Succeeded);
                ctx.completed_steps.insert(step_id.to_string());
                ctx.failed_hard_gates.remove(step_id);
                info!(step = %step_id, attempt, "step succeeded");

                if let Some(path) = &outcome.artifact_path {
                    let mut artifact = Event::new(EventType::ArtifactEmitted, &ctx.run_id)
                        .with_step(step_id)
                        .with_attempt(attempt)
                        .with_artifact_path(path);
                    if let Some(hash) = &outcome.outputs_hash {
                        artifact = artifact.with_outputs_hash(hash);
                    }
                    self.event_log.append(artifact).await?;
                    ctx.artifacts.insert(step_id.to_string(), path.clone());
                }

                return Ok(true);
            }

            let error_class = outcome.error_class.unwrap_or(ErrorClass::Unknown);
            let reason = outcome
                .reason
                .clone()
                .unwrap_or_else(|| "step failed".to_string());

            if RetryPolicy::allows_retry(step, error_class, attempt) {
                attempt += 1;
                StepStateMachine::validate_transition(step_id, StepState::Running, StepState::Pending)?;
                self.event_log
                    .append(
                        Event::new(EventType::StepRetried, &ctx.run_id)
                            .with_step(step_id)
                            .with_attempt(attempt)
                            .with_error(error_class, reason.clone())
                            .with_new_state(StepState::Pending.as_str()),
                    )
                    .await?;
                ctx.step_states.insert(step_id.to_string(), StepState::Pending);
                ctx.step_attempts.insert(step_id.to_string(), attempt);

                let delay = RetryPolicy::backoff_delay(attempt - 1);
                warn!(
                    step = %step_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error_class,
                    "step failed, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            self.record_failure(ctx, step, error_class, &reason).await?;
            return Ok(false);
        }
    }

    /// Record a permanent step failure, and the gate failure if applicable
    async fn record_failure(
        &mut self,
        ctx: &mut RunContext,
        step: &StepDefinition,
        error_class: ErrorClass,
        reason: &str,
    ) -> Result<()> {
        let step_id = step.step_id.as_str();
        let attempt = ctx.attempt(step_id);

        StepStateMachine::validate_transition(step_id, ctx.step_state(step_id), StepState::Failed)?;
        self.event_log
            .append(
                Event::new(EventType::StepFailed, &ctx.run_id)
                    .with_step(step_id)
                    .with_attempt(attempt)
                    .with_error(error_class, reason)
                    .with_new_state(StepState::Failed.as_str()),
            )
            .await?;
        ctx.step_states.insert(step_id.to_string(), StepState::Failed);
        error!(step = %step_id, attempt, error = %error_class, "step failed permanently");

        if step.hard_gate {
            self.event_log
                .append(
                    Event::new(EventType::GateFailed, &ctx.run_id)
                        .with_step(step_id)
                        .with_error(error_class, reason),
                )
                .await?;
            ctx.failed_hard_gates.insert(step_id.to_string());
        }

        Ok(())
    }

    /// Skip every still-pending step with an event naming the failed gate,
    /// then fail the run
    async fn halt_for_gate(
        &mut self,
        ctx: &mut RunContext,
        graph: &StepGraph,
        gate_id: &str,
    ) -> Result<()> {
        for step_id in graph.order() {
            if ctx.step_state(step_id) == StepState::Pending {
                let reason = format!("hard gate '{gate_id}' failed");
                self.skip_step(ctx, step_id, &reason).await?;
            }
        }
        self.fail_run(ctx, &format!("hard gate failed: {gate_id}")).await
    }

    async fn skip_step(&mut self, ctx: &mut RunContext, step_id: &str, reason: &str) -> Result<()> {
        StepStateMachine::validate_transition(step_id, ctx.step_state(step_id), StepState::Skipped)?;
        self.event_log
            .append(
                Event::new(EventType::StepSkipped, &ctx.run_id)
                    .with_step(step_id)
                    .with_reason(reason)
                    .with_new_state(StepState::Skipped.as_str()),
            )
            .await?;
        ctx.step_states.insert(step_id.to_string(), StepState::Skipped);
        info!(step = %step_id, %reason, "step skipped");
        Ok(())
    }

    /// Transition the run state, rejecting anything outside the table
    async fn transition_run(
        &mut self,
        ctx: &mut RunContext,
        new_state: RunState,
        reason: Option<&str>,
    ) -> Result<()> {
        RunStateMachine::validate_transition(ctx.run_state, new_state)?;

        let mut event = Event::new(EventType::RunStateChanged, &ctx.run_id)
            .with_previous_state(ctx.run_state.as_str())
            .with_new_state(new_state.as_str());
        if let Some(reason) = reason {
            event = event.with_reason(reason);
        }
        self.event_log.append(event).await?;
        ctx.run_state = new_state;
        Ok(())
    }

    async fn fail_run(&mut self, ctx: &mut RunContext, reason: &str) -> Result<()> {
        if ctx.run_state != RunState::Failed {
            self.transition_run(ctx, RunState::Failed, Some(reason)).await?;
        }
        error!(%reason, "run failed");
        self.event_log
            .append(
                Event::new(EventType::RunCompleted, &ctx.run_id)
                    .with_new_state(RunState::Failed.as_str())
                    .with_reason(reason),
            )
            .await?;
        Ok(())
    }

    async fn complete_run(&mut self, ctx: &mut RunContext, reason: &str) -> Result<()> {
        self.transition_run(ctx, RunState::Succeeded, Some(reason)).await?;
        info!("run succeeded");
        self.event_log
            .append(
                Event::new(EventType::RunCompleted, &ctx.run_id)
                    .with_new_state(RunState::Succeeded.as_str())
                    .with_reason(reason),
            )
            .await?;
        Ok(())
    }
}
