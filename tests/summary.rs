//! Summary Integration Tests
//!
//! Tests for log-derived reporting: counts, gate highlighting, and
//! point-in-time snapshots of in-progress runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use lockstep::{
    generate_summary, ErrorClass, Event, EventLog, EventType, Executor, RunContext, RunState,
    StepDefinition, StepHandler, StepOutcome, StepState,
};
use tempfile::TempDir;

struct Always(StepOutcome);

#[async_trait]
impl StepHandler for Always {
    async fn run(&self, _ctx: &RunContext, _step_id: &str) -> StepOutcome {
        self.0.clone()
    }
}

struct Scripted {
    outcomes: Mutex<VecDeque<StepOutcome>>,
}

impl Scripted {
    fn new(outcomes: Vec<StepOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
        }
    }
}

#[async_trait]
impl StepHandler for Scripted {
    async fn run(&self, _ctx: &RunContext, _step_id: &str) -> StepOutcome {
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(StepOutcome::success)
    }
}

#[tokio::test(start_paused = true)]
async fn test_summary_of_gated_run() {
    let temp = TempDir::new().unwrap();

    let steps = vec![
        StepDefinition::new("fetch", "Fetch inputs")
            .max_retries(1)
            .retry_on(&[ErrorClass::TransientIo]),
        StepDefinition::new("verify", "Verify artifacts")
            .depends_on(&["fetch"])
            .hard_gate(),
        StepDefinition::new("publish", "Publish").depends_on(&["verify"]),
    ];
    let mut handlers: HashMap<String, Box<dyn StepHandler>> = HashMap::new();
    handlers.insert(
        "fetch".into(),
        Box::new(Scripted::new(vec![
            StepOutcome::failure(ErrorClass::TransientIo, "mirror flapped"),
            StepOutcome::success(),
        ])),
    );
    handlers.insert(
        "verify".into(),
        Box::new(Always(StepOutcome::failure(
            ErrorClass::HardGateFailed,
            "checksum mismatch",
        ))),
    );
    handlers.insert("publish".into(), Box::new(Always(StepOutcome::success())));

    let mut executor = Executor::new(temp.path(), steps, handlers).await.unwrap();
    let mut ctx = executor.start("run-summary", Some("nightly")).await.unwrap();
    executor.execute(&mut ctx).await.unwrap();

    let summary = generate_summary(temp.path()).await.unwrap();

    assert_eq!(summary.run_id, "run-summary");
    assert_eq!(summary.final_state, RunState::Failed);
    assert_eq!(summary.steps.len(), 3);
    assert_eq!(summary.succeeded_steps, 1);
    assert_eq!(summary.failed_steps, 1);
    assert_eq!(summary.skipped_steps, 1);
    assert_eq!(summary.total_retries, 1);
    assert_eq!(summary.failed_hard_gates, vec!["verify"]);
    assert!(summary.duration_ms.is_some());

    let fetch = summary.steps.iter().find(|s| s.step_id == "fetch").unwrap();
    assert_eq!(fetch.state, StepState::Succeeded);
    assert_eq!(fetch.attempts, 2);

    let text = summary.to_text();
    assert!(text.contains("Status: ✗ FAILED"));
    assert!(text.contains("Hard gate failures: verify"));
    assert!(text.contains("Error: checksum mismatch"));
    assert!(text.contains("Retries: 1"));
}

#[tokio::test]
async fn test_summary_snapshot_of_in_progress_run() {
    let temp = TempDir::new().unwrap();
    let run_id = "run-live";

    // A log another process is still appending to
    let mut log = EventLog::open(temp.path()).await.unwrap();
    for event in [
        Event::new(EventType::RunCreated, run_id).with_new_state("created"),
        Event::new(EventType::RunStateChanged, run_id)
            .with_previous_state("created")
            .with_new_state("preflight_validated"),
        Event::new(EventType::RunStateChanged, run_id)
            .with_previous_state("preflight_validated")
            .with_new_state("executing"),
        Event::new(EventType::StepStarted, run_id).with_step("a"),
    ] {
        log.append(event).await.unwrap();
    }

    let summary = generate_summary(temp.path()).await.unwrap();
    assert_eq!(summary.final_state, RunState::Executing);
    assert_eq!(summary.steps.len(), 1);
    assert_eq!(summary.steps[0].state, StepState::Running);
    assert_eq!(summary.succeeded_steps, 0);

    // The snapshot is read-only: nothing was appended
    assert_eq!(log.read_all().await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_summary_of_missing_log_fails() {
    let temp = TempDir::new().unwrap();
    assert!(generate_summary(&temp.path().join("absent")).await.is_err());
}

#[tokio::test]
async fn test_machine_readable_summary() {
    let temp = TempDir::new().unwrap();

    let steps = vec![StepDefinition::new("a", "Only step")];
    let mut handlers: HashMap<String, Box<dyn StepHandler>> = HashMap::new();
    handlers.insert("a".into(), Box::new(Always(StepOutcome::success())));

    let mut executor = Executor::new(temp.path(), steps, handlers).await.unwrap();
    let mut ctx = executor.start("run-json", None).await.unwrap();
    executor.execute(&mut ctx).await.unwrap();

    let summary = generate_summary(temp.path()).await.unwrap();
    let json = serde_json::to_value(&summary).unwrap();

    assert_eq!(json["run_id"], "run-json");
    assert_eq!(json["final_state"], "succeeded");
    assert_eq!(json["steps"][0]["step_id"], "a");
    assert_eq!(json["steps"][0]["attempts"], 1);
}
