//! lockstep - fail-closed, event-sourced pipeline runner
//!
//! Runs an ordered set of dependent steps, durably records every state
//! change, halts downstream work the instant a hard gate fails, and resumes
//! exactly where it left off after any interruption.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - All state changes are recorded as immutable events in an append-only
//!   per-run log
//! - Run and step state are derived by folding the log through a fail-closed
//!   transition table
//! - Interrupted runs are resumed by replaying the log, never from hidden
//!   process state
//!
//! # Modules
//!
//! - `domain`: Contracts (Event, StepDefinition, RunContext, StepHandler)
//! - `core`: Orchestration (EventLog, StateMachine, Executor, Resume, Summary)
//! - `cli`: Command-line interface over the event log
//!
//! # Usage
//!
//! ```bash
//! # Inspect a run
//! lockstep status runs/nightly-42
//!
//! # Tail its events
//! lockstep events runs/nightly-42 --tail 20
//!
//! # Summarize it
//! lockstep summary runs/nightly-42 --json
//! ```

pub mod cli;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use crate::core::{
    generate_summary, reconstruct_run, resume_run, EventLog, Executor, ResumeError, RunSummary,
    StepGraph,
};
pub use crate::domain::{
    Actor, ErrorClass, Event, EventType, RunContext, RunState, StepDefinition, StepHandler,
    StepOutcome, StepState,
};
