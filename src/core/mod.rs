//! Core orchestration logic.
//!
//! This module contains:
//! - EventLog: durable append-only event record
//! - StateMachine: transition tables, retry policy, and the step graph
//! - Executor: the fail-closed orchestration engine
//! - Resume: log replay and resume guards
//! - Summary: read-only reporting over the log

pub mod event_log;
pub mod executor;
pub mod resume;
pub mod state_machine;
pub mod summary;

// Re-export commonly used types
pub use event_log::{content_hash, EventLog, EventStream, EVENTS_FILE};
pub use executor::Executor;
pub use resume::{reconstruct, reconstruct_run, resume_run, ResumeError, ResumeGuard};
pub use state_machine::{
    GraphError, RetryPolicy, RunStateMachine, StepGraph, StepStateMachine, TransitionError,
};
pub use summary::{generate_summary, summarize, RunSummary, StepSummary};
