//! Domain contracts for the runner.
//!
//! This module fixes the vocabulary everything else is written in:
//! - Events: immutable records of state changes
//! - Run: run states and the reconstructable execution context
//! - Step: step definitions, outcomes, and the handler capability

pub mod events;
pub mod run;
pub mod step;

// Re-export commonly used types
pub use events::{Actor, Event, EventType};
pub use run::{RunContext, RunState};
pub use step::{ErrorClass, StepDefinition, StepHandler, StepOutcome, StepState};
