//! Command-line interface for lockstep.
//!
//! Provides commands for inspecting run status, tailing or following the
//! event log, generating summaries, and checking resumability. Every command
//! only reads the event log or calls the library API; none holds state of
//! its own.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::core::{generate_summary, reconstruct_run, resume_run, EventLog, EVENTS_FILE};
use crate::domain::Event;

/// lockstep - fail-closed, event-sourced pipeline runner
#[derive(Parser, Debug)]
#[command(name = "lockstep")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the reconstructed status of a run
    Status {
        /// Run directory containing events.jsonl
        run_dir: PathBuf,
    },

    /// Show or stream the run's events
    Events {
        /// Run directory containing events.jsonl
        run_dir: PathBuf,

        /// Show only the last N events
        #[arg(long)]
        tail: Option<usize>,

        /// Keep following the log for new events
        #[arg(short, long)]
        follow: bool,

        /// Print raw JSON records
        #[arg(long)]
        json: bool,
    },

    /// Show a run summary
    Summary {
        /// Run directory containing events.jsonl
        run_dir: PathBuf,

        /// Machine-readable JSON output
        #[arg(long)]
        json: bool,
    },

    /// Check whether an interrupted run can be resumed
    Resume {
        /// Run directory containing events.jsonl
        run_dir: PathBuf,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Status { run_dir } => show_status(&run_dir).await,
            Commands::Events {
                run_dir,
                tail,
                follow,
                json,
            } => show_events(&run_dir, tail, follow, json).await,
            Commands::Summary { run_dir, json } => show_summary(&run_dir, json).await,
            Commands::Resume { run_dir } => check_resume(&run_dir).await,
        }
    }
}

/// Show reconstructed run and step states
async fn show_status(run_dir: &Path) -> Result<()> {
    let ctx = reconstruct_run(run_dir).await?;

    println!("Run ID: {}", ctx.run_id);
    println!("State: {}", ctx.run_state);
    println!();

    println!("Steps:");
    let mut step_ids: Vec<&String> = ctx.step_states.keys().collect();
    step_ids.sort();
    for step_id in step_ids {
        let state = ctx.step_state(step_id);
        let attempt = ctx.attempt(step_id);
        let attempt_str = if attempt > 0 {
            format!(" (attempt {attempt})")
        } else {
            String::new()
        };
        println!("  {step_id:<30} {state}{attempt_str}");
    }

    println!();
    println!("Completed: {}", ctx.completed_steps.len());
    let gates = ctx.unresolved_hard_gates();
    if !gates.is_empty() {
        println!("Failed hard gates: {}", gates.join(", "));
    }

    Ok(())
}

/// Show, tail, or follow the event log
async fn show_events(
    run_dir: &Path,
    tail: Option<usize>,
    follow: bool,
    json: bool,
) -> Result<()> {
    if !run_dir.join(EVENTS_FILE).exists() {
        anyhow::bail!("no event log found at: {}", run_dir.display());
    }

    let log = EventLog::open(run_dir).await?;

    if let Some(n) = tail {
        for event in log.tail(n).await? {
            print_event(&event, json)?;
        }
    } else if follow {
        let mut stream = log.stream().await?;
        loop {
            while let Some(event) = stream.next_event().await? {
                print_event(&event, json)?;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    } else {
        for event in log.read_all().await? {
            print_event(&event, json)?;
        }
    }

    Ok(())
}

/// Show the run summary
async fn show_summary(run_dir: &Path, json: bool) -> Result<()> {
    let summary = generate_summary(run_dir).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("failed to serialize summary")?
        );
    } else {
        println!("{}", summary.to_text());
    }

    Ok(())
}

/// Reconstruct a run and report whether it can be resumed
async fn check_resume(run_dir: &Path) -> Result<()> {
    println!("Resuming run from: {}", run_dir.display());

    let ctx = resume_run(run_dir).await?;

    println!("Run ID: {}", ctx.run_id);
    println!("Current state: {}", ctx.run_state);
    println!("Completed steps: {}", ctx.completed_steps.len());
    println!();
    println!("Run is resumable");
    println!("Note: supply step implementations and call Executor::resume programmatically");

    Ok(())
}

/// Print one event, either as raw JSON or as a human-readable line
fn print_event(event: &Event, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string(event).context("failed to serialize event")?
        );
        return Ok(());
    }

    let mut line = format!(
        "{} {}",
        event.timestamp_utc.format("%Y-%m-%dT%H:%M:%S"),
        event.event_type
    );
    if let Some(step_id) = &event.step_id {
        line.push_str(&format!(" [{step_id}]"));
    }
    if event.attempt > 0 {
        line.push_str(&format!(" attempt={}", event.attempt));
    }
    if let Some(class) = event.error_class {
        line.push_str(&format!(" error={class}"));
    }
    if let Some(reason) = &event.reason {
        line.push_str(&format!(" reason=\"{reason}\""));
    }
    println!("{line}");

    Ok(())
}
