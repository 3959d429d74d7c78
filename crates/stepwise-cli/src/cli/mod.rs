//! CLI command definitions and dispatch for the `stepwise` binary.
//!
//! Uses clap derive macros for argument parsing. Each command drives the
//! instance in-process until it settles or `--timeout` elapses; an instance
//! left suspended is picked up again by `resume` or `send-event`.

pub mod instance;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

use crate::state::AppState;

/// Run durable workflows against a local SQLite store.
#[derive(Parser)]
#[command(name = "stepwise", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for engine debug logs, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "STEPWISE_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new instance of a built-in workflow.
    Run {
        /// Workflow name (see `stepwise workflows`).
        workflow: String,

        /// Instance id (defaults to a generated UUIDv7).
        #[arg(long)]
        id: Option<String>,

        /// JSON params passed to the workflow as its trigger payload.
        #[arg(long)]
        params: Option<String>,

        /// Seconds to drive the instance before leaving it suspended.
        #[arg(long, default_value = "10")]
        timeout: u64,
    },

    /// Re-enter a persisted instance, e.g. after a crash.
    Resume {
        /// Instance id.
        id: String,

        /// Seconds to drive the instance before leaving it suspended.
        #[arg(long, default_value = "10")]
        timeout: u64,
    },

    /// Show an instance's status with its output or error.
    Status {
        /// Instance id.
        id: String,
    },

    /// Show an instance's event log.
    Logs {
        /// Instance id.
        id: String,
    },

    /// Deliver an event to an instance.
    #[command(name = "send-event")]
    SendEvent {
        /// Instance id.
        id: String,

        /// Event type, matched against `wait_for_event` calls.
        event_type: String,

        /// JSON payload of the event.
        #[arg(long)]
        payload: Option<String>,

        /// Seconds to drive the instance after delivery.
        #[arg(long, default_value = "10")]
        timeout: u64,
    },

    /// List the built-in workflows.
    Workflows,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Dispatch a parsed command.
pub async fn dispatch(command: Commands, state: &AppState, json: bool) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            workflow,
            id,
            params,
            timeout,
        } => instance::handle_run(state, &workflow, id, params.as_deref(), timeout, json).await,
        Commands::Resume { id, timeout } => instance::handle_resume(state, &id, timeout, json).await,
        Commands::Status { id } => instance::handle_status(state, &id, json).await,
        Commands::Logs { id } => instance::handle_logs(state, &id, json).await,
        Commands::SendEvent {
            id,
            event_type,
            payload,
            timeout,
        } => {
            instance::handle_send_event(state, &id, &event_type, payload.as_deref(), timeout, json)
                .await
        }
        Commands::Workflows => instance::handle_workflows(state, json),
        Commands::Completions { .. } => unreachable!("handled in main"),
    }
}
