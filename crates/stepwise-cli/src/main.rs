//! stepwise CLI entry point.
//!
//! Binary name: `stepwise`
//!
//! Parses CLI arguments, opens the SQLite data directory, then dispatches to
//! the instance command handlers.

mod cli;
mod demos;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,stepwise_core=debug,stepwise_infra=debug",
        _ => "trace",
    };
    stepwise_observe::init_tracing(filter, cli.otel)
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "stepwise", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;
    let result = cli::dispatch(cli.command, &state, cli.json).await;

    stepwise_observe::shutdown_tracing();
    result
}
