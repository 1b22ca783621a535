// ABOUTME: Main entry point - loads config, starts the session reclaimer, runs the REPL
// ABOUTME: One-shot mode sends a single prompt and exits with its outcome

use anyhow::{Context, Result};
use clap::Parser;
use codebridge::logging;
use codebridge::repl::{Repl, ReplOptions};
use codebridge_core::{paths, spawn_reclaimer, Config, QueryDispatcher, SessionRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "codebridge")]
#[command(about = "Stream coding-assistant answers with per-conversation session resume")]
#[command(version)]
struct Cli {
    /// Send one prompt, print the reply and exit
    #[arg(short, long)]
    prompt: Option<String>,

    /// User part of the session key
    #[arg(long, default_value = "local")]
    user: String,

    /// Channel part of the session key
    #[arg(long, default_value = "terminal")]
    channel: String,

    /// Thread part of the session key (omitted = direct)
    #[arg(long)]
    thread: Option<String>,

    /// Working directory for the backend
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Text appended to the backend system prompt
    #[arg(long)]
    system_prompt: Option<String>,

    /// Ask for permission before sensitive actions instead of bypassing checks
    #[arg(long)]
    interactive: bool,

    /// Debug logging for codebridge crates
    #[arg(short, long)]
    verbose: bool,

    /// Skip the daily log file
    #[arg(long)]
    no_log_file: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    dotenvy::dotenv().ok();

    let log_dir = (!cli.no_log_file).then(paths::log_dir);
    let _log_guard = logging::init(log_dir.as_deref(), cli.verbose)?;

    tracing::info!("Starting codebridge");

    let config = Config::load().context("Failed to load configuration")?;
    tracing::debug!(config = ?config, "Configuration loaded");

    let dispatcher = QueryDispatcher::from_config(&config)?;
    let registry = Arc::new(SessionRegistry::new());

    let shutdown = CancellationToken::new();
    let reclaimer = spawn_reclaimer(
        Arc::clone(&registry),
        Duration::from_secs(config.sessions.max_idle_secs),
        Duration::from_secs(config.sessions.reclaim_interval_secs),
        shutdown.clone(),
        dispatcher.releaser(),
    );

    let mut repl = Repl::new(
        dispatcher,
        registry,
        ReplOptions {
            user: cli.user,
            channel: cli.channel,
            thread: cli.thread,
            working_dir: cli.cwd,
            system_prompt: cli.system_prompt,
            interactive: cli.interactive,
        },
    );

    let outcome = match cli.prompt {
        Some(prompt) => repl.ask(prompt).await.map_err(anyhow::Error::from),
        None => repl.run().await,
    };

    shutdown.cancel();
    if let Err(e) = reclaimer.await {
        tracing::warn!(error = %e, "Session reclaimer did not shut down cleanly");
    }
    tracing::info!("codebridge stopped");
    outcome
}
