//! `localchat-agent`: run one tool-calling turn against a local model server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use localchat_agent::agent_core::{
    EmptyToolRegistry, LoopController, Termination, TimingTracker, ToolRegistry, Transcript,
    TurnLimits,
};
use localchat_agent::inference::config::{find_config_path, load_config};
use localchat_agent::inference::{ChatMessage, InferenceClient};
use localchat_agent::{data_dir, init_tracing, LogFormat};

#[derive(Debug, Parser)]
#[command(name = "localchat-agent", version, about)]
struct Args {
    /// Path to agent.yaml (defaults to $LOCALCHAT_CONFIG, then ./config/agent.yaml upward).
    #[arg(long)]
    config: Option<PathBuf>,

    /// The user message for this turn.
    #[arg(long)]
    prompt: String,

    /// Optional system prompt.
    #[arg(long)]
    system: Option<String>,

    #[arg(long)]
    max_iterations: Option<u32>,

    #[arg(long)]
    stagnation_limit: Option<u32>,

    /// Write JSON log lines instead of plain text.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let format = if args.log_json { LogFormat::Json } else { LogFormat::Text };
    let log_path = init_tracing(&data_dir(), format).context("failed to initialize logging")?;

    let config_path = match args.config {
        Some(path) => path,
        None => {
            let cwd = std::env::current_dir().context("cannot read current directory")?;
            find_config_path(&cwd)?
        }
    };
    let config = load_config(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let settings = config.settings();
    tracing::info!(config = %config_path.display(), base_url = %config.endpoint.base_url, "config loaded");

    let mut limits = TurnLimits::from(&settings);
    if let Some(n) = args.max_iterations {
        limits.max_iterations = n;
    }
    if let Some(n) = args.stagnation_limit {
        limits.stagnation_limit = n;
    }

    let idle_timeout = config.endpoint.stream_idle_timeout();
    let client = InferenceClient::new(config.endpoint)?;
    if !client.health_check().await.unwrap_or(false) {
        eprintln!("warning: {} did not answer the health check", client.base_url());
    }

    let registry = Arc::new(EmptyToolRegistry);
    let tools = registry.enabled_definitions();
    let controller = LoopController::new(
        Arc::new(client),
        registry,
        Arc::new(TimingTracker::new()),
        settings,
    )
    .with_idle_timeout(idle_timeout);

    let mut history = Vec::new();
    if let Some(system) = args.system {
        history.push(ChatMessage::system(system));
    }
    history.push(ChatMessage::user(args.prompt));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let mut transcript = Transcript::new();
    let outcome = controller
        .run_turn(history, tools, &cancel, limits, &mut transcript)
        .await;

    println!("{}", outcome.final_text);
    match &outcome.termination {
        Termination::Success => eprintln!("-- done in {} iteration(s)", outcome.iterations),
        Termination::Stopped(reason) => eprintln!(
            "-- stopped after {} iteration(s): {reason} (log: {})",
            outcome.iterations,
            log_path.display()
        ),
    }
    Ok(())
}
