//! mom CLI entry point.

use clap::Parser;
use mom::agent::AgentDeps;
use mom::chat::slack::SlackChat;
use mom::config::Config;
use mom::error::{ConfigError, Error};
use mom::events::EventScheduler;
use mom::llm::AnthropicClient;
use mom::prompts::PromptEngine;
use mom::sandbox::Sandbox;
use mom::supervisor::ChannelRegistry;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Exit code for missing required environment.
const EXIT_ENV: u8 = 1;
/// Exit code for an invalid or unreachable sandbox target.
const EXIT_SANDBOX: u8 = 2;

#[derive(Parser)]
#[command(name = "mom", version)]
#[command(about = "A resident Slack assistant with one stateful agent per channel")]
struct Cli {
    /// Workspace directory (channel logs, events/, MEMORY.md)
    workspace: std::path::PathBuf,

    /// Tool execution backend: host, or docker:<container-name>
    #[arg(long, default_value = "host")]
    sandbox: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("failed to install rustls crypto provider");
        return ExitCode::from(EXIT_ENV);
    }

    let filter = if cli.debug { "mom=debug" } else { "mom=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let config = match Config::resolve(&cli.workspace, &cli.sandbox) {
        Ok(config) => config,
        Err(Error::Config(ConfigError::InvalidSandboxTarget(target))) => {
            eprintln!("invalid sandbox target: {target}");
            return ExitCode::from(EXIT_SANDBOX);
        }
        Err(error) => {
            eprintln!("{error}");
            return ExitCode::from(EXIT_ENV);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("failed to start tokio runtime: {error}");
            return ExitCode::from(EXIT_ENV);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Sandbox(message)) => {
            eprintln!("{message}");
            ExitCode::from(EXIT_SANDBOX)
        }
        Err(RunError::Fatal(message)) => {
            eprintln!("{message}");
            ExitCode::from(EXIT_ENV)
        }
    }
}

enum RunError {
    Sandbox(String),
    Fatal(String),
}

async fn run(config: Config) -> Result<(), RunError> {
    let config = Arc::new(config);
    let sandbox = Arc::new(Sandbox::new(config.sandbox.clone(), config.limits));

    // Probe the backend before touching Slack; a stopped container should
    // fail fast.
    if let Err(error) = sandbox.validate_backend().await {
        return Err(RunError::Sandbox(format!("sandbox probe failed: {error}")));
    }
    tracing::info!(sandbox = %config.sandbox, workspace = %config.workspace.display(), "sandbox validated");

    let slack = Arc::new(
        SlackChat::new(&config.slack_bot_token, &config.slack_app_token)
            .map_err(|error| RunError::Fatal(format!("slack client: {error}")))?,
    );
    let client = Arc::new(AnthropicClient::new(
        config.anthropic_base_url.clone(),
        config.anthropic.clone(),
    ));
    let prompts = Arc::new(
        PromptEngine::new().map_err(|error| RunError::Fatal(format!("prompts: {error}")))?,
    );

    let deps = AgentDeps {
        config: config.clone(),
        sandbox,
        client,
        transport: slack.clone(),
        prompts,
        http: reqwest::Client::new(),
    };
    let registry = Arc::new(ChannelRegistry::new(deps));

    // One inbound queue feeds the registry from both Slack and the event
    // scheduler.
    let (inbound_tx, mut inbound_rx) = mpsc::channel(256);

    slack
        .start_inbound(inbound_tx.clone())
        .await
        .map_err(|error| RunError::Fatal(format!("slack socket mode: {error}")))?;

    let scheduler = EventScheduler::new(
        config.events_dir(),
        inbound_tx,
        std::time::Duration::from_secs(config.limits.event_poll_secs),
    );
    tokio::spawn(scheduler.run());

    let dispatch_registry = registry.clone();
    tokio::spawn(async move {
        while let Some(message) = inbound_rx.recv().await {
            if let Err(error) = dispatch_registry.dispatch(message).await {
                tracing::error!(%error, "failed to dispatch inbound message");
            }
        }
    });

    tracing::info!("mom is up");
    wait_for_shutdown().await;
    tracing::info!("shutting down");
    Ok(())
}

async fn wait_for_shutdown() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(error) => {
            tracing::warn!(%error, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
