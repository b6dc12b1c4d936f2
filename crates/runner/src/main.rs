//! storyrun runner process
//!
//! Started by the host with piped stdio. Stdout carries envelopes only.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use storyrun_common::config::{CHILD_PROCESS_ENV, CONFIG_ENV, DEFAULT_CONFIG_FILE};
use storyrun_common::{Environment, Stores, StoryrunConfig, VERSION};
use storyrun_runner::catalog::HttpCatalog;
use storyrun_runner::engine::command::CommandEngineFactory;
use storyrun_runner::transport::{self, Transport};
use storyrun_runner::watcher::FileWatcher;
use storyrun_runner::{EngineLifecycleManager, Orchestrator, ResultAggregator};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "storyrun-runner")]
#[command(about = "storyrun runner - executes component tests for the storyrun host")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = CONFIG_ENV, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    transport::install_panic_hook();
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .with(filter)
        .init();

    info!("storyrun runner v{}", VERSION);
    if std::env::var_os(CHILD_PROCESS_ENV).is_none() {
        warn!("{} is not set; the runner expects to be started by the host", CHILD_PROCESS_ENV);
    }

    let config = StoryrunConfig::load(&cli.config)?;
    let stores = Stores::new(Environment::Runner);
    let transport = Transport::start(&stores, tokio::io::stdout());

    let aggregator = ResultAggregator::new(stores.clone(), &config);
    let catalog = Arc::new(HttpCatalog::new(&config.catalog)?);
    let factory = Arc::new(CommandEngineFactory::new(config.engine.clone()));
    let manager = EngineLifecycleManager::new(factory, aggregator.clone(), catalog);
    let orchestrator = Orchestrator::new(stores.clone(), manager.clone(), aggregator);
    let commands = orchestrator.start();

    let _watcher = match FileWatcher::new(
        &config.engine.root,
        config.engine.ignore_dirs.clone(),
        config.watch_debounce(),
        orchestrator.clone(),
    ) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!("Watch mode unavailable: {}", e);
            None
        }
    };

    let inbound = stores.clone();
    let reader = tokio::spawn(async move { transport::read_loop(tokio::io::stdin(), &inbound).await });
    transport.announce_ready()?;

    // Wait for shutdown signal or the host going away
    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
        result = reader => match result {
            Ok(Ok(())) => info!("Host disconnected"),
            Ok(Err(e)) => error!("Host connection failed: {}", e),
            Err(e) => error!("Reader task failed: {}", e),
        }
    }

    commands.abort();
    if let Err(e) = manager.close().await {
        warn!("Failed to close test engine: {}", e);
    }
    transport.shutdown().await;

    info!("Runner shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
