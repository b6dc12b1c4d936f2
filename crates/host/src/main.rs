//! storyrun CLI
//!
//! Runs catalog component tests through a supervised runner process.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use storyrun_common::config::{CONFIG_ENV, DEFAULT_CONFIG_FILE};
use storyrun_common::store::{RunStateEvent, RunStateStore, StoreMessage, StoreSubscription};
use storyrun_common::{
    Config, Environment, RunRecord, RunRequest, RunState, Stores, StoryrunConfig, TriggeredBy,
    VERSION,
};
use storyrun_host::{ProcessBridge, Supervisor};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Tests passed
const EXIT_OK: u8 = 0;
/// Tests failed or unhandled errors were recorded
const EXIT_TESTS_FAILED: u8 = 1;
/// The run could not complete
const EXIT_FATAL: u8 = 2;

const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// storyrun - run catalog component tests
#[derive(Parser)]
#[command(name = "storyrun")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = CONFIG_ENV, default_value = DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests, all of them or the given entries
    Run {
        /// Catalog entry to run (repeatable)
        #[arg(long = "entry", value_name = "ID")]
        entries: Vec<String>,

        /// Collect coverage on full runs
        #[arg(long)]
        coverage: bool,

        /// Report accessibility results
        #[arg(long)]
        a11y: bool,

        /// Keep running affected tests on file changes
        #[arg(long)]
        watch: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    debug!("storyrun v{}", VERSION);
    let config = StoryrunConfig::load(&cli.config)?;

    let code = match cli.command {
        Commands::Run {
            entries,
            coverage,
            a11y,
            watch,
        } => run(config, cli.config, entries, Config { coverage, a11y }, watch).await,
    };
    Ok(ExitCode::from(code))
}

async fn run(
    config: StoryrunConfig,
    config_path: PathBuf,
    entries: Vec<String>,
    test_config: Config,
    watch: bool,
) -> u8 {
    let stores = Stores::new(Environment::Server);
    stores.run_state.set_state(|s| {
        s.config = test_config;
        s.watching = watch;
    });

    let bridge = ProcessBridge::new(config, Some(config_path), stores.clone());
    let supervisor = Supervisor::new(stores.clone(), bridge.clone());
    let supervisor_handle = supervisor.start();
    let mut sub = stores.run_state.subscribe();

    let request = if entries.is_empty() {
        RunRequest::global()
    } else {
        RunRequest {
            triggered_by: TriggeredBy::External("cli".into()),
            entry_ids: Some(entries),
        }
    };
    info!(
        "Starting {} run{}",
        request.triggered_by,
        if watch { " in watch mode" } else { "" }
    );
    stores.run_state.send(RunStateEvent::TriggerRun(request));

    let interrupted = shutdown_signal();
    tokio::pin!(interrupted);
    let mut last = None;

    let code = loop {
        tokio::select! {
            delivered = sub.recv() => {
                let Some(delivered) = delivered else { break EXIT_FATAL };
                match delivered.message {
                    StoreMessage::Event(RunStateEvent::TestRunCompleted(record)) => {
                        let code = exit_code(&record);
                        if !watch {
                            break code;
                        }
                        info!("Waiting for file changes");
                        last = Some(code);
                    }
                    StoreMessage::Event(RunStateEvent::FatalError(_)) => break EXIT_FATAL,
                    StoreMessage::SetState(state) => report_progress(&state),
                    StoreMessage::Event(_) => {}
                }
            }
            _ = &mut interrupted => {
                info!("Interrupted");
                cancel_in_flight(&stores.run_state, &mut sub).await;
                break last.unwrap_or(EXIT_TESTS_FAILED);
            }
        }
    };

    supervisor_handle.abort();
    bridge.shutdown().await;
    code
}

fn exit_code(record: &RunRecord) -> u8 {
    if record.component_test_count.error > 0 || !record.unhandled_errors.is_empty() {
        EXIT_TESTS_FAILED
    } else {
        EXIT_OK
    }
}

fn report_progress(state: &RunState) {
    let run = &state.current_run;
    if run.started_at.is_none() || run.is_finished() {
        return;
    }
    debug!(
        "{}/{} finished",
        run.component_test_count.finished(),
        run.total_test_count
            .map_or_else(|| "?".to_string(), |t| t.to_string())
    );
}

/// Ask the runner to cancel a run in progress and wait for it to settle
async fn cancel_in_flight(
    run_state: &RunStateStore,
    sub: &mut StoreSubscription<RunState, RunStateEvent>,
) {
    let current = run_state.state().current_run;
    if current.started_at.is_none() || current.is_finished() {
        return;
    }
    info!("Cancelling the current run");
    run_state.send(RunStateEvent::CancelRun);

    let settled = tokio::time::timeout(CANCEL_GRACE, async {
        while let Some(delivered) = sub.recv().await {
            match delivered.message {
                StoreMessage::Event(RunStateEvent::TestRunCompleted(_))
                | StoreMessage::Event(RunStateEvent::FatalError(_)) => return,
                _ => {}
            }
        }
    })
    .await;
    if settled.is_err() {
        warn!("Run did not settle within {:?}", CANCEL_GRACE);
    }
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
            error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
