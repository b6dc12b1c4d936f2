//! Host-side wiring of the replicated channels to the process bridge

use crate::bridge::ProcessBridge;
use serde::Serialize;
use std::sync::Arc;
use storyrun_common::store::{
    Delivered, Environment, ProviderEvent, RunStateEvent, StoreMessage, WireEvent,
    PROVIDER_CHANNEL, RUN_STATE_CHANNEL,
};
use storyrun_common::{Envelope, FatalError, ProviderState, Result, RunRecord, RunState, Stores};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Boots and tears down the runner in response to channel traffic
pub struct Supervisor {
    stores: Stores,
    bridge: ProcessBridge,
}

impl Supervisor {
    pub fn new(stores: Stores, bridge: ProcessBridge) -> Arc<Self> {
        Arc::new(Self { stores, bridge })
    }

    pub fn bridge(&self) -> &ProcessBridge {
        &self.bridge
    }

    /// Spawn the loop reacting to run-state and provider events
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let mut run_state = self.stores.run_state.subscribe();
        let mut provider = self.stores.provider.subscribe();
        let mut child_events = self.bridge.subscribe_events();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    delivered = run_state.recv() => {
                        let Some(delivered) = delivered else { break };
                        this.on_run_state(delivered);
                    }
                    delivered = provider.recv() => {
                        let Some(delivered) = delivered else { break };
                        this.on_provider(delivered);
                    }
                    event = child_events.recv() => match event {
                        Ok(event) => debug!("Test runner event: {} {:?}", event.kind, event.args),
                        Err(RecvError::Lagged(skipped)) => warn!("Missed {} test runner event(s)", skipped),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("Supervisor stopped");
        })
    }

    fn on_run_state(self: &Arc<Self>, delivered: Delivered<RunState, RunStateEvent>) {
        let StoreMessage::Event(event) = &delivered.message else {
            return;
        };
        match event {
            RunStateEvent::TriggerRun(request) => {
                if delivered.info.actor.environment == Environment::Runner {
                    return;
                }
                info!("Run requested by {}", request.triggered_by);
                match self.init_envelope(RUN_STATE_CHANNEL, &delivered) {
                    Ok(init) => self.spawn_runner(Some(init)),
                    Err(e) => error!("Failed to encode run request: {}", e),
                }
            }
            RunStateEvent::ToggleWatching { to } => {
                // A live runner owns the flag and replicates it back
                if self.bridge.is_live() {
                    return;
                }
                let to = *to;
                self.stores.run_state.set_state(|s| s.watching = to);
                if to {
                    self.spawn_runner(None);
                }
            }
            RunStateEvent::FatalError(fatal) => {
                log_fatal(fatal);
                if self.stores.run_state.state().fatal_error.as_ref() != Some(fatal) {
                    let fatal = fatal.clone();
                    self.stores
                        .run_state
                        .set_state(|s| s.fatal_error = Some(fatal));
                }
                let bridge = self.bridge.clone();
                tokio::spawn(async move { bridge.kill_child().await });
            }
            RunStateEvent::TestRunCompleted(record) => log_completed(record),
            RunStateEvent::CancelRun => debug!("Cancel requested"),
        }
    }

    fn on_provider(self: &Arc<Self>, delivered: Delivered<ProviderState, ProviderEvent>) {
        if delivered.info.actor.environment == Environment::Runner {
            return;
        }
        if let StoreMessage::Event(ProviderEvent::RunAll) = &delivered.message {
            info!("Run-all requested");
            match self.init_envelope(PROVIDER_CHANNEL, &delivered) {
                Ok(init) => self.spawn_runner(Some(init)),
                Err(e) => error!("Failed to encode run-all request: {}", e),
            }
        }
    }

    fn spawn_runner(&self, init: Option<Envelope>) {
        let bridge = self.bridge.clone();
        tokio::spawn(async move {
            // Boot failures are published as fatal errors by the bridge
            if let Err(e) = bridge.run_test_runner(init).await {
                debug!("Test runner unavailable: {}", e);
            }
        });
    }

    /// The observed message, re-encoded for delivery after boot
    fn init_envelope<S: Serialize, E: Serialize>(
        &self,
        channel: &str,
        delivered: &Delivered<S, E>,
    ) -> Result<Envelope> {
        let wire = WireEvent {
            event: serde_json::to_value(&delivered.message)?,
            event_info: delivered.info.clone(),
        };
        let from = self.stores.run_state.actor().environment.wire_label();
        Ok(Envelope::channel(channel, wire, from))
    }
}

/// Log a fatal error with its cause chain
pub fn log_fatal(fatal: &FatalError) {
    error!("{}", fatal.message);
    error!("{}: {}", fatal.error.name, fatal.error.message);
    if let Some(stack) = &fatal.error.stack {
        debug!("{}", stack);
    }
    for cause in fatal.error.chain().skip(1) {
        error!("Caused by: {}: {}", cause.name, cause.message);
    }
}

fn log_completed(record: &RunRecord) {
    let counts = record.component_test_count;
    info!(
        "Run completed: {} passed, {} failed, {} total",
        counts.success,
        counts.error,
        record.total_test_count.unwrap_or_else(|| counts.finished())
    );
    if let Some(coverage) = record.coverage_summary {
        info!("Coverage: {}% ({:?})", coverage.percentage, coverage.status);
    }
    if !record.unhandled_errors.is_empty() {
        warn!("{} unhandled error(s) during the run", record.unhandled_errors.len());
    }
}
