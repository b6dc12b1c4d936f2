//! Run orchestration
//!
//! The orchestrator owns the run lifecycle inside the runner process. It
//! reacts to commands arriving on the replicated channels, records run
//! start, delegates selection and execution to the engine lifecycle
//! manager and publishes the terminal events.

use crate::aggregator::ResultAggregator;
use crate::engine::{EngineLifecycleManager, PreparedRun};
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storyrun_common::store::{ProviderEvent, RunStateEvent, StoreMessage};
use storyrun_common::{
    Error, ErrorLike, FatalError, Result, RunRecord, RunRequest, Stores, TriggeredBy,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle phase of the current run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Running,
    Cancelling,
    Completed,
    Crashed,
}

impl RunPhase {
    pub fn can_transition(self, to: RunPhase) -> bool {
        use RunPhase::*;
        matches!(
            (self, to),
            (Idle | Completed | Crashed, Running)
                | (Running, Cancelling | Completed | Crashed)
                | (Cancelling, Completed | Crashed)
        )
    }

    /// A run is in flight
    pub fn is_active(self) -> bool {
        matches!(self, RunPhase::Running | RunPhase::Cancelling)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::Running => "running",
            RunPhase::Cancelling => "cancelling",
            RunPhase::Completed => "completed",
            RunPhase::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct PhaseState {
    phase: RunPhase,
    /// Bumped for every accepted run; a run only finishes itself while current
    run_id: u64,
    /// Files of the in-flight watch run, carried over if it is superseded
    watch_run: Option<PreparedRun>,
}

impl PhaseState {
    fn transition(&mut self, to: RunPhase) -> Result<()> {
        if !self.phase.can_transition(to) {
            return Err(Error::InvalidTransition {
                from: self.phase.to_string(),
                to: to.to_string(),
            });
        }
        debug!("Run phase {} -> {}", self.phase, to);
        self.phase = to;
        Ok(())
    }
}

/// Coordinates runs inside the runner process
pub struct Orchestrator {
    stores: Stores,
    manager: EngineLifecycleManager,
    aggregator: Arc<ResultAggregator>,
    phase: Mutex<PhaseState>,
}

impl Orchestrator {
    pub fn new(
        stores: Stores,
        manager: EngineLifecycleManager,
        aggregator: Arc<ResultAggregator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            stores,
            manager,
            aggregator,
            phase: Mutex::new(PhaseState {
                phase: RunPhase::Idle,
                run_id: 0,
                watch_run: None,
            }),
        })
    }

    pub fn phase(&self) -> RunPhase {
        self.phase.lock().phase
    }

    pub fn manager(&self) -> &EngineLifecycleManager {
        &self.manager
    }

    /// Start a run for `request`
    ///
    /// Requests arriving while a run is in flight are ignored, except for
    /// watch-triggered runs, which cancel the in-flight run first. A watch
    /// run replacing another watch run also runs the files it replaced.
    pub async fn handle_run_request(&self, request: RunRequest) -> Result<()> {
        self.run(request, None).await
    }

    async fn run(&self, request: RunRequest, mut prepared: Option<PreparedRun>) -> Result<()> {
        let supersedes = request.triggered_by == TriggeredBy::Watch;
        let (run_id, superseded) = {
            let mut phase = self.phase.lock();
            let active = phase.phase.is_active();
            if active && !supersedes {
                info!(
                    "Ignoring run requested by {}: a run is already {}",
                    request.triggered_by, phase.phase
                );
                return Ok(());
            }
            if active {
                phase.transition(RunPhase::Completed)?;
                // Changes the cancelled watch run was covering still need a run
                if let Some(mut carried) = phase.watch_run.take() {
                    if let Some(next) = prepared.take() {
                        carried.absorb(next);
                        prepared = Some(carried);
                    }
                }
            }
            phase.transition(RunPhase::Running)?;
            phase.run_id += 1;
            phase.watch_run = if supersedes { prepared.clone() } else { None };
            (phase.run_id, active)
        };

        if superseded {
            info!("Cancelling the in-flight run for a watch run");
            if let Err(e) = self.manager.cancel_current_run().await {
                warn!("Failed to cancel superseded run: {}", e);
            }
        }

        let entry_ids: Option<Vec<_>> = match &prepared {
            Some(prepared) => Some(prepared.entry_ids.clone()),
            None => request.requested().map(|ids| ids.to_vec()),
        };
        match &entry_ids {
            Some(ids) => {
                self.stores.component_status().unset(Some(ids));
                self.stores.a11y_status().unset(Some(ids));
            }
            None => {
                self.stores.component_status().unset(None);
                self.stores.a11y_status().unset(None);
            }
        }

        self.aggregator.reset();
        let state = self.stores.run_state.set_state(|state| {
            state.fatal_error = None;
            state.current_run =
                RunRecord::started(request.triggered_by.clone(), entry_ids.clone(), state.config);
        });
        info!(
            "Run started by {} ({})",
            request.triggered_by,
            entry_ids
                .as_ref()
                .map_or_else(|| "all entries".to_string(), |ids| format!("{} entries", ids.len()))
        );

        let result = self
            .stores
            .provider
            .run_with_state(async {
                let prepared = match prepared {
                    Some(prepared) => prepared,
                    None => {
                        self.manager
                            .prepare(&request, &state.config, state.watching)
                            .await?
                    }
                };
                let estimate = prepared.entry_ids.len() as u64;
                self.stores
                    .run_state
                    .set_state(|s| s.current_run.total_test_count = Some(estimate));

                self.manager.execute(prepared).await?;
                if !self.is_current(run_id) {
                    return Ok(());
                }

                let run = self.stores.run_state.state().current_run;
                self.stores
                    .run_state
                    .send(RunStateEvent::TestRunCompleted(run.clone()));
                if !run.unhandled_errors.is_empty() {
                    return Err(Error::UnhandledTestErrors {
                        count: run.unhandled_errors.len(),
                    });
                }
                Ok(())
            })
            .await;

        if !self.is_current(run_id) {
            debug!("Run {} was superseded", run_id);
            return Ok(());
        }
        match result {
            Ok(()) => {
                self.finish(run_id, RunPhase::Completed);
                info!("Run completed");
                Ok(())
            }
            Err(e @ Error::UnhandledTestErrors { .. }) => {
                warn!("{}", e);
                self.finish(run_id, RunPhase::Completed);
                Err(e)
            }
            Err(e) => {
                let message = match e {
                    Error::EngineStartup(_) => "Failed to start test engine",
                    _ => "Failed to run tests",
                };
                self.report_fatal_error(message, &e);
                self.finish(run_id, RunPhase::Crashed);
                Err(e)
            }
        }
    }

    fn is_current(&self, run_id: u64) -> bool {
        self.phase.lock().run_id == run_id
    }

    fn finish(&self, run_id: u64, to: RunPhase) {
        let mut phase = self.phase.lock();
        if phase.run_id != run_id {
            return;
        }
        phase.watch_run = None;
        if let Err(e) = phase.transition(to) {
            warn!("{}", e);
        }
    }

    /// Cancel the in-flight run, if any
    ///
    /// `cancelling` is set for the duration and always cleared afterwards.
    pub async fn handle_cancel_request(&self) -> Result<()> {
        self.stores.run_state.set_state(|s| s.cancelling = true);
        {
            let mut phase = self.phase.lock();
            if phase.phase == RunPhase::Running {
                let _ = phase.transition(RunPhase::Cancelling);
            }
        }

        let result = self.manager.cancel_current_run().await;
        self.stores.run_state.set_state(|s| s.cancelling = false);

        if let Err(e) = &result {
            self.report_fatal_error("Failed to cancel tests", e);
        }
        result
    }

    /// Turn coverage off while watching and back on when watching stops
    pub async fn handle_watch_mode_change(&self, watching: bool) -> Result<()> {
        let config = self.stores.run_state.state().config;
        info!("Watch mode {}", if watching { "enabled" } else { "disabled" });
        if !config.coverage || self.manager.current().is_none() {
            return Ok(());
        }
        if let Err(e) = self.manager.restart(!watching).await {
            self.report_fatal_error("Failed to restart test engine", &e);
            return Err(e);
        }
        Ok(())
    }

    /// Re-run the tests affected by a changed file while watching
    pub async fn handle_file_change(&self, path: &Path) -> Result<()> {
        self.handle_file_changes(&[path.to_path_buf()]).await
    }

    /// Re-run the tests affected by any of `paths` as a single run
    pub async fn handle_file_changes(&self, paths: &[PathBuf]) -> Result<()> {
        let watching = self.stores.run_state.state().watching;
        match self.manager.on_files_changed(paths, watching).await? {
            Some(prepared) => {
                let request = RunRequest {
                    triggered_by: TriggeredBy::Watch,
                    entry_ids: Some(prepared.entry_ids.clone()),
                };
                self.run(request, Some(prepared)).await
            }
            None => Ok(()),
        }
    }

    /// Publish a fatal error on the run-state channel
    pub fn report_fatal_error(&self, message: &str, err: &Error) {
        error!("{}: {}", message, err);
        let fatal = FatalError {
            message: message.to_string(),
            error: ErrorLike::from_error(err),
        };
        self.stores
            .run_state
            .set_state(|s| s.fatal_error = Some(fatal.clone()));
        self.stores.run_state.send(RunStateEvent::FatalError(fatal));
    }

    /// Spawn the loop reacting to commands on the replicated channels
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let mut run_state = self.stores.run_state.subscribe();
        let mut provider = self.stores.provider.subscribe();
        let mut watching = self.stores.run_state.state().watching;

        tokio::spawn(async move {
            info!("Orchestrator started");
            loop {
                tokio::select! {
                    delivered = run_state.recv() => {
                        let Some(delivered) = delivered else { break };
                        match delivered.message {
                            StoreMessage::Event(event) => this.dispatch(event),
                            StoreMessage::SetState(state) if state.watching != watching => {
                                watching = state.watching;
                                let this = this.clone();
                                tokio::spawn(async move {
                                    let _ = this.handle_watch_mode_change(watching).await;
                                });
                            }
                            StoreMessage::SetState(_) => {}
                        }
                    }
                    delivered = provider.recv() => {
                        let Some(delivered) = delivered else { break };
                        if let StoreMessage::Event(event) = delivered.message {
                            this.dispatch_provider(event);
                        }
                    }
                }
            }
            info!("Orchestrator stopped");
        })
    }

    fn dispatch(self: &Arc<Self>, event: RunStateEvent) {
        let this = self.clone();
        match event {
            RunStateEvent::TriggerRun(request) => {
                tokio::spawn(async move {
                    if let Err(e) = this.handle_run_request(request).await {
                        debug!("Run request failed: {}", e);
                    }
                });
            }
            RunStateEvent::CancelRun => {
                tokio::spawn(async move {
                    let _ = this.handle_cancel_request().await;
                });
            }
            // The command loop reacts to the resulting state change
            RunStateEvent::ToggleWatching { to } => {
                self.stores.run_state.set_state(|s| s.watching = to);
            }
            RunStateEvent::TestRunCompleted(_) | RunStateEvent::FatalError(_) => {}
        }
    }

    fn dispatch_provider(self: &Arc<Self>, event: ProviderEvent) {
        match event {
            ProviderEvent::RunAll => {
                let this = self.clone();
                tokio::spawn(async move {
                    let request = RunRequest {
                        triggered_by: TriggeredBy::RunAll,
                        entry_ids: None,
                    };
                    if let Err(e) = this.handle_run_request(request).await {
                        debug!("Run-all request failed: {}", e);
                    }
                });
            }
            ProviderEvent::ClearAll => {
                info!("Clearing all test statuses");
                self.stores.component_status().unset(None);
                self.stores.a11y_status().unset(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::engine::testing::{self, failed, passed, FakeFactory, FakeScript};
    use crate::engine::CoverageRequirement;
    use std::time::Duration;
    use storyrun_common::{
        Config, CoverageStatus, CoverageSummary, Environment, ProviderState, Status, StatusValue,
        StoryrunConfig,
    };

    struct Harness {
        stores: Stores,
        factory: Arc<FakeFactory>,
        orchestrator: Arc<Orchestrator>,
    }

    fn harness() -> Harness {
        let stores = Stores::new(Environment::Runner);
        let factory = Arc::new(FakeFactory::new());
        let aggregator = ResultAggregator::new(stores.clone(), &StoryrunConfig::default());
        let manager = EngineLifecycleManager::new(
            factory.clone(),
            aggregator.clone(),
            Arc::new(StaticCatalog::new(testing::catalog())),
        );
        let orchestrator = Orchestrator::new(stores.clone(), manager, aggregator);
        Harness {
            stores,
            factory,
            orchestrator,
        }
    }

    fn focused(entry_id: &str) -> RunRequest {
        RunRequest {
            triggered_by: TriggeredBy::EntryType("story".into()),
            entry_ids: Some(vec![entry_id.to_string()]),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[test]
    fn test_phase_transitions() {
        use RunPhase::*;
        assert!(Idle.can_transition(Running));
        assert!(Running.can_transition(Cancelling));
        assert!(Cancelling.can_transition(Crashed));
        assert!(Completed.can_transition(Running));
        assert!(!Idle.can_transition(Completed));
        assert!(!Cancelling.can_transition(Running));

        let mut state = PhaseState {
            phase: Idle,
            run_id: 0,
            watch_run: None,
        };
        let err = state.transition(Cancelling).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { from, to } if from == "idle" && to == "cancelling"));
    }

    #[tokio::test]
    async fn test_global_run_records_start_and_estimate() {
        let h = harness();
        h.factory.set_script(FakeScript {
            hang: true,
            ..FakeScript::default()
        });

        let run = tokio::spawn({
            let orchestrator = h.orchestrator.clone();
            async move { orchestrator.handle_run_request(RunRequest::global()).await }
        });
        let factory = h.factory.clone();
        wait_until(move || factory.created().first().map_or(false, |e| e.is_running())).await;

        let current = h.stores.run_state.state().current_run;
        assert_eq!(current.triggered_by, Some(TriggeredBy::Global));
        assert!(current.started_at.is_some());
        assert_eq!(current.total_test_count, Some(3));
        assert!(current.coverage_summary.is_none());
        assert_eq!(h.orchestrator.phase(), RunPhase::Running);
        assert_eq!(h.stores.provider.state(), ProviderState::Running);

        h.orchestrator.handle_cancel_request().await.unwrap();
        run.await.unwrap().unwrap();
        assert_eq!(h.orchestrator.phase(), RunPhase::Completed);
        assert!(!h.stores.run_state.state().cancelling);
    }

    #[tokio::test]
    async fn test_completed_run_publishes_final_record() {
        let h = harness();
        h.factory.set_script(FakeScript {
            results: vec![passed("button--primary"), failed("button--secondary")],
            ..FakeScript::default()
        });
        let mut events = h.stores.run_state.subscribe();

        h.orchestrator.handle_run_request(RunRequest::global()).await.unwrap();

        let run = h.stores.run_state.state().current_run;
        assert_eq!(run.component_test_count.success, 1);
        assert_eq!(run.component_test_count.error, 1);
        assert_eq!(run.total_test_count, Some(2));
        assert!(run.finished_at.is_some());
        assert_eq!(h.stores.provider.state(), ProviderState::Succeeded);

        let mut completed = None;
        while let Some(delivered) = events.try_recv() {
            if let StoreMessage::Event(RunStateEvent::TestRunCompleted(record)) = delivered.message {
                completed = Some(record);
            }
        }
        assert_eq!(completed, Some(run));
    }

    #[tokio::test]
    async fn test_full_coverage_run_records_summary() {
        let h = harness();
        h.stores.run_state.set_state(|s| {
            s.config = Config {
                coverage: true,
                a11y: false,
            }
        });
        h.factory.set_script(FakeScript {
            results: vec![passed("button--primary"), passed("card--default")],
            coverage_pct: Some(83.0),
            ..FakeScript::default()
        });
        let mut events = h.stores.run_state.subscribe();

        h.orchestrator.handle_run_request(RunRequest::global()).await.unwrap();

        assert!(h.factory.created()[0].coverage());
        let expected = CoverageSummary {
            percentage: 83,
            status: CoverageStatus::Positive,
        };
        let run = h.stores.run_state.state().current_run;
        assert_eq!(run.coverage_summary, Some(expected));

        let mut completed = None;
        while let Some(delivered) = events.try_recv() {
            if let StoreMessage::Event(RunStateEvent::TestRunCompleted(record)) = delivered.message {
                completed = Some(record);
            }
        }
        assert_eq!(completed.and_then(|r| r.coverage_summary), Some(expected));
    }

    #[tokio::test]
    async fn test_coverage_restart_happens_once() {
        let h = harness();
        h.orchestrator.handle_run_request(RunRequest::global()).await.unwrap();
        assert_eq!(h.factory.created().len(), 1);

        h.stores.run_state.set_state(|s| {
            s.config = Config {
                coverage: true,
                a11y: false,
            }
        });
        h.orchestrator.handle_run_request(RunRequest::global()).await.unwrap();
        let created = h.factory.created();
        assert_eq!(created.len(), 2);
        assert!(created[1].coverage());
        assert_eq!(created[1].runs().len(), 1);

        h.orchestrator.handle_run_request(focused("button--primary")).await.unwrap();
        assert_eq!(h.factory.created().len(), 2);
        assert_eq!(created[1].runs().len(), 2);
    }

    #[tokio::test]
    async fn test_focused_run_scopes_filter_and_statuses() {
        let h = harness();
        let status = |entry_id: &str| Status {
            entry_id: entry_id.to_string(),
            type_id: String::new(),
            value: StatusValue::Error,
            title: String::new(),
            description: String::new(),
        };
        h.stores
            .component_status()
            .set(vec![status("button--primary"), status("card--default")]);

        h.orchestrator.handle_run_request(focused("button--primary")).await.unwrap();

        let plan = &h.factory.created()[0].runs()[0];
        assert_eq!(plan.name_pattern.as_ref().unwrap().as_str(), "^Primary$");
        assert_eq!(plan.files.len(), 1);
        assert!(h.stores.component_status().get("button--primary").is_none());
        assert_eq!(
            h.stores.component_status().get("card--default").unwrap().value,
            StatusValue::Error
        );
        assert_eq!(
            h.stores.run_state.state().current_run.entry_ids,
            Some(vec!["button--primary".to_string()])
        );
    }

    #[tokio::test]
    async fn test_cancel_without_run_only_toggles_flag() {
        let h = harness();
        let before = h.stores.run_state.state();
        let mut sub = h.stores.run_state.subscribe();

        h.orchestrator.handle_cancel_request().await.unwrap();

        let mut flags = Vec::new();
        while let Some(delivered) = sub.try_recv() {
            if let StoreMessage::SetState(state) = delivered.message {
                flags.push(state.cancelling);
            }
        }
        assert_eq!(flags, vec![true, false]);
        assert_eq!(h.stores.run_state.state(), before);
        assert_eq!(h.orchestrator.phase(), RunPhase::Idle);
    }

    #[tokio::test]
    async fn test_unhandled_errors_fail_completed_run() {
        let h = harness();
        h.factory.set_script(FakeScript {
            results: vec![passed("button--primary")],
            unhandled: vec![ErrorLike::new("Error", "leaked timer")],
            ..FakeScript::default()
        });

        let err = h
            .orchestrator
            .handle_run_request(RunRequest::global())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnhandledTestErrors { count: 1 }));
        assert_eq!(h.stores.provider.state(), ProviderState::Crashed);
        assert_eq!(h.orchestrator.phase(), RunPhase::Completed);

        let state = h.stores.run_state.state();
        assert!(state.fatal_error.is_none());
        assert!(state.current_run.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_run_failure_is_fatal_and_returned() {
        let h = harness();
        h.factory.set_script(FakeScript {
            fail_run: Some("worker exited".into()),
            ..FakeScript::default()
        });

        let err = h
            .orchestrator
            .handle_run_request(RunRequest::global())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Engine(_)));
        assert_eq!(h.orchestrator.phase(), RunPhase::Crashed);

        let state = h.stores.run_state.state();
        let fatal = state.fatal_error.unwrap();
        assert_eq!(fatal.message, "Failed to run tests");
        assert_eq!(fatal.error.name, "EngineError");
        assert!(state.current_run.finished_at.is_none());

        // The next run starts over
        h.factory.set_script(FakeScript::default());
        h.orchestrator.handle_run_request(RunRequest::global()).await.unwrap();
        assert!(h.stores.run_state.state().fatal_error.is_none());
    }

    #[tokio::test]
    async fn test_request_during_run_is_ignored() {
        let h = harness();
        h.factory.set_script(FakeScript {
            hang: true,
            ..FakeScript::default()
        });
        let run = tokio::spawn({
            let orchestrator = h.orchestrator.clone();
            async move { orchestrator.handle_run_request(RunRequest::global()).await }
        });
        let factory = h.factory.clone();
        wait_until(move || factory.created().first().map_or(false, |e| e.is_running())).await;

        h.orchestrator.handle_run_request(focused("card--default")).await.unwrap();
        assert_eq!(h.factory.created()[0].runs().len(), 1);
        assert_eq!(h.stores.run_state.state().current_run.triggered_by, Some(TriggeredBy::Global));

        h.orchestrator.handle_cancel_request().await.unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_file_change_supersedes_running_run() {
        let h = harness();
        h.factory.set_script(FakeScript {
            hang: true,
            ..FakeScript::default()
        });
        h.stores.run_state.set_state(|s| s.watching = true);
        let run = tokio::spawn({
            let orchestrator = h.orchestrator.clone();
            async move { orchestrator.handle_run_request(RunRequest::global()).await }
        });
        let factory = h.factory.clone();
        wait_until(move || factory.created().first().map_or(false, |e| e.is_running())).await;

        h.factory.set_script(FakeScript {
            results: vec![passed("card--default")],
            ..FakeScript::default()
        });
        h.orchestrator
            .handle_file_change(Path::new(testing::CARD_COMPONENT))
            .await
            .unwrap();
        run.await.unwrap().unwrap();

        let engine = &h.factory.created()[0];
        assert_eq!(engine.cancel_calls(), 1);
        let runs = engine.runs();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].files[0].path, Path::new(testing::CARD_STORIES));

        let current = h.stores.run_state.state().current_run;
        assert_eq!(current.triggered_by, Some(TriggeredBy::Watch));
        assert_eq!(current.entry_ids, Some(vec!["card--default".to_string()]));
        assert_eq!(current.component_test_count.success, 1);
        assert_eq!(h.orchestrator.phase(), RunPhase::Completed);
    }

    #[tokio::test]
    async fn test_superseding_watch_run_keeps_earlier_changes() {
        let h = harness();
        h.orchestrator
            .manager()
            .ensure_engine(CoverageRequirement::Any)
            .await
            .unwrap();
        h.factory.set_script(FakeScript {
            hang: true,
            ..FakeScript::default()
        });
        h.stores.run_state.set_state(|s| s.watching = true);

        let theme_run = tokio::spawn({
            let orchestrator = h.orchestrator.clone();
            async move {
                orchestrator
                    .handle_file_change(Path::new(testing::THEME))
                    .await
            }
        });
        let factory = h.factory.clone();
        wait_until(move || factory.created()[0].is_running()).await;

        h.factory.set_script(FakeScript {
            results: vec![
                passed("button--primary"),
                passed("button--secondary"),
                passed("card--default"),
            ],
            ..FakeScript::default()
        });
        h.orchestrator
            .handle_file_change(Path::new(testing::CARD_COMPONENT))
            .await
            .unwrap();
        theme_run.await.unwrap().unwrap();

        let engine = &h.factory.created()[0];
        let runs = engine.runs();
        assert_eq!(runs.len(), 2);
        let files: Vec<_> = runs[1].files.iter().map(|f| f.path.clone()).collect();
        assert_eq!(
            files,
            vec![PathBuf::from(testing::BUTTON_STORIES), PathBuf::from(testing::CARD_STORIES)]
        );

        let current = h.stores.run_state.state().current_run;
        assert_eq!(
            current.entry_ids,
            Some(vec![
                "button--primary".to_string(),
                "button--secondary".to_string(),
                "card--default".to_string()
            ])
        );
        assert_eq!(current.component_test_count.success, 3);
        assert_eq!(h.orchestrator.phase(), RunPhase::Completed);
    }

    #[tokio::test]
    async fn test_file_change_batch_is_one_run() {
        let h = harness();
        h.orchestrator
            .manager()
            .ensure_engine(CoverageRequirement::Any)
            .await
            .unwrap();
        h.stores.run_state.set_state(|s| s.watching = true);

        h.orchestrator
            .handle_file_changes(&[
                PathBuf::from(testing::THEME),
                PathBuf::from(testing::CARD_COMPONENT),
            ])
            .await
            .unwrap();

        let runs = h.factory.created()[0].runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].files.len(), 2);
        assert_eq!(h.factory.created()[0].cancel_calls(), 0);
    }

    #[tokio::test]
    async fn test_toggle_watching_restarts_without_coverage() {
        let h = harness();
        h.stores.run_state.set_state(|s| {
            s.config = Config {
                coverage: true,
                a11y: false,
            }
        });
        h.orchestrator.handle_run_request(RunRequest::global()).await.unwrap();
        assert!(h.factory.created()[0].coverage());

        let _loop = h.orchestrator.start();
        h.stores
            .run_state
            .send(RunStateEvent::ToggleWatching { to: true });

        let factory = h.factory.clone();
        wait_until(move || factory.created().len() == 2).await;
        assert!(h.stores.run_state.state().watching);
        let created = h.factory.created();
        assert!(created[0].is_closed());
        assert!(!created[1].coverage());
    }

    #[tokio::test]
    async fn test_command_loop_handles_replicated_events() {
        let h = harness();
        let _loop = h.orchestrator.start();
        let mut sub = h.stores.run_state.subscribe();

        h.stores.provider.send(ProviderEvent::RunAll);

        let record = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(delivered) = sub.recv().await {
                    if let StoreMessage::Event(RunStateEvent::TestRunCompleted(record)) =
                        delivered.message
                    {
                        return record;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(record.triggered_by, Some(TriggeredBy::RunAll));
    }
}
