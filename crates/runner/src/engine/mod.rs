//! Engine lifecycle
//!
//! Keeps exactly one live test engine per runner process, restarts it when
//! the coverage setting a run needs differs from the one it was created
//! with, and turns catalog-level run requests into engine-level plans.

pub mod command;

#[cfg(test)]
pub(crate) mod testing;

use crate::catalog::Catalog;
use crate::selection::{self, NamePattern, ParentPredicate, TagFilter};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storyrun_common::{
    Config, EntryId, Error, Result, RunEndReport, RunRequest, TestCaseReport,
};
use tracing::{debug, info, warn};

/// A test-bearing file known to the engine
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestFile {
    pub path: PathBuf,
    pub project: Option<String>,
}

/// An engine project and the environment its tag filters come from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectInfo {
    pub name: String,
    pub env: HashMap<String, String>,
}

/// What the engine should execute
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunPlan {
    pub files: Vec<TestFile>,
    pub name_pattern: Option<NamePattern>,
    /// Every known test is being run
    pub all_tests: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub coverage: bool,
}

/// Receives what the engine observes during a run
pub trait EngineReporter: Send + Sync {
    fn on_test_case_result(&self, report: TestCaseReport);

    /// Terminal signal of a run
    fn on_run_end(&self, report: RunEndReport);

    /// Statements coverage of the finished run, in percent
    fn on_coverage(&self, statements_pct: f64);
}

/// The underlying test-execution engine
#[async_trait]
pub trait TestEngine: Send + Sync {
    /// Every test-bearing file the engine knows about
    async fn test_files(&self) -> Result<Vec<TestFile>>;

    fn projects(&self) -> Vec<ProjectInfo>;

    /// Execute `plan`, resolving once the run has ended
    async fn run(&self, plan: RunPlan) -> Result<()>;

    /// Ask the in-flight run, if any, to stop
    async fn cancel(&self) -> Result<()>;

    /// Resolve once no run is in flight
    async fn wait_idle(&self);

    async fn close(&self) -> Result<()>;

    /// Drop whatever the engine cached about `path`
    fn invalidate(&self, path: &Path);

    /// Direct local imports of `path`
    async fn dependencies(&self, path: &Path) -> Result<Vec<PathBuf>>;
}

/// Creates engine instances
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        options: EngineOptions,
        reporter: Arc<dyn EngineReporter>,
    ) -> Result<Arc<dyn TestEngine>>;
}

/// The current engine instance
#[derive(Clone)]
pub struct EngineHandle {
    pub engine: Arc<dyn TestEngine>,
    pub coverage: bool,
    pub generation: u64,
    /// Tag filters per project, resolved when the engine was created
    pub tag_filters: Arc<HashMap<String, TagFilter>>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("coverage", &self.coverage)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Coverage setting the next run needs from the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageRequirement {
    Required(bool),
    /// Whatever engine is live will do
    Any,
}

impl CoverageRequirement {
    /// Full runs collect coverage when enabled and not watching. Focused
    /// runs never turn coverage on, and keep a coverage engine if one is live.
    pub fn for_run(config: &Config, watching: bool, focused: bool) -> Self {
        if focused && config.coverage {
            CoverageRequirement::Any
        } else {
            CoverageRequirement::Required(config.coverage && !watching && !focused)
        }
    }

    fn satisfied_by(&self, handle: &EngineHandle) -> bool {
        match self {
            CoverageRequirement::Required(coverage) => handle.coverage == *coverage,
            CoverageRequirement::Any => true,
        }
    }

    fn coverage(&self) -> bool {
        matches!(self, CoverageRequirement::Required(true))
    }
}

/// A resolved run, ready to execute
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRun {
    pub plan: RunPlan,
    /// In-scope entries of the planned files
    pub entry_ids: Vec<EntryId>,
}

impl PreparedRun {
    /// Fold another file-scoped run into this one, keeping first-seen order
    pub fn absorb(&mut self, other: PreparedRun) {
        for file in other.plan.files {
            if !self.plan.files.contains(&file) {
                self.plan.files.push(file);
            }
        }
        for id in other.entry_ids {
            if !self.entry_ids.contains(&id) {
                self.entry_ids.push(id);
            }
        }
    }
}

type RestartFuture = Shared<BoxFuture<'static, std::result::Result<EngineHandle, Arc<Error>>>>;

struct PendingRestart {
    coverage: bool,
    future: RestartFuture,
}

#[derive(Default)]
struct ManagerState {
    current: Option<EngineHandle>,
    pending: Option<PendingRestart>,
    generation: u64,
}

struct ManagerInner {
    factory: Arc<dyn EngineFactory>,
    reporter: Arc<dyn EngineReporter>,
    catalog: Arc<dyn Catalog>,
    is_parent: ParentPredicate,
    state: Mutex<ManagerState>,
}

/// Owner of the runner's single engine instance
#[derive(Clone)]
pub struct EngineLifecycleManager {
    inner: Arc<ManagerInner>,
}

impl EngineLifecycleManager {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        reporter: Arc<dyn EngineReporter>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                factory,
                reporter,
                catalog,
                is_parent: selection::default_parent_predicate(),
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    /// Replace how parent entries are recognised
    pub fn with_parent_predicate(self, is_parent: ParentPredicate) -> Self {
        let inner = ManagerInner {
            factory: self.inner.factory.clone(),
            reporter: self.inner.reporter.clone(),
            catalog: self.inner.catalog.clone(),
            is_parent,
            state: Mutex::new(ManagerState::default()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The live engine, if any
    pub fn current(&self) -> Option<EngineHandle> {
        self.inner.state.lock().current.clone()
    }

    /// Number of engines created so far
    pub fn generation(&self) -> u64 {
        self.inner.state.lock().generation
    }

    /// The live engine once any pending restart has settled
    async fn current_settled(&self) -> Option<EngineHandle> {
        let pending = self
            .inner
            .state
            .lock()
            .pending
            .as_ref()
            .map(|p| p.future.clone());
        if let Some(restart) = pending {
            // The restart's own caller reports its failure
            let _ = restart.await;
        }
        self.current()
    }

    /// An engine satisfying `requirement`, creating or restarting as needed
    pub async fn ensure_engine(&self, requirement: CoverageRequirement) -> Result<EngineHandle> {
        match self.current_settled().await {
            Some(handle) if requirement.satisfied_by(&handle) => Ok(handle),
            Some(handle) => {
                info!(
                    "Restarting engine: coverage {} -> {}",
                    handle.coverage,
                    requirement.coverage()
                );
                self.restart(requirement.coverage()).await
            }
            None => self.restart(requirement.coverage()).await,
        }
    }

    /// Replace the engine with one created with `coverage`
    ///
    /// Concurrent callers share one pending restart. A caller that needs a
    /// different coverage setting than the pending one waits for it and
    /// then restarts again.
    pub async fn restart(&self, coverage: bool) -> Result<EngineHandle> {
        loop {
            let (pending_coverage, restart) = {
                let mut state = self.inner.state.lock();
                match &state.pending {
                    Some(pending) => (pending.coverage, pending.future.clone()),
                    None => {
                        let future = self.clone().replace_engine(coverage).boxed().shared();
                        state.pending = Some(PendingRestart {
                            coverage,
                            future: future.clone(),
                        });
                        (coverage, future)
                    }
                }
            };

            let result = restart.await;
            if pending_coverage != coverage {
                debug!("Coalesced restart used coverage {}, restarting again", pending_coverage);
                continue;
            }
            return result.map_err(|e| Error::from_shared(&e));
        }
    }

    async fn replace_engine(self, coverage: bool) -> std::result::Result<EngineHandle, Arc<Error>> {
        let previous = self.current();
        if let Some(old) = previous {
            old.engine.wait_idle().await;
            if let Err(e) = old.engine.close().await {
                warn!("Failed to close engine generation {}: {}", old.generation, e);
            }
        }

        let created = self
            .inner
            .factory
            .create(EngineOptions { coverage }, self.inner.reporter.clone())
            .await;

        let mut state = self.inner.state.lock();
        state.pending = None;
        match created {
            Ok(engine) => {
                let tag_filters = engine
                    .projects()
                    .into_iter()
                    .map(|p| (p.name, TagFilter::from_env(&p.env)))
                    .collect();
                state.generation += 1;
                let handle = EngineHandle {
                    engine,
                    coverage,
                    generation: state.generation,
                    tag_filters: Arc::new(tag_filters),
                };
                state.current = Some(handle.clone());
                info!(
                    "Engine generation {} started (coverage: {})",
                    handle.generation, coverage
                );
                Ok(handle)
            }
            Err(e) => {
                state.current = None;
                Err(Arc::new(enrich_startup_error(e)))
            }
        }
    }

    /// Resolve `request` into a plan against a suitable engine
    pub async fn prepare(
        &self,
        request: &RunRequest,
        config: &Config,
        watching: bool,
    ) -> Result<PreparedRun> {
        let requested = request.requested();
        let requirement = CoverageRequirement::for_run(config, watching, requested.is_some());
        let handle = self.ensure_engine(requirement).await?;

        let files = handle.engine.test_files().await?;
        let entries = self.inner.catalog.entries().await?;
        let selection = selection::select_specs(
            &files,
            &handle.tag_filters,
            &entries,
            requested,
            &self.inner.is_parent,
        )?;

        Ok(PreparedRun {
            plan: RunPlan {
                files: selection.files,
                name_pattern: selection.name_pattern,
                all_tests: requested.is_none(),
            },
            entry_ids: selection.entry_ids,
        })
    }

    /// Run a prepared plan on the live engine
    pub async fn execute(&self, prepared: PreparedRun) -> Result<()> {
        let handle = self
            .current_settled()
            .await
            .ok_or_else(|| Error::Engine("No engine is running".into()))?;
        debug!(
            "Running {} file(s) on engine generation {}",
            prepared.plan.files.len(),
            handle.generation
        );
        handle.engine.run(prepared.plan).await
    }

    /// React to a changed file; returns the affected run while watching
    pub async fn on_file_change(&self, path: &Path, watching: bool) -> Result<Option<PreparedRun>> {
        self.on_files_changed(&[path.to_path_buf()], watching).await
    }

    /// React to a batch of changed files with one run covering all of them
    pub async fn on_files_changed(
        &self,
        paths: &[PathBuf],
        watching: bool,
    ) -> Result<Option<PreparedRun>> {
        let Some(handle) = self.current_settled().await else {
            return Ok(None);
        };
        for path in paths {
            handle.engine.invalidate(path);
        }
        if !watching || paths.is_empty() {
            return Ok(None);
        }

        let files = handle.engine.test_files().await?;
        let affected = affected_files(handle.engine.as_ref(), files, paths).await?;
        if affected.is_empty() {
            debug!("No test file depends on {} changed file(s)", paths.len());
            return Ok(None);
        }

        let entries = self.inner.catalog.entries().await?;
        let default_filter = TagFilter::default();
        let mut files = Vec::new();
        let mut entry_ids = Vec::new();
        for file in affected {
            let filter = file
                .project
                .as_ref()
                .and_then(|p| handle.tag_filters.get(p))
                .unwrap_or(&default_filter);
            let ids: Vec<EntryId> = entries
                .iter()
                .filter(|e| e.is_testable() && selection::declares(&file.path, e))
                .filter(|e| filter.in_scope(e))
                .map(|e| e.id.clone())
                .collect();
            if !ids.is_empty() {
                for id in ids {
                    if !entry_ids.contains(&id) {
                        entry_ids.push(id);
                    }
                }
                files.push(file);
            }
        }
        if files.is_empty() {
            return Ok(None);
        }

        info!(
            "{} file(s) changed, re-running {} file(s)",
            paths.len(),
            files.len()
        );
        Ok(Some(PreparedRun {
            plan: RunPlan {
                files,
                name_pattern: None,
                all_tests: false,
            },
            entry_ids,
        }))
    }

    /// Cancel the in-flight run and wait until the engine is idle
    pub async fn cancel_current_run(&self) -> Result<()> {
        let Some(handle) = self.current() else {
            return Ok(());
        };
        handle.engine.cancel().await?;
        handle.engine.wait_idle().await;
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        let _ = self.current_settled().await;
        let current = self.inner.state.lock().current.take();
        if let Some(handle) = current {
            info!("Closing engine generation {}", handle.generation);
            handle.engine.close().await?;
        }
        Ok(())
    }
}

/// Files whose transitive imports include any of `changed`, themselves included
async fn affected_files(
    engine: &dyn TestEngine,
    files: Vec<TestFile>,
    changed: &[PathBuf],
) -> Result<Vec<TestFile>> {
    let mut graph: HashMap<PathBuf, Vec<PathBuf>> = HashMap::new();
    let mut affected = Vec::new();

    for file in files {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([file.path.clone()]);
        let mut hit = false;
        while let Some(node) = queue.pop_front() {
            if changed.contains(&node) {
                hit = true;
                break;
            }
            if !seen.insert(node.clone()) {
                continue;
            }
            if !graph.contains_key(&node) {
                let deps = engine.dependencies(&node).await?;
                graph.insert(node.clone(), deps);
            }
            if let Some(deps) = graph.get(&node) {
                queue.extend(deps.iter().filter(|d| !seen.contains(*d)).cloned());
            }
        }
        if hit {
            affected.push(file);
        }
    }
    Ok(affected)
}

/// Name a missing coverage provider when engine startup fails on it
fn enrich_startup_error(err: Error) -> Error {
    let message = match err {
        Error::EngineStartup(message) => message,
        other => other.to_string(),
    };
    let missing_module =
        message.contains("Failed to load url") || message.contains("Cannot find module");
    if missing_module {
        let provider = Regex::new(r"(@[\w.-]+/)?[\w.-]*coverage-[\w.-]+")
            .ok()
            .and_then(|re| re.find(&message).map(|m| m.as_str().to_string()));
        if let Some(package) = provider {
            return Error::EngineStartup(format!(
                "Coverage provider not found. Install {} to collect coverage: {}",
                package, message
            ));
        }
    }
    Error::EngineStartup(message)
}
