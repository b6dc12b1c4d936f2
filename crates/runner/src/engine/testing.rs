//! In-process fake engine for unit tests

use super::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use storyrun_common::{CatalogEntry, EntryKind, ErrorLike};
use tokio::sync::{watch, Notify};

pub(crate) const BUTTON_STORIES: &str = "/project/src/Button.stories.tsx";
pub(crate) const BUTTON_COMPONENT: &str = "/project/src/Button.tsx";
pub(crate) const CARD_STORIES: &str = "/project/src/Card.stories.tsx";
pub(crate) const CARD_COMPONENT: &str = "/project/src/Card.tsx";
pub(crate) const THEME: &str = "/project/src/theme.ts";

fn story(id: &str, name: &str, import_path: &str) -> CatalogEntry {
    CatalogEntry {
        id: id.to_string(),
        name: name.to_string(),
        title: String::new(),
        import_path: import_path.to_string(),
        kind: EntryKind::Story,
        tags: vec!["test".to_string()],
        parent: None,
    }
}

pub(crate) fn catalog() -> Vec<CatalogEntry> {
    vec![
        story("button--primary", "Primary", "./src/Button.stories.tsx"),
        story("button--secondary", "Secondary", "./src/Button.stories.tsx"),
        story("card--default", "Default", "./src/Card.stories.tsx"),
    ]
}

pub(crate) fn passed(entry_id: &str) -> TestCaseReport {
    TestCaseReport {
        entry_id: Some(entry_id.to_string()),
        state: storyrun_common::TestState::Passed,
        errors: Vec::new(),
        reports: Vec::new(),
    }
}

pub(crate) fn failed(entry_id: &str) -> TestCaseReport {
    TestCaseReport {
        entry_id: Some(entry_id.to_string()),
        state: storyrun_common::TestState::Failed,
        errors: vec![ErrorLike::new("AssertionError", "expected button to be visible")],
        reports: Vec::new(),
    }
}

/// What every fake engine does when asked to run
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeScript {
    pub results: Vec<TestCaseReport>,
    pub total: Option<u64>,
    pub unhandled: Vec<ErrorLike>,
    pub coverage_pct: Option<f64>,
    /// Block after streaming results until cancelled
    pub hang: bool,
    pub fail_run: Option<String>,
}

pub(crate) struct FakeEngine {
    coverage: bool,
    reporter: Arc<dyn EngineReporter>,
    script: Arc<Mutex<FakeScript>>,
    runs: Mutex<Vec<RunPlan>>,
    invalidated: Mutex<Vec<PathBuf>>,
    closed: AtomicBool,
    cancel_calls: AtomicUsize,
    running: watch::Sender<bool>,
    cancelled: Notify,
}

impl FakeEngine {
    pub fn coverage(&self) -> bool {
        self.coverage
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> Vec<RunPlan> {
        self.runs.lock().clone()
    }

    pub fn invalidated(&self) -> Vec<PathBuf> {
        self.invalidated.lock().clone()
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }
}

#[async_trait]
impl TestEngine for FakeEngine {
    async fn test_files(&self) -> Result<Vec<TestFile>> {
        Ok([BUTTON_STORIES, CARD_STORIES]
            .iter()
            .map(|p| TestFile {
                path: PathBuf::from(p),
                project: None,
            })
            .collect())
    }

    fn projects(&self) -> Vec<ProjectInfo> {
        Vec::new()
    }

    async fn run(&self, plan: RunPlan) -> Result<()> {
        self.runs.lock().push(plan);
        let script = self.script.lock().clone();
        if let Some(message) = script.fail_run {
            return Err(Error::Engine(message));
        }

        self.running.send_replace(true);
        let streamed = script.results.len() as u64;
        for result in script.results {
            self.reporter.on_test_case_result(result);
        }
        if script.hang {
            self.cancelled.notified().await;
        }
        if self.coverage {
            if let Some(pct) = script.coverage_pct {
                self.reporter.on_coverage(pct);
            }
        }
        self.reporter.on_run_end(RunEndReport {
            total_test_count: script.total.unwrap_or(streamed),
            unhandled_errors: script.unhandled,
        });
        self.running.send_replace(false);
        Ok(())
    }

    async fn cancel(&self) -> Result<()> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_running() {
            self.cancelled.notify_one();
        }
        Ok(())
    }

    async fn wait_idle(&self) {
        let mut rx = self.running.subscribe();
        let _ = rx.wait_for(|running| !*running).await;
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn invalidate(&self, path: &Path) {
        self.invalidated.lock().push(path.to_path_buf());
    }

    async fn dependencies(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let deps: &[&str] = match path.to_str() {
            Some(BUTTON_STORIES) => &[BUTTON_COMPONENT],
            Some(BUTTON_COMPONENT) => &[THEME],
            Some(CARD_STORIES) => &[CARD_COMPONENT],
            _ => &[],
        };
        Ok(deps.iter().map(|d| PathBuf::from(*d)).collect())
    }
}

pub(crate) struct FakeFactory {
    script: Arc<Mutex<FakeScript>>,
    created: Mutex<Vec<Arc<FakeEngine>>>,
    create_delay: Mutex<Duration>,
    fail_next: Mutex<Option<String>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(FakeScript::default())),
            created: Mutex::new(Vec::new()),
            create_delay: Mutex::new(Duration::ZERO),
            fail_next: Mutex::new(None),
        }
    }

    pub fn created(&self) -> Vec<Arc<FakeEngine>> {
        self.created.lock().clone()
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = delay;
    }

    pub fn fail_next_create(&self, message: &str) {
        *self.fail_next.lock() = Some(message.to_string());
    }

    pub fn set_script(&self, script: FakeScript) {
        *self.script.lock() = script;
    }
}

#[async_trait]
impl EngineFactory for FakeFactory {
    async fn create(
        &self,
        options: EngineOptions,
        reporter: Arc<dyn EngineReporter>,
    ) -> Result<Arc<dyn TestEngine>> {
        let delay = *self.create_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.fail_next.lock().take() {
            return Err(Error::EngineStartup(message));
        }
        let (running, _) = watch::channel(false);
        let engine = Arc::new(FakeEngine {
            coverage: options.coverage,
            reporter,
            script: self.script.clone(),
            runs: Mutex::new(Vec::new()),
            invalidated: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            cancel_calls: AtomicUsize::new(0),
            running,
            cancelled: Notify::new(),
        });
        self.created.lock().push(engine.clone());
        Ok(engine)
    }
}

/// Reporter that only records what it was told
#[derive(Default)]
pub(crate) struct FakeReporter {
    pub results: Mutex<Vec<TestCaseReport>>,
    pub run_ends: Mutex<Vec<RunEndReport>>,
    pub coverage: Mutex<Vec<f64>>,
}

impl EngineReporter for FakeReporter {
    fn on_test_case_result(&self, report: TestCaseReport) {
        self.results.lock().push(report);
    }

    fn on_run_end(&self, report: RunEndReport) {
        self.run_ends.lock().push(report);
    }

    fn on_coverage(&self, statements_pct: f64) {
        self.coverage.lock().push(statements_pct);
    }
}
