//! Core types for storyrun

use serde::{Deserialize, Serialize};
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;

/// Identifier of one catalog entry
pub type EntryId = String;

/// Status type id of primary component test results
pub const STATUS_TYPE_COMPONENT_TEST: &str = "storyrun/component-test";

/// Status type id of auxiliary accessibility results
pub const STATUS_TYPE_A11Y: &str = "storyrun/a11y";

/// Milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// User-facing test configuration, snapshotted into every run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub coverage: bool,
    #[serde(default)]
    pub a11y: bool,
}

/// Serializable description of an error, with its cause chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLike {
    pub message: String,
    #[serde(default = "default_error_name")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorLike>>,
}

fn default_error_name() -> String {
    "Error".to_string()
}

impl ErrorLike {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: name.into(),
            stack: None,
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: ErrorLike) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Normalize a storyrun error, unwinding its sources into causes
    pub fn from_error(err: &crate::Error) -> Self {
        if let crate::Error::ChildCrashed(inner) = err {
            return ErrorLike::new(err.name(), "Test runner process errored")
                .with_cause(inner.clone());
        }
        let mut like = ErrorLike::new(err.name(), err.to_string());
        like.stack = captured_stack();
        like.cause = std::error::Error::source(err).map(|s| Box::new(Self::from_source(s)));
        like
    }

    /// Normalize any error value, unwinding its sources into causes
    pub fn from_source(err: &(dyn std::error::Error + 'static)) -> Self {
        Self {
            message: err.to_string(),
            name: default_error_name(),
            stack: None,
            cause: err.source().map(|s| Box::new(Self::from_source(s))),
        }
    }

    /// Iterate over this error and its causes, outermost first
    pub fn chain(&self) -> impl Iterator<Item = &ErrorLike> {
        std::iter::successors(Some(self), |e| e.cause.as_deref())
    }
}

impl fmt::Display for ErrorLike {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

fn captured_stack() -> Option<String> {
    let bt = Backtrace::capture();
    match bt.status() {
        BacktraceStatus::Captured => Some(bt.to_string()),
        _ => None,
    }
}

/// A fatal error as published on the run-state channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatalError {
    pub message: String,
    pub error: ErrorLike,
}

/// What caused a run to start
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum TriggeredBy {
    Global,
    RunAll,
    Watch,
    External(String),
    /// A catalog entry type (story, component, directory, ...)
    EntryType(String),
}

impl fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggeredBy::Global => write!(f, "global"),
            TriggeredBy::RunAll => write!(f, "run-all"),
            TriggeredBy::Watch => write!(f, "watch"),
            TriggeredBy::External(actor) => write!(f, "external:{}", actor),
            TriggeredBy::EntryType(kind) => write!(f, "{}", kind),
        }
    }
}

impl From<String> for TriggeredBy {
    fn from(s: String) -> Self {
        match s.as_str() {
            "global" => TriggeredBy::Global,
            "run-all" => TriggeredBy::RunAll,
            "watch" => TriggeredBy::Watch,
            _ => match s.strip_prefix("external:") {
                Some(actor) => TriggeredBy::External(actor.to_string()),
                None => TriggeredBy::EntryType(s),
            },
        }
    }
}

impl From<TriggeredBy> for String {
    fn from(t: TriggeredBy) -> Self {
        t.to_string()
    }
}

/// Pass/fail counters of primary test results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCount {
    pub success: u64,
    pub error: u64,
}

impl TestCount {
    pub fn finished(&self) -> u64 {
        self.success + self.error
    }
}

/// Counters of auxiliary (accessibility) results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxCount {
    pub success: u64,
    pub warning: u64,
    pub error: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageStatus {
    Negative,
    Warning,
    Positive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageSummary {
    pub percentage: u8,
    pub status: CoverageStatus,
}

/// One end-to-end execution cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub triggered_by: Option<TriggeredBy>,
    pub entry_ids: Option<Vec<EntryId>>,
    pub config: Config,
    pub component_test_count: TestCount,
    pub a11y_count: AuxCount,
    pub total_test_count: Option<u64>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    #[serde(default)]
    pub unhandled_errors: Vec<ErrorLike>,
    pub coverage_summary: Option<CoverageSummary>,
}

impl RunRecord {
    /// A fresh record for a run starting now
    pub fn started(
        triggered_by: TriggeredBy,
        entry_ids: Option<Vec<EntryId>>,
        config: Config,
    ) -> Self {
        Self {
            triggered_by: Some(triggered_by),
            entry_ids,
            config,
            started_at: Some(now_ms()),
            ..Default::default()
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// The replicated run-state singleton
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub config: Config,
    pub watching: bool,
    pub cancelling: bool,
    pub fatal_error: Option<FatalError>,
    pub current_run: RunRecord,
}

/// Status value of one entry for one status type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusValue {
    Pending,
    Success,
    Warning,
    Error,
    Unknown,
}

/// Per-entry status as shown in the catalog UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub entry_id: EntryId,
    pub type_id: String,
    pub value: StatusValue,
    pub title: String,
    pub description: String,
}

/// Busy/idle state of this test provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Crashed,
}

/// Kind of catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Story,
    Docs,
    Test,
}

/// One addressable item of the component catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub id: EntryId,
    pub name: String,
    #[serde(default)]
    pub title: String,
    pub import_path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parent: Option<EntryId>,
}

impl CatalogEntry {
    /// Entries that can execute as tests
    pub fn is_testable(&self) -> bool {
        matches!(self.kind, EntryKind::Story | EntryKind::Test)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Outcome of one test case as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestState {
    Pending,
    Passed,
    Warning,
    Failed,
    Skipped,
}

impl From<TestState> for StatusValue {
    fn from(state: TestState) -> Self {
        match state {
            TestState::Pending => StatusValue::Pending,
            TestState::Passed => StatusValue::Success,
            TestState::Warning => StatusValue::Warning,
            TestState::Failed => StatusValue::Error,
            TestState::Skipped => StatusValue::Unknown,
        }
    }
}

/// Secondary report attached to a test case (e.g. accessibility)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxReport {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: TestState,
}

impl AuxReport {
    pub fn is_a11y(&self) -> bool {
        self.kind == "a11y"
    }
}

/// One test case result streamed by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseReport {
    #[serde(default)]
    pub entry_id: Option<EntryId>,
    pub state: TestState,
    #[serde(default)]
    pub errors: Vec<ErrorLike>,
    #[serde(default)]
    pub reports: Vec<AuxReport>,
}

/// Terminal signal of an engine run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEndReport {
    pub total_test_count: u64,
    #[serde(default)]
    pub unhandled_errors: Vec<ErrorLike>,
}

/// A request to start a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub triggered_by: TriggeredBy,
    #[serde(default)]
    pub entry_ids: Option<Vec<EntryId>>,
}

impl RunRequest {
    pub fn global() -> Self {
        Self {
            triggered_by: TriggeredBy::Global,
            entry_ids: None,
        }
    }

    /// Requested entries, with an empty list meaning "everything"
    pub fn requested(&self) -> Option<&[EntryId]> {
        self.entry_ids.as_deref().filter(|ids| !ids.is_empty())
    }
}
