//! Engine backed by an external test command
//!
//! The command is spawned once per run with the files to execute as its
//! trailing arguments and reports progress on stdout, one JSON document per
//! line:
//!
//! ```text
//! {"event":"test-case","entryId":"button--primary","state":"passed","reports":[...]}
//! {"event":"coverage","statements":83.4}
//! {"event":"run-end","totalTestCount":12,"unhandledErrors":[]}
//! ```
//!
//! Any other output is logged.

use super::{
    EngineFactory, EngineOptions, EngineReporter, ProjectInfo, RunPlan, TestEngine, TestFile,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use storyrun_common::config::EngineConfig;
use storyrun_common::{Error, ErrorLike, Result, RunEndReport, TestCaseReport, TestState};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const IMPORT_PATTERN: &str = r#"(?:\bfrom|\bimport)\s*\(?\s*['"]([^'"]+)['"]"#;

const RESOLVE_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "cjs", "mdx"];

/// Environment variable listing the projects of the files being run
pub const PROJECTS_ENV: &str = "STORYRUN_PROJECTS";

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
enum EngineEvent {
    TestCase(TestCaseReport),
    Coverage { statements: f64 },
    RunEnd(RunEndReport),
}

/// Creates [`CommandEngine`]s from the engine configuration
pub struct CommandEngineFactory {
    config: EngineConfig,
}

impl CommandEngineFactory {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EngineFactory for CommandEngineFactory {
    async fn create(
        &self,
        options: EngineOptions,
        reporter: Arc<dyn EngineReporter>,
    ) -> Result<Arc<dyn TestEngine>> {
        let engine = CommandEngine::new(self.config.clone(), options, reporter)?;
        Ok(Arc::new(engine))
    }
}

/// A [`TestEngine`] driving an external command
pub struct CommandEngine {
    root: PathBuf,
    config: EngineConfig,
    coverage: bool,
    reporter: Arc<dyn EngineReporter>,
    import_re: Regex,
    imports: DashMap<PathBuf, Vec<PathBuf>>,
    running: watch::Sender<bool>,
    cancel: Mutex<Option<CancellationToken>>,
    closed: AtomicBool,
}

impl CommandEngine {
    pub fn new(
        config: EngineConfig,
        options: EngineOptions,
        reporter: Arc<dyn EngineReporter>,
    ) -> Result<Self> {
        let root = std::fs::canonicalize(&config.root).map_err(|e| {
            Error::EngineStartup(format!(
                "Engine root {} is not accessible: {}",
                config.root.display(),
                e
            ))
        })?;
        let import_re =
            Regex::new(IMPORT_PATTERN).map_err(|e| Error::Internal(e.to_string()))?;
        let (running, _) = watch::channel(false);

        info!(
            "Engine ready at {} ({} {})",
            root.display(),
            config.command,
            config.args.join(" ")
        );
        Ok(Self {
            root,
            config,
            coverage: options.coverage,
            reporter,
            import_re,
            imports: DashMap::new(),
            running,
            cancel: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn command_for(&self, plan: &RunPlan) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);
        if self.coverage {
            cmd.arg("--coverage");
        }
        if let Some(pattern) = &plan.name_pattern {
            cmd.arg("--test-name-pattern").arg(pattern.as_str());
        }
        cmd.args(plan.files.iter().map(|f| &f.path));

        let projects: BTreeSet<&str> = plan
            .files
            .iter()
            .filter_map(|f| f.project.as_deref())
            .collect();
        for project in self.config.projects.iter().filter(|p| projects.contains(p.name.as_str())) {
            cmd.envs(&project.env);
        }
        cmd.env(PROJECTS_ENV, projects.into_iter().collect::<Vec<_>>().join(","));

        cmd.current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Wait for the engine to be idle, then mark it running with a fresh
    /// cancel token; a cancel from here on reaches this run
    async fn claim(&self) -> CancellationToken {
        loop {
            self.wait_idle().await;
            let mut slot = self.cancel.lock();
            let claimed = self.running.send_if_modified(|running| {
                if *running {
                    return false;
                }
                *running = true;
                true
            });
            if claimed {
                let token = CancellationToken::new();
                *slot = Some(token.clone());
                return token;
            }
        }
    }

    fn handle_line(&self, line: &str, progress: &mut RunProgress) {
        let event: EngineEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(_) => {
                debug!(target: "storyrun::engine", "{}", line);
                return;
            }
        };
        match event {
            EngineEvent::TestCase(report) => {
                if matches!(report.state, TestState::Passed | TestState::Failed) {
                    progress.finished += 1;
                }
                self.reporter.on_test_case_result(report);
            }
            EngineEvent::Coverage { statements } => {
                if self.coverage {
                    self.reporter.on_coverage(statements);
                }
            }
            EngineEvent::RunEnd(report) => {
                progress.ended = true;
                self.reporter.on_run_end(report);
            }
        }
    }
}

#[derive(Debug, Default)]
struct RunProgress {
    finished: u64,
    ended: bool,
}

/// Marks the engine idle when a run is over, however it ends
struct RunningGuard<'a> {
    running: &'a watch::Sender<bool>,
    cancel: &'a Mutex<Option<CancellationToken>>,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.cancel.lock().take();
        self.running.send_replace(false);
    }
}

#[async_trait]
impl TestEngine for CommandEngine {
    async fn test_files(&self) -> Result<Vec<TestFile>> {
        let root = self.root.clone();
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || discover(&root, &config))
            .await
            .map_err(|e| Error::Internal(format!("test file discovery failed: {}", e)))
    }

    fn projects(&self) -> Vec<ProjectInfo> {
        self.config
            .projects
            .iter()
            .map(|p| ProjectInfo {
                name: p.name.clone(),
                env: p.env.clone(),
            })
            .collect()
    }

    async fn run(&self, plan: RunPlan) -> Result<()> {
        if plan.files.is_empty() {
            debug!("Nothing to run");
            self.reporter.on_run_end(RunEndReport::default());
            return Ok(());
        }

        let token = self.claim().await;
        let _idle = RunningGuard {
            running: &self.running,
            cancel: &self.cancel,
        };
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Engine("Engine is closed".into()));
        }

        let mut child = self.command_for(&plan).spawn().map_err(|e| {
            Error::Engine(format!("Failed to spawn {}: {}", self.config.command, e))
        })?;

        info!(
            "Engine run started (pid: {:?}, {} file(s))",
            child.id(),
            plan.files.len()
        );

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = FramedRead::new(stderr, LinesCodec::new());
                while let Some(Ok(line)) = lines.next().await {
                    debug!(target: "storyrun::engine", "{}", line);
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Engine("Engine stdout is not piped".into()))?;
        let mut lines = FramedRead::new(stdout, LinesCodec::new());
        let mut progress = RunProgress::default();
        let mut cancelled = false;
        loop {
            tokio::select! {
                line = lines.next() => match line {
                    Some(Ok(line)) => self.handle_line(&line, &mut progress),
                    Some(Err(e)) => {
                        warn!("Unreadable engine output: {}", e);
                    }
                    None => break,
                },
                _ = token.cancelled(), if !cancelled => {
                    cancelled = true;
                    terminate(&mut child);
                }
            }
        }

        let status = child.wait().await?;

        if !progress.ended {
            let mut report = RunEndReport {
                total_test_count: progress.finished,
                unhandled_errors: Vec::new(),
            };
            if !status.success() && !cancelled {
                report.unhandled_errors.push(ErrorLike::new(
                    "EngineExitError",
                    format!("{} exited with {}", self.config.command, status),
                ));
            }
            debug!("Engine exited without run-end, reporting {} result(s)", progress.finished);
            self.reporter.on_run_end(report);
        }
        info!("Engine run finished ({})", status);
        Ok(())
    }

    async fn cancel(&self) -> Result<()> {
        if let Some(token) = self.cancel.lock().as_ref() {
            info!("Cancelling engine run");
            token.cancel();
        }
        Ok(())
    }

    async fn wait_idle(&self) {
        let mut rx = self.running.subscribe();
        let _ = rx.wait_for(|running| !*running).await;
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel().await?;
        self.wait_idle().await;
        self.imports.clear();
        Ok(())
    }

    fn invalidate(&self, path: &Path) {
        if self.imports.remove(path).is_some() {
            debug!("Invalidated imports of {}", path.display());
        }
    }

    async fn dependencies(&self, path: &Path) -> Result<Vec<PathBuf>> {
        if let Some(cached) = self.imports.get(path) {
            return Ok(cached.clone());
        }
        let file = path.to_path_buf();
        let import_re = self.import_re.clone();
        let deps = tokio::task::spawn_blocking(move || scan_imports(&file, &import_re))
            .await
            .map_err(|e| Error::Internal(format!("import scan failed: {}", e)))?;
        self.imports.insert(path.to_path_buf(), deps.clone());
        Ok(deps)
    }
}

fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok() {
            return;
        }
    }
    let _ = child.start_kill();
}

/// Walk `config.root` for test-bearing files
fn discover(root: &Path, config: &EngineConfig) -> Vec<TestFile> {
    let project_roots: Vec<(PathBuf, &str)> = config
        .projects
        .iter()
        .map(|p| {
            let dir = p.root.as_ref().map_or_else(|| root.to_path_buf(), |r| root.join(r));
            (normalize(&dir), p.name.as_str())
        })
        .collect();

    let mut files: Vec<TestFile> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir()
                    && config
                        .ignore_dirs
                        .iter()
                        .any(|d| e.file_name().to_str() == Some(d.as_str())))
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.file_name()
                .to_str()
                .map(|name| config.test_suffixes.iter().any(|s| name.ends_with(s.as_str())))
                .unwrap_or(false)
        })
        .map(|e| {
            let path = e.into_path();
            // Deepest project root containing the file
            let project = project_roots
                .iter()
                .filter(|(dir, _)| path.starts_with(dir))
                .max_by_key(|(dir, _)| dir.components().count())
                .map(|(_, name)| name.to_string());
            TestFile { path, project }
        })
        .collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    debug!("Discovered {} test file(s) under {}", files.len(), root.display());
    files
}

/// Local files imported by `file`
fn scan_imports(file: &Path, import_re: &Regex) -> Vec<PathBuf> {
    let Ok(source) = std::fs::read_to_string(file) else {
        return Vec::new();
    };
    let Some(dir) = file.parent() else {
        return Vec::new();
    };
    let mut deps: Vec<PathBuf> = import_re
        .captures_iter(&source)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|spec| spec.starts_with("./") || spec.starts_with("../"))
        .filter_map(|spec| resolve(&dir.join(spec)))
        .collect();
    deps.sort();
    deps.dedup();
    deps
}

fn resolve(candidate: &Path) -> Option<PathBuf> {
    let candidate = normalize(candidate);
    if candidate.is_file() {
        return Some(candidate);
    }
    let file_name = candidate.file_name()?.to_str()?.to_string();
    RESOLVE_EXTENSIONS
        .iter()
        .map(|ext| candidate.with_file_name(format!("{}.{}", file_name, ext)))
        .chain(RESOLVE_EXTENSIONS.iter().map(|ext| candidate.join(format!("index.{}", ext))))
        .find(|p| p.is_file())
}

/// Lexically resolve `.` and `..` components
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
