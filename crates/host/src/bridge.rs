//! Process bridge
//!
//! Owns the runner child process and multiplexes the three replicated
//! channels over its stdio. Outbound envelopes are queued until the child
//! signals `ready`, then flushed in order and forwarded directly.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::Duration;
use storyrun_common::config::{CHILD_PROCESS_ENV, CONFIG_ENV};
use storyrun_common::store::{Environment, ForwardFilter, RunStateEvent};
use storyrun_common::{
    ChildMessage, Envelope, Error, ErrorLike, FatalError, Result, Stores, StoryrunConfig,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, info, trace, warn};

/// Fatal message published when the child fails to boot
pub const BOOT_FAILED_MESSAGE: &str = "Failed to start test runner process";

/// Fatal message published when the child reports an uncaught error
pub const CHILD_ERRORED_MESSAGE: &str = "Test runner process errored";

const ANSI_YELLOW: &str = "\u{1b}[33m";
const EVENT_BUS_CAPACITY: usize = 256;
const GRACEFUL_EXIT: Duration = Duration::from_millis(500);

/// A child message that is not part of the bridge protocol, re-emitted as is
#[derive(Debug, Clone, PartialEq)]
pub struct ChildEvent {
    pub kind: String,
    pub args: Vec<Value>,
}

/// Envelopes buffered while the child is not ready
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<Envelope>,
}

impl EventQueue {
    pub fn push(&mut self, envelope: Envelope) {
        self.events.push_back(envelope);
    }

    /// Remove and return everything queued, oldest first
    pub fn drain(&mut self) -> Vec<Envelope> {
        self.events.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

type ReadySender = oneshot::Sender<std::result::Result<(), ErrorLike>>;
type ReadyReceiver = oneshot::Receiver<std::result::Result<(), ErrorLike>>;

#[derive(Default)]
struct BridgeState {
    child: Option<Child>,
    ready: bool,
    queue: EventQueue,
    writer: Option<mpsc::UnboundedSender<Envelope>>,
    ready_tx: Option<ReadySender>,
    tasks: Vec<JoinHandle<()>>,
    /// Incremented per spawned child; tasks of older children are ignored
    generation: u64,
}

struct BridgeInner {
    config: StoryrunConfig,
    config_path: Option<PathBuf>,
    stores: Stores,
    events: broadcast::Sender<ChildEvent>,
    state: Mutex<BridgeState>,
}

/// Handle to the runner child process
#[derive(Clone)]
pub struct ProcessBridge {
    inner: Arc<BridgeInner>,
}

impl ProcessBridge {
    /// Create a new bridge over the host replicas in `stores`
    pub fn new(config: StoryrunConfig, config_path: Option<PathBuf>, stores: Stores) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            inner: Arc::new(BridgeInner {
                config,
                config_path,
                stores,
                events,
                state: Mutex::new(BridgeState::default()),
            }),
        }
    }

    /// Pass-through events emitted by the child
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChildEvent> {
        self.inner.events.subscribe()
    }

    /// A child process is running
    pub fn is_live(&self) -> bool {
        self.inner.state.lock().child.is_some()
    }

    /// The live child has signalled `ready`
    pub fn is_ready(&self) -> bool {
        self.inner.state.lock().ready
    }

    /// Envelopes waiting for the child to become ready
    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Number of children spawned so far
    pub fn boots(&self) -> u64 {
        self.inner.state.lock().generation
    }

    /// Boot the child if none is live
    pub async fn boot(&self) -> Result<()> {
        self.run_test_runner(None).await
    }

    /// Make sure a child is live, delivering `init` once it is ready
    ///
    /// With a child already live this is a no-op; its channel forwarders
    /// carry any event published since it was spawned.
    pub async fn run_test_runner(&self, init: Option<Envelope>) -> Result<()> {
        let spawned = {
            let mut state = self.inner.state.lock();
            if state.child.is_some() {
                debug!("Test runner already live");
                return Ok(());
            }
            self.inner.spawn_locked(&mut state, init)
        };
        let ready_rx = match spawned {
            Ok(ready_rx) => ready_rx,
            Err(e) => return Err(self.inner.boot_failed(e).await),
        };

        let budget = self.inner.config.startup_timeout();
        let outcome = match tokio::time::timeout(budget, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(payload))) => Err(Error::ChildCrashed(payload)),
            Ok(Err(_)) => Err(Error::ChildNotRunning),
            Err(_) => Err(Error::BootTimeout {
                seconds: budget.as_secs(),
            }),
        };
        match outcome {
            Ok(()) => {
                info!("Test runner ready");
                Ok(())
            }
            Err(e) => Err(self.inner.boot_failed(e).await),
        }
    }

    /// Tear down the child: stop forwarding, kill it, drop queued state
    pub async fn kill_child(&self) {
        self.inner.kill_child().await;
    }

    pub async fn shutdown(&self) {
        info!("Shutting down process bridge");
        self.inner.kill_child().await;
    }
}

impl BridgeInner {
    fn spawn_locked(
        self: &Arc<Self>,
        state: &mut BridgeState,
        init: Option<Envelope>,
    ) -> Result<ReadyReceiver> {
        let binary = self.config.runner_binary();
        info!("Starting test runner: {}", binary.display());

        let mut cmd = Command::new(&binary);
        cmd.args(&self.config.bridge.runner_args)
            .env(CHILD_PROCESS_ENV, "1")
            .envs(&self.config.bridge.extra_env);
        if let Some(path) = &self.config_path {
            cmd.env(CONFIG_ENV, path);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Spawn(format!("Failed to spawn {}: {}", binary.display(), e)))?;
        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.start_kill();
                return Err(Error::Spawn("Test runner stdio was not captured".into()));
            }
        };

        state.generation += 1;
        let generation = state.generation;
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (pump_tx, pump_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        // Subscribe before snapshotting so nothing falls in between
        let channels = self.stores.channels();
        let mut tasks: Vec<JoinHandle<()>> = channels
            .iter()
            .map(|c| c.spawn_forwarder(ForwardFilter::ExceptOrigin(Environment::Runner), pump_tx.clone()))
            .collect();

        state.queue.clear();
        let from = self.stores.run_state.actor().environment.wire_label();
        for channel in &channels {
            match channel.snapshot() {
                Ok(wire) => state.queue.push(Envelope::channel(channel.name(), wire, from)),
                Err(e) => warn!("Failed to snapshot {}: {}", channel.name(), e),
            }
        }
        if let Some(init) = init {
            state.queue.push(init);
        }

        let weak = Arc::downgrade(self);
        tasks.push(spawn_writer(stdin, writer_rx));
        tasks.push(tokio::spawn(pump(weak.clone(), generation, pump_rx)));
        tasks.push(tokio::spawn(read_stdout(weak, generation, stdout)));
        tasks.push(tokio::spawn(read_stderr(stderr)));

        debug!("Test runner pid: {:?}", child.id());
        state.child = Some(child);
        state.ready = false;
        state.writer = Some(writer_tx);
        state.ready_tx = Some(ready_tx);
        state.tasks = tasks;
        Ok(ready_rx)
    }

    /// Send to the child when ready, queue otherwise
    fn route(&self, generation: u64, envelope: Envelope) {
        let mut state = self.state.lock();
        if state.generation != generation || state.child.is_none() {
            return;
        }
        if state.ready {
            if let Some(writer) = &state.writer {
                let _ = writer.send(envelope);
            }
        } else {
            trace!("Queueing {} until the test runner is ready", envelope.kind);
            state.queue.push(envelope);
        }
    }

    fn mark_ready(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation || state.ready {
            return;
        }
        state.ready = true;
        let queued = state.queue.drain();
        debug!("Flushing {} queued event(s) to the test runner", queued.len());
        if let Some(writer) = &state.writer {
            for envelope in queued {
                let _ = writer.send(envelope);
            }
        }
        if let Some(ready_tx) = state.ready_tx.take() {
            let _ = ready_tx.send(Ok(()));
        }
    }

    fn handle_inbound(self: &Arc<Self>, generation: u64, message: ChildMessage) {
        match message {
            ChildMessage::Ready => self.mark_ready(generation),
            ChildMessage::UncaughtError(payload) => {
                let booting = {
                    let mut state = self.state.lock();
                    if state.generation != generation {
                        return;
                    }
                    state.ready_tx.take()
                };
                match booting {
                    Some(ready_tx) => {
                        let _ = ready_tx.send(Err(payload));
                    }
                    None => {
                        error!("{}: {}", CHILD_ERRORED_MESSAGE, payload);
                        self.publish_fatal(CHILD_ERRORED_MESSAGE, payload);
                        let this = self.clone();
                        tokio::spawn(async move { this.teardown(Some(generation)).await });
                    }
                }
            }
            ChildMessage::Channel { name, events } => {
                let channel = match self.stores.channel(&name) {
                    Ok(channel) => channel,
                    Err(e) => {
                        warn!("{}", e);
                        return;
                    }
                };
                for event in events {
                    if let Err(e) = channel.apply_wire(event) {
                        warn!("Failed to apply {} message: {}", name, e);
                    }
                }
            }
            ChildMessage::Other { kind, args } => {
                trace!("Child event: {}", kind);
                let _ = self.events.send(ChildEvent { kind, args });
            }
        }
    }

    fn child_exited(self: &Arc<Self>, generation: u64) {
        let (pending_boot, ready) = {
            let mut state = self.state.lock();
            if state.generation != generation || state.child.is_none() {
                return;
            }
            (state.ready_tx.take(), state.ready)
        };
        // Dropping the sender fails the pending boot, which tears down itself
        if pending_boot.is_some() {
            return;
        }
        if ready {
            warn!("Test runner exited");
        }
        let this = self.clone();
        tokio::spawn(async move { this.teardown(Some(generation)).await });
    }

    fn publish_fatal(&self, message: &str, error: ErrorLike) {
        self.stores.run_state.send(RunStateEvent::FatalError(FatalError {
            message: message.to_string(),
            error,
        }));
    }

    async fn boot_failed(&self, err: Error) -> Error {
        error!("{}: {}", BOOT_FAILED_MESSAGE, err);
        self.kill_child().await;
        let error = match &err {
            Error::ChildCrashed(payload) => payload.clone(),
            other => ErrorLike::from_error(other),
        };
        self.publish_fatal(BOOT_FAILED_MESSAGE, error);
        err
    }

    async fn kill_child(&self) {
        self.teardown(None).await;
    }

    /// The single teardown path; `generation` limits it to one child
    async fn teardown(&self, generation: Option<u64>) {
        let (child, tasks) = {
            let mut state = self.state.lock();
            if generation.map_or(false, |g| g != state.generation) {
                return;
            }
            state.ready = false;
            state.queue.clear();
            state.writer = None;
            state.ready_tx = None;
            (state.child.take(), std::mem::take(&mut state.tasks))
        };
        for task in &tasks {
            task.abort();
        }
        if let Some(child) = child {
            terminate(child).await;
        }
    }
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for task in &state.tasks {
            task.abort();
        }
        if let Some(child) = state.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// SIGTERM, a short grace period, then SIGKILL
async fn terminate(mut child: Child) {
    info!("Stopping test runner (pid: {:?})", child.id());

    // Try graceful shutdown first
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
            && tokio::time::timeout(GRACEFUL_EXIT, child.wait()).await.is_ok()
        {
            return;
        }
    }

    // Force kill if still running
    let _ = child.kill().await;
}

fn spawn_writer(stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<Envelope>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = FramedWrite::new(stdin, LinesCodec::new());
        while let Some(envelope) = rx.recv().await {
            match envelope.to_line() {
                Ok(line) => {
                    if let Err(e) = lines.send(line).await {
                        debug!("Test runner stdin closed: {}", e);
                        break;
                    }
                }
                Err(e) => warn!("Dropping unserializable envelope: {}", e),
            }
        }
    })
}

async fn pump(bridge: Weak<BridgeInner>, generation: u64, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        let Some(bridge) = bridge.upgrade() else { break };
        bridge.route(generation, envelope);
    }
}

async fn read_stdout(bridge: Weak<BridgeInner>, generation: u64, stdout: ChildStdout) {
    let mut lines = FramedRead::new(stdout, LinesCodec::new());
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to read from test runner: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let message = match Envelope::from_line(&line).and_then(Envelope::classify) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring test runner output: {}", e);
                continue;
            }
        };
        let Some(bridge) = bridge.upgrade() else { return };
        bridge.handle_inbound(generation, message);
    }
    if let Some(bridge) = bridge.upgrade() {
        bridge.child_exited(generation);
    }
}

async fn read_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_deprecation_line(&line) {
            continue;
        }
        info!(target: "storyrun::runner", "{}", line);
    }
}

/// Deprecation notices are printed in yellow and not worth relaying
fn is_deprecation_line(line: &str) -> bool {
    line.contains(ANSI_YELLOW)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_queue_drains_in_order_once() {
        let mut queue = EventQueue::default();
        queue.push(Envelope::event("a", vec![]));
        queue.push(Envelope::event("b", vec![]));
        queue.push(Envelope::event("c", vec![]));

        let kinds: Vec<_> = queue.drain().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test_case("\u{1b}[33mDeprecation: use `stories` instead\u{1b}[39m", true ; "yellow notice")]
    #[test_case("INFO storyrun_runner: Engine generation 1 started", false ; "plain log")]
    #[test_case("\u{1b}[31merror\u{1b}[39m", false ; "red is kept")]
    fn test_deprecation_lines(line: &str, dropped: bool) {
        assert_eq!(is_deprecation_line(line), dropped);
    }

    #[tokio::test]
    async fn test_spawn_error_is_fatal() {
        let stores = Stores::new(Environment::Server);
        let mut config = StoryrunConfig::default();
        config.bridge.runner_binary = Some(PathBuf::from("/nonexistent/storyrun-runner"));
        let bridge = ProcessBridge::new(config, None, stores.clone());
        let mut sub = stores.run_state.subscribe();

        let err = bridge.boot().await.unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
        assert!(!bridge.is_live());

        let delivered = sub.recv().await.unwrap();
        match delivered.message {
            storyrun_common::store::StoreMessage::Event(RunStateEvent::FatalError(fatal)) => {
                assert_eq!(fatal.message, BOOT_FAILED_MESSAGE);
                assert_eq!(fatal.error.name, "SpawnError");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
