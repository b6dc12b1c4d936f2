//! Replicated store
//!
//! A shared, versioned piece of state plus an event stream. Every process
//! (host, runner, browser) holds its own replica of each channel; writes on
//! one replica are broadcast to local subscribers and forwarded to the other
//! replicas by a transport (the process bridge on the host, the stdio
//! transport in the runner).
//!
//! Delivery is order-preserving per channel. There is no ordering between
//! different channels.

use crate::types::*;
use crate::wire::Envelope;
use crate::{Error, Result};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Channel name of the run-state store
pub const RUN_STATE_CHANNEL: &str = "storyrun/run-state";

/// Channel name of the per-entry status store
pub const STATUS_CHANNEL: &str = "storyrun/status";

/// Channel name of the test provider state store
pub const PROVIDER_CHANNEL: &str = "storyrun/provider-state";

/// All replicated channels, in forwarding order
pub const CHANNELS: [&str; 3] = [RUN_STATE_CHANNEL, STATUS_CHANNEL, PROVIDER_CHANNEL];

const STORE_BUFFER: usize = 1024;

/// Process a replica lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Server,
    Runner,
    Browser,
}

impl Environment {
    /// Value of the envelope `from` field for messages leaving this process
    pub fn wire_label(&self) -> &'static str {
        match self {
            Environment::Server => "server",
            Environment::Runner => "runner",
            Environment::Browser => "browser",
        }
    }
}

/// Identity of the replica that produced a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub environment: Environment,
}

impl Actor {
    pub fn new(environment: Environment) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            environment,
        }
    }
}

/// Which messages a transport forwards to the other side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardFilter {
    /// Everything except messages produced in this environment
    ExceptOrigin(Environment),
    /// Only messages produced in this environment
    OnlyOrigin(Environment),
}

impl ForwardFilter {
    pub fn admits(&self, actor: &Actor) -> bool {
        match self {
            ForwardFilter::ExceptOrigin(env) => actor.environment != *env,
            ForwardFilter::OnlyOrigin(env) => actor.environment == *env,
        }
    }
}

/// Metadata travelling with every store message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventInfo {
    pub actor: Actor,
    pub version: u64,
}

/// A state replacement or an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum StoreMessage<S, E> {
    SetState(S),
    Event(E),
}

/// A message as delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered<S, E> {
    pub message: StoreMessage<S, E>,
    pub info: EventInfo,
}

/// A store message in its serialized, channel-agnostic form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    pub event: serde_json::Value,
    pub event_info: EventInfo,
}

struct Versioned<S> {
    state: S,
    version: u64,
}

struct StoreInner<S, E> {
    name: &'static str,
    actor: Actor,
    state: RwLock<Versioned<S>>,
    tx: broadcast::Sender<Delivered<S, E>>,
}

/// One replica of a replicated channel
pub struct ReplicatedStore<S, E> {
    inner: Arc<StoreInner<S, E>>,
}

impl<S, E> Clone for ReplicatedStore<S, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, E> ReplicatedStore<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, actor: Actor, initial: S) -> Self {
        let (tx, _) = broadcast::channel(STORE_BUFFER);
        Self {
            inner: Arc::new(StoreInner {
                name,
                actor,
                state: RwLock::new(Versioned {
                    state: initial,
                    version: 0,
                }),
                tx,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn actor(&self) -> &Actor {
        &self.inner.actor
    }

    /// Snapshot of the current state
    pub fn state(&self) -> S {
        self.inner.state.read().state.clone()
    }

    pub fn version(&self) -> u64 {
        self.inner.state.read().version
    }

    /// Mutate the state and broadcast the result; returns the new state
    pub fn set_state(&self, f: impl FnOnce(&mut S)) -> S {
        let mut guard = self.inner.state.write();
        f(&mut guard.state);
        guard.version += 1;
        let snapshot = guard.state.clone();
        // Broadcast under the lock so subscribers see versions in order
        self.broadcast(Delivered {
            message: StoreMessage::SetState(snapshot.clone()),
            info: self.local_info(guard.version),
        });
        snapshot
    }

    /// Broadcast an event originating at this replica
    pub fn send(&self, event: E) {
        let guard = self.inner.state.write();
        self.broadcast(Delivered {
            message: StoreMessage::Event(event),
            info: self.local_info(guard.version),
        });
    }

    /// Apply a message received from another replica
    pub fn apply_remote(&self, delivered: Delivered<S, E>) {
        let mut guard = self.inner.state.write();
        if let StoreMessage::SetState(state) = &delivered.message {
            guard.state = state.clone();
            guard.version += 1;
        }
        trace!(
            channel = self.inner.name,
            from = ?delivered.info.actor.environment,
            "Applied remote store message"
        );
        self.broadcast(delivered);
    }

    pub fn subscribe(&self) -> StoreSubscription<S, E> {
        StoreSubscription {
            name: self.inner.name,
            rx: self.inner.tx.subscribe(),
        }
    }

    fn local_info(&self, version: u64) -> EventInfo {
        EventInfo {
            actor: self.inner.actor.clone(),
            version,
        }
    }

    fn broadcast(&self, delivered: Delivered<S, E>) {
        // No subscribers is fine; the state is still updated
        let _ = self.inner.tx.send(delivered);
    }
}

/// Receiving end of a store subscription
pub struct StoreSubscription<S, E> {
    name: &'static str,
    rx: broadcast::Receiver<Delivered<S, E>>,
}

impl<S: Clone, E: Clone> StoreSubscription<S, E> {
    /// Next delivered message, or `None` once the store is gone
    pub async fn recv(&mut self) -> Option<Delivered<S, E>> {
        loop {
            match self.rx.recv().await {
                Ok(delivered) => return Some(delivered),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = self.name, skipped, "Store subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next message if one is already queued
    pub fn try_recv(&mut self) -> Option<Delivered<S, E>> {
        loop {
            match self.rx.try_recv() {
                Ok(delivered) => return Some(delivered),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(channel = self.name, skipped, "Store subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }
}

/// Uniform access to the three channels for transports
pub trait WireChannel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Current state as a serialized state replacement
    fn snapshot(&self) -> Result<WireEvent>;

    /// Forward every message admitted by `filter` into `sink`
    fn spawn_forwarder(
        &self,
        filter: ForwardFilter,
        sink: mpsc::UnboundedSender<Envelope>,
    ) -> JoinHandle<()>;

    /// Apply a message received over the wire
    fn apply_wire(&self, event: WireEvent) -> Result<()>;
}

impl<S, E> WireChannel for ReplicatedStore<S, E>
where
    S: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    E: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    fn name(&self) -> &'static str {
        self.inner.name
    }

    fn snapshot(&self) -> Result<WireEvent> {
        let guard = self.inner.state.read();
        let message: StoreMessage<&S, E> = StoreMessage::SetState(&guard.state);
        Ok(WireEvent {
            event: serde_json::to_value(&message)?,
            event_info: self.local_info(guard.version),
        })
    }

    fn spawn_forwarder(
        &self,
        filter: ForwardFilter,
        sink: mpsc::UnboundedSender<Envelope>,
    ) -> JoinHandle<()> {
        let mut sub = self.subscribe();
        let name = self.inner.name;
        let from = self.inner.actor.environment.wire_label();
        tokio::spawn(async move {
            while let Some(delivered) = sub.recv().await {
                if !filter.admits(&delivered.info.actor) {
                    continue;
                }
                let event = match serde_json::to_value(&delivered.message) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(channel = name, "Failed to serialize store message: {}", e);
                        continue;
                    }
                };
                let wire = WireEvent {
                    event,
                    event_info: delivered.info,
                };
                if sink.send(Envelope::channel(name, wire, from)).is_err() {
                    debug!(channel = name, "Forwarding sink closed");
                    break;
                }
            }
        })
    }

    fn apply_wire(&self, event: WireEvent) -> Result<()> {
        let message: StoreMessage<S, E> = serde_json::from_value(event.event)?;
        self.apply_remote(Delivered {
            message,
            info: event.event_info,
        });
        Ok(())
    }
}

// ============================================================================
// Run-state channel
// ============================================================================

/// Events on the run-state channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStateEvent {
    TriggerRun(RunRequest),
    CancelRun,
    ToggleWatching { to: bool },
    TestRunCompleted(RunRecord),
    FatalError(FatalError),
}

pub type RunStateStore = ReplicatedStore<RunState, RunStateEvent>;

pub fn run_state_store(actor: Actor) -> RunStateStore {
    ReplicatedStore::new(RUN_STATE_CHANNEL, actor, RunState::default())
}

// ============================================================================
// Status channel
// ============================================================================

/// Statuses keyed by entry, then by status type id
pub type StatusMap = BTreeMap<EntryId, BTreeMap<String, Status>>;

/// Change notifications on the status channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusEvent {
    Updated {
        type_id: String,
        entry_ids: Vec<EntryId>,
    },
    Cleared {
        type_id: String,
        entry_ids: Option<Vec<EntryId>>,
    },
}

pub type StatusStore = ReplicatedStore<StatusMap, StatusEvent>;

pub fn status_store(actor: Actor) -> StatusStore {
    ReplicatedStore::new(STATUS_CHANNEL, actor, StatusMap::new())
}

impl ReplicatedStore<StatusMap, StatusEvent> {
    /// A view restricted to one status type
    pub fn typed(&self, type_id: &'static str) -> TypedStatusStore {
        TypedStatusStore {
            store: self.clone(),
            type_id,
        }
    }
}

/// Status store view that only touches statuses of one type id
#[derive(Clone)]
pub struct TypedStatusStore {
    store: StatusStore,
    type_id: &'static str,
}

impl TypedStatusStore {
    pub fn type_id(&self) -> &'static str {
        self.type_id
    }

    /// Upsert statuses, in order; later statuses for an entry win
    pub fn set(&self, statuses: Vec<Status>) {
        if statuses.is_empty() {
            return;
        }
        let type_id = self.type_id;
        let mut entry_ids = Vec::with_capacity(statuses.len());
        self.store.set_state(|map| {
            for mut status in statuses {
                status.type_id = type_id.to_string();
                entry_ids.push(status.entry_id.clone());
                map.entry(status.entry_id.clone())
                    .or_default()
                    .insert(type_id.to_string(), status);
            }
        });
        self.store.send(StatusEvent::Updated {
            type_id: type_id.to_string(),
            entry_ids,
        });
    }

    /// Remove statuses of this type, for the given entries or all of them
    pub fn unset(&self, entry_ids: Option<&[EntryId]>) {
        let type_id = self.type_id;
        self.store.set_state(|map| {
            for (entry_id, by_type) in map.iter_mut() {
                if entry_ids.map_or(true, |ids| ids.contains(entry_id)) {
                    by_type.remove(type_id);
                }
            }
            map.retain(|_, by_type| !by_type.is_empty());
        });
        self.store.send(StatusEvent::Cleared {
            type_id: type_id.to_string(),
            entry_ids: entry_ids.map(|ids| ids.to_vec()),
        });
    }

    pub fn get(&self, entry_id: &str) -> Option<Status> {
        self.store
            .state()
            .get(entry_id)
            .and_then(|by_type| by_type.get(self.type_id))
            .cloned()
    }

    pub fn all(&self) -> Vec<Status> {
        self.store
            .state()
            .values()
            .filter_map(|by_type| by_type.get(self.type_id))
            .cloned()
            .collect()
    }
}

// ============================================================================
// Provider-state channel
// ============================================================================

/// Events on the provider-state channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProviderEvent {
    RunAll,
    ClearAll,
}

pub type ProviderStore = ReplicatedStore<ProviderState, ProviderEvent>;

pub fn provider_store(actor: Actor) -> ProviderStore {
    ReplicatedStore::new(PROVIDER_CHANNEL, actor, ProviderState::default())
}

impl ReplicatedStore<ProviderState, ProviderEvent> {
    /// Track busy/idle around `fut`: running, then succeeded or crashed
    pub async fn run_with_state<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.set_state(|s| *s = ProviderState::Running);
        let result = fut.await;
        let outcome = if result.is_ok() {
            ProviderState::Succeeded
        } else {
            ProviderState::Crashed
        };
        self.set_state(|s| *s = outcome);
        result
    }
}

/// The three replicas a process holds
#[derive(Clone)]
pub struct Stores {
    pub run_state: RunStateStore,
    pub status: StatusStore,
    pub provider: ProviderStore,
}

impl Stores {
    /// Fresh replicas for one process, sharing one actor identity
    pub fn new(environment: Environment) -> Self {
        let actor = Actor::new(environment);
        Self {
            run_state: run_state_store(actor.clone()),
            status: status_store(actor.clone()),
            provider: provider_store(actor),
        }
    }

    /// The channels as transports see them, in `CHANNELS` order
    pub fn channels(&self) -> Vec<Arc<dyn WireChannel>> {
        vec![
            Arc::new(self.run_state.clone()),
            Arc::new(self.status.clone()),
            Arc::new(self.provider.clone()),
        ]
    }

    pub fn channel(&self, name: &str) -> Result<Arc<dyn WireChannel>> {
        self.channels()
            .into_iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| Error::Protocol(format!("Unknown channel: {}", name)))
    }

    pub fn component_status(&self) -> TypedStatusStore {
        self.status.typed(STATUS_TYPE_COMPONENT_TEST)
    }

    pub fn a11y_status(&self) -> TypedStatusStore {
        self.status.typed(STATUS_TYPE_A11Y)
    }
}
