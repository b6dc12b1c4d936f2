//! Error types for storyrun

use crate::types::ErrorLike;
use thiserror::Error;

/// Result type alias using the storyrun Error
pub type Result<T> = std::result::Result<T, Error>;

/// storyrun error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Aborting test runner process because it took longer than {seconds} seconds to start")]
    BootTimeout { seconds: u64 },

    #[error("Failed to spawn test runner process: {0}")]
    Spawn(String),

    #[error("Test runner process errored: {}", .0.message)]
    ChildCrashed(ErrorLike),

    #[error("Test runner process is not running")]
    ChildNotRunning,

    #[error("Engine failed to start: {0}")]
    EngineStartup(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    #[error("Invalid run transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Tests completed but there are {count} unhandled error(s)")]
    UnhandledTestErrors { count: usize },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable name of the error kind, used as `ErrorLike::name`
    pub fn name(&self) -> &'static str {
        match self {
            Error::Io(_) => "IoError",
            Error::Serialization(_) => "SerializationError",
            Error::ConfigParse(_) => "ConfigParseError",
            Error::Http(_) => "HttpError",
            Error::InvalidConfig(_) => "InvalidConfigError",
            Error::BootTimeout { .. } => "BootTimeoutError",
            Error::Spawn(_) => "SpawnError",
            Error::ChildCrashed(_) => "ChildCrashedError",
            Error::ChildNotRunning => "ChildNotRunningError",
            Error::EngineStartup(_) => "EngineStartupError",
            Error::Engine(_) => "EngineError",
            Error::EntryNotFound(_) => "EntryNotFoundError",
            Error::InvalidTransition { .. } => "InvalidTransitionError",
            Error::UnhandledTestErrors { .. } => "UnhandledTestErrors",
            Error::ChannelClosed(_) => "ChannelClosedError",
            Error::Protocol(_) => "ProtocolError",
            Error::Catalog(_) => "CatalogError",
            Error::Internal(_) => "InternalError",
        }
    }

    /// Rebuild an owned error from one shared between several waiters
    pub fn from_shared(err: &std::sync::Arc<Error>) -> Self {
        match err.as_ref() {
            Error::EngineStartup(msg) => Error::EngineStartup(msg.clone()),
            Error::Engine(msg) => Error::Engine(msg.clone()),
            Error::ChildCrashed(e) => Error::ChildCrashed(e.clone()),
            Error::BootTimeout { seconds } => Error::BootTimeout { seconds: *seconds },
            other => Error::Internal(other.to_string()),
        }
    }
}
