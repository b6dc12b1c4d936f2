//! storyrun common library
//!
//! Data model, replicated store, process boundary envelope and
//! configuration shared by the host and the runner process.

pub mod config;
pub mod error;
pub mod store;
pub mod types;
pub mod wire;

// Re-export commonly used types
pub use config::StoryrunConfig;
pub use error::{Error, Result};
pub use store::{Environment, Stores, WireChannel};
pub use types::*;
pub use wire::{ChildMessage, Envelope};

/// storyrun version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
