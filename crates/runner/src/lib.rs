//! storyrun runner
//!
//! The child process side of storyrun: it replicates the run-state,
//! status and provider channels over stdio, owns the test engine and
//! turns run requests into engine runs.

pub mod aggregator;
pub mod catalog;
pub mod engine;
pub mod orchestrator;
pub mod selection;
pub mod transport;
pub mod watcher;

pub use aggregator::ResultAggregator;
pub use engine::EngineLifecycleManager;
pub use orchestrator::{Orchestrator, RunPhase};
