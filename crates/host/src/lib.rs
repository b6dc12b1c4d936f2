//! storyrun host
//!
//! Supervises the runner child process and bridges the replicated
//! channels across its stdio.

pub mod bridge;
pub mod supervisor;

pub use bridge::{ChildEvent, EventQueue, ProcessBridge};
pub use supervisor::Supervisor;
