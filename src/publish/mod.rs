//! Publishing
//!
//! Drives a draft through upload and broadcast and owns its publish status.

pub mod orchestrator;

pub use orchestrator::{BroadcastError, Broadcaster, PublishError, PublishOrchestrator};
