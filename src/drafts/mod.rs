//! Draft management module
//!
//! Draft records, their publish-status state machine, and the JSON-backed
//! store that owns draft files on disk.

pub mod schema;
pub mod store;

pub use schema::{Draft, DraftMetadata, PublishStatus};
pub use store::{DraftStore, StorageError};
