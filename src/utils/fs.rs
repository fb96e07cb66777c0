//! Best-effort file removal
//!
//! Cleanup never fails the operation that triggered it. Callers get a
//! tri-state outcome, log `Failed`, and carry on.

use std::io;
use std::path::Path;

/// Result of a best-effort delete
#[derive(Debug)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    Failed(io::Error),
}

impl DeleteOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, DeleteOutcome::Failed(_))
    }
}

/// Remove a file, classifying the result
pub async fn remove_file(path: &Path) -> DeleteOutcome {
    match tokio::fs::remove_file(path).await {
        Ok(()) => DeleteOutcome::Deleted,
        Err(e) if e.kind() == io::ErrorKind::NotFound => DeleteOutcome::NotFound,
        Err(e) => DeleteOutcome::Failed(e),
    }
}

/// Remove a file and log anything other than success.
///
/// `what` names the file's role in log lines ("derived clip", "segment").
pub async fn remove_file_logged(path: &Path, what: &str) -> DeleteOutcome {
    let outcome = remove_file(path).await;
    match &outcome {
        DeleteOutcome::Deleted => tracing::debug!("Deleted {} {:?}", what, path),
        DeleteOutcome::NotFound => tracing::debug!("{} {:?} already gone", what, path),
        DeleteOutcome::Failed(e) => {
            tracing::warn!("Failed to delete {} {:?}: {} (leaving it on disk)", what, path, e)
        }
    }
    outcome
}

/// Blocking variant for synchronous callers (the draft store)
pub fn remove_file_blocking(path: &Path, what: &str) -> DeleteOutcome {
    let outcome = match std::fs::remove_file(path) {
        Ok(()) => DeleteOutcome::Deleted,
        Err(e) if e.kind() == io::ErrorKind::NotFound => DeleteOutcome::NotFound,
        Err(e) => DeleteOutcome::Failed(e),
    };
    if let DeleteOutcome::Failed(e) = &outcome {
        tracing::warn!("Failed to delete {} {:?}: {} (leaving it on disk)", what, path, e);
    }
    outcome
}
