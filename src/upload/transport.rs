//! Upload transport abstraction

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Credentials presented to the upload target
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub bearer_token: Option<String>,
}

impl AuthContext {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer_token: Some(token.into()),
        }
    }
}

/// Where the uploaded file now lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUpload {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Upload timed out")]
    Timeout,

    #[error("Server error: {0}")]
    Server(String),

    #[error("Not authorized: {0}")]
    Auth(String),

    #[error("Upload cancelled")]
    Cancelled,

    /// Refused for a reason retrying will not fix (4xx other than auth)
    #[error("Upload rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Cannot read upload source: {0}")]
    Io(String),
}

/// Moves one file to the upload target
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Key for the circuit breaker guarding this target
    fn target(&self) -> &str;

    /// Upload `file`. Implementations check `cancel` between chunks and
    /// return `TransportError::Cancelled` promptly once it fires.
    async fn upload(
        &self,
        file: &Path,
        auth: &AuthContext,
        cancel: &CancellationToken,
    ) -> Result<RemoteUpload, TransportError>;
}
