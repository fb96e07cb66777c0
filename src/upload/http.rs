//! HTTP upload transport
//!
//! Streams the file as the body of a PUT to the configured endpoint. The
//! server answers with `{ "url": ..., "sha256": ... }`.

use super::transport::{AuthContext, RemoteUpload, TransportError, UploadTransport};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Body, Client, StatusCode};
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

pub struct HttpUploadTransport {
    client: Client,
    endpoint: String,
    chunk_size: usize,
}

impl HttpUploadTransport {
    pub fn new(
        endpoint: impl Into<String>,
        timeout: Duration,
        chunk_size: usize,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            chunk_size: chunk_size.max(1),
        })
    }

    fn classify(status: StatusCode, body: String) -> TransportError {
        let message = if body.trim().is_empty() {
            status.to_string()
        } else {
            body.trim().to_string()
        };
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportError::Auth(message),
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                TransportError::Server(message)
            }
            s if s.is_server_error() => TransportError::Server(message),
            s => TransportError::Rejected {
                status: s.as_u16(),
                message,
            },
        }
    }
}

#[async_trait]
impl UploadTransport for HttpUploadTransport {
    fn target(&self) -> &str {
        &self.endpoint
    }

    async fn upload(
        &self,
        file: &Path,
        auth: &AuthContext,
        cancel: &CancellationToken,
    ) -> Result<RemoteUpload, TransportError> {
        let source = tokio::fs::File::open(file)
            .await
            .map_err(|e| TransportError::Io(format!("{}: {}", file.display(), e)))?;

        let token = cancel.clone();
        let chunks = ReaderStream::with_capacity(source, self.chunk_size).map(move |chunk| {
            if token.is_cancelled() {
                Err(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "upload cancelled",
                ))
            } else {
                chunk
            }
        });

        let mut request = self
            .client
            .put(&self.endpoint)
            .header(CONTENT_TYPE, "video/mp4")
            .body(Body::wrap_stream(chunks));
        if let Some(bearer) = &auth.bearer_token {
            request = request.bearer_auth(bearer);
        }

        tracing::debug!("PUT {:?} -> {}", file, self.endpoint);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            response = request.send() => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(_) if cancel.is_cancelled() => return Err(TransportError::Cancelled),
            Err(e) if e.is_timeout() => return Err(TransportError::Timeout),
            Err(e) => return Err(TransportError::Server(e.to_string())),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify(status, body));
        }

        response
            .json::<RemoteUpload>()
            .await
            .map_err(|e| TransportError::Server(format!("Invalid upload response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            HttpUploadTransport::classify(StatusCode::UNAUTHORIZED, String::new()),
            TransportError::Auth("401 Unauthorized".to_string())
        );
        assert!(matches!(
            HttpUploadTransport::classify(StatusCode::FORBIDDEN, "expired".to_string()),
            TransportError::Auth(m) if m == "expired"
        ));
        assert!(matches!(
            HttpUploadTransport::classify(StatusCode::BAD_GATEWAY, String::new()),
            TransportError::Server(_)
        ));
        assert!(matches!(
            HttpUploadTransport::classify(StatusCode::TOO_MANY_REQUESTS, String::new()),
            TransportError::Server(_)
        ));
        assert!(matches!(
            HttpUploadTransport::classify(StatusCode::PAYLOAD_TOO_LARGE, String::new()),
            TransportError::Rejected { status: 413, .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let transport =
            HttpUploadTransport::new("http://127.0.0.1:9/upload", Duration::from_secs(1), 1024)
                .unwrap();
        let err = transport
            .upload(
                Path::new("/definitely/not/here.mp4"),
                &AuthContext::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
