//! Upload module
//!
//! Per-draft upload queue, circuit breaking per upload target, and the
//! transports that move files off the device.

pub mod breaker;
pub mod coordinator;
pub mod http;
pub mod transport;

pub use breaker::{BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use coordinator::{
    FileFingerprint, PendingUpload, UploadCoordinator, UploadError, UploadQueueSnapshot,
    UploadStatus,
};
pub use http::HttpUploadTransport;
pub use transport::{AuthContext, RemoteUpload, TransportError, UploadTransport};
