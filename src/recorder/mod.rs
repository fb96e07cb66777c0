//! Recording system module
//!
//! - CaptureChannel trait for the camera segment writer
//! - RecordingController owning the capture state machine
//! - Snapshot types published to subscribers

pub mod channel;
pub mod coordinator;
pub mod state;

pub use channel::{CaptureChannel, RecordingError, RecordingResult};
pub use coordinator::RecordingController;
pub use state::{RecordingOutput, RecordingSnapshot, RecordingState, Segment};
