//! Derived media processing
//!
//! Produces and retires derived (audio-stripped) variants of a draft's
//! recording.

pub mod mute;

pub use mute::{CurrentFileHandoff, DerivedMediaProcessor, NoHandoff, ProcessingError};
