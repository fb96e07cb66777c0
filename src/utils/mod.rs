//! Shared helpers

pub mod error;
pub mod fs;

pub use error::{AppError, AppResult, ErrorResponse};
pub use fs::DeleteOutcome;
