//! Open ClipStudio - record, edit and publish short looping clips.
//!
//! Library crate for the capture-to-publish pipeline: segmented recording,
//! draft storage, audio muting via derived files, resilient uploads and
//! publishing. Hosts assemble it through [`studio::ClipStudio`].

pub mod config;
pub mod drafts;
pub mod media;
pub mod processing;
pub mod publish;
pub mod recorder;
pub mod studio;
pub mod upload;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use config::AppConfig;
pub use studio::{ClipStudio, Collaborators};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber. Safe to call more than once.
pub fn init_tracing() {
    let installed = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "open_clipstudio=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("Starting Open ClipStudio v{}", env!("CARGO_PKG_VERSION"));
    }
}
