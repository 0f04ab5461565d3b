//! Persisted integrations ("apps")
//!
//! An app is a Python class wrapping some service's API. Apps live as
//! module files next to a manifest and are loaded into the live kernel on
//! request.

pub mod generator;
pub mod inject;
pub mod manifest;

use std::path::{Path, PathBuf};

pub use generator::{AppGenerator, GeneratedApp, ModelAppGenerator};
pub use inject::injection_snippet;
pub use manifest::{render_listing, AppEntry, IntegrationStore};

use crate::llm::ModelError;

/// Error type for integration operations
#[derive(Debug, thiserror::Error)]
pub enum IntegrationError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("no app with id '{0}'")]
    NotFound(String),
    #[error("invalid app: {0}")]
    InvalidApp(String),
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("generation failed: {0}")]
    Model(#[from] ModelError),
}

impl IntegrationError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
