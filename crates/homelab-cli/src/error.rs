//! Error types for the CLI

use std::path::PathBuf;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that stop a command before any step runs
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("desired state not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("invalid desired state: {0}")]
    Invalid(#[source] homelab_common::Error),

    #[error("{0}")]
    Startup(#[from] homelab_common::Error),
}
