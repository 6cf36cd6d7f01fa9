//! Error types for the strand-cli crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Strand(#[from] strand_core::StrandError),

    #[error("Invalid request file {path}: {reason}")]
    Request { path: String, reason: String },

    #[error("Invalid secret key: {0}")]
    Secret(String),

    #[error("Corrupt snapshot {path}: {reason}")]
    Snapshot { path: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;
