use std::path::PathBuf;

use thiserror::Error;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Malformed batch file {}: {reason}", .path.display())]
    MalformedBatchFile { path: PathBuf, reason: String },
    #[error("Conversion error: {0}")]
    Conversion(String),
    #[error("Aggregate artifact {} missing after write", .0.display())]
    ArtifactWriteIncomplete(PathBuf),
    #[error("Encoder error: {0}")]
    Encoder(String),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    /// Errors that abort a run with exit status 1 before any batch is processed.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Self::InvalidInput(_))
    }
}
