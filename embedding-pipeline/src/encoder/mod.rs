mod command;
mod hashed;

pub use command::CommandEncoder;
pub use hashed::HashedEncoder;

use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    types::{Record, Tensor},
    utils::config::{EncoderBackend, EncoderConfig},
};

/// Per-record encoder output, index-aligned with the records passed in.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedBatch {
    pub embeddings: Vec<Tensor>,
    pub attentions: Vec<Tensor>,
    /// Peak accelerator memory in MB, when the backend can report it.
    pub peak_device_memory_mb: Option<f64>,
}

impl EncodedBatch {
    pub fn ensure_aligned(&self, expected: usize) -> Result<(), AppError> {
        if self.embeddings.len() != expected || self.attentions.len() != expected {
            return Err(AppError::Encoder(format!(
                "encoder returned {} embeddings and {} attention matrices for {expected} records",
                self.embeddings.len(),
                self.attentions.len()
            )));
        }
        Ok(())
    }
}

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    fn backend_label(&self) -> &str;

    async fn encode(&self, records: &[Record]) -> Result<EncodedBatch, AppError>;
}

pub fn build_encoder(config: &EncoderConfig) -> Result<Arc<dyn EmbeddingService>, AppError> {
    match config.backend {
        EncoderBackend::Hashed => Ok(Arc::new(HashedEncoder::new(config.dimension))),
        EncoderBackend::Command => {
            let (program, args) = config.command.split_first().ok_or_else(|| {
                AppError::Validation("encoder.command is required for the command backend".into())
            })?;
            Ok(Arc::new(CommandEncoder::new(program.clone(), args.to_vec())))
        }
    }
}
