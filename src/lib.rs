use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagmaticError>;

#[derive(Error, Debug)]
pub enum RagmaticError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Installer error: {0}")]
    Installer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Marker error for failures that must not be retried.
///
/// User callbacks can return this (wrapped in `anyhow::Error`) to tell the
/// worker that retrying the job cannot succeed. Anything else a callback
/// returns is treated as retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct PermanentError {
    message: String,
}

impl PermanentError {
    #[inline]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub mod chunking;
pub mod config;
pub mod database;
pub mod embeddings;
pub mod installer;
pub mod pipeline;
pub mod worker;

pub use chunking::{Chunk, ChunkHasher, ChunkPayload, Chunker, DefaultChunkHasher, SourceRow};
pub use config::{IdType, PipelineConfig, WorkerConfig};
pub use database::Database;
pub use embeddings::{EmbeddedChunk, Embedder};
pub use pipeline::{Pipeline, create};
pub use worker::{PipelineCallbacks, Worker};
