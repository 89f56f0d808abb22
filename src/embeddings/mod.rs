// Embedder contract and embedding validation


use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::PermanentError;
use crate::chunking::Chunk;

/// What an embedder returns for one chunk: the vector plus optional payload
/// overrides stored in place of the chunk's own columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    pub embedding: Vec<f32>,
    pub text: Option<String>,
    pub blob: Option<Vec<u8>>,
    pub json: Option<serde_json::Value>,
}

impl EmbeddedChunk {
    #[inline]
    pub fn new(embedding: Vec<f32>) -> Self {
        Self {
            embedding,
            text: None,
            blob: None,
            json: None,
        }
    }

    #[inline]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    #[inline]
    pub fn with_blob(mut self, blob: Vec<u8>) -> Self {
        self.blob = Some(blob);
        self
    }

    #[inline]
    pub fn with_json(mut self, json: serde_json::Value) -> Self {
        self.json = Some(json);
        self
    }
}

/// Computes the embedding vector for one chunk. Failures are retryable
/// unless the error chain contains a [`PermanentError`].
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, chunk: &Chunk, index: usize) -> Result<EmbeddedChunk>;
}

/// Reject embeddings with the wrong dimension or non-finite entries.
/// Violations are permanent: retrying the same callback cannot fix them.
pub fn validate_embedding(embedding: &[f32], expected_dimension: u32) -> Result<()> {
    if embedding.len() != expected_dimension as usize {
        return Err(PermanentError::new(format!(
            "invalid embedding dimension: expected {expected_dimension}, got {}",
            embedding.len()
        ))
        .into());
    }
    if let Some(position) = embedding.iter().position(|v| !v.is_finite()) {
        return Err(PermanentError::new(format!(
            "embedding contains a non-finite value at position {position}"
        ))
        .into());
    }
    Ok(())
}
