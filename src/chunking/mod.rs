// Chunk model and hashing
// A chunk is one element of the user-defined decomposition of a source row;
// its hash key is the unit of deduplication between embedding passes.


use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A source row handed to the chunker, loaded as JSON so the engine stays
/// agnostic of the source table's shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    /// The row's `id`, carried as text regardless of the configured id type.
    pub id: String,
    pub data: serde_json::Value,
}

impl SourceRow {
    #[inline]
    pub fn new(id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Convenience accessor for a column of the source row.
    #[inline]
    pub fn column(&self, name: &str) -> Option<&serde_json::Value> {
        self.data.get(name)
    }

    /// Convenience accessor for a text column of the source row.
    #[inline]
    pub fn column_str(&self, name: &str) -> Option<&str> {
        self.data.get(name).and_then(|v| v.as_str())
    }
}

/// The primary payload of a chunk; exactly one per chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkPayload {
    Text(String),
    Blob(Vec<u8>),
    Json(serde_json::Value),
}

/// One chunk produced by the user's chunker. The primary payload fills its
/// column in the chunks table; the optional sibling fields fill the others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub payload: ChunkPayload,
    pub text: Option<String>,
    pub blob: Option<Vec<u8>>,
    pub json: Option<serde_json::Value>,
}

impl Chunk {
    #[inline]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            payload: ChunkPayload::Text(content.into()),
            text: None,
            blob: None,
            json: None,
        }
    }

    #[inline]
    pub fn blob(bytes: Vec<u8>) -> Self {
        Self {
            payload: ChunkPayload::Blob(bytes),
            text: None,
            blob: None,
            json: None,
        }
    }

    #[inline]
    pub fn json(value: serde_json::Value) -> Self {
        Self {
            payload: ChunkPayload::Json(value),
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

    /// Value destined for the `text` column.
    #[inline]
    pub fn text_column(&self) -> Option<&str> {
        match &self.payload {
            ChunkPayload::Text(t) => Some(t),
            _ => self.text.as_deref(),
        }
    }

    /// Value destined for the `blob` column.
    #[inline]
    pub fn blob_column(&self) -> Option<&[u8]> {
        match &self.payload {
            ChunkPayload::Blob(b) => Some(b),
            _ => self.blob.as_deref(),
        }
    }

    /// Value destined for the `json` column.
    #[inline]
    pub fn json_column(&self) -> Option<&serde_json::Value> {
        match &self.payload {
            ChunkPayload::Json(j) => Some(j),
            _ => self.json.as_ref(),
        }
    }
}

/// Decomposes a source row into an ordered chunk sequence. Must be
/// deterministic in content and order for the same row.
#[async_trait]
pub trait Chunker: Send + Sync {
    async fn chunk(&self, row: &SourceRow) -> Result<Vec<Chunk>>;
}

/// Produces the stable identity of a chunk's content. Must be stable across
/// process restarts; position is appended separately via [`hash_key`].
pub trait ChunkHasher: Send + Sync {
    fn hash(&self, chunk: &Chunk) -> String;
}

/// Compose the dedup key stored in `chunk_hash`.
#[inline]
pub fn hash_key(hash: &str, index: usize) -> String {
    format!("{hash}-{index}")
}

/// Hex-md5 over the stringified non-blob fields, concatenated with hex-md5
/// over the blob bytes when present.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultChunkHasher;

impl ChunkHasher for DefaultChunkHasher {
    fn hash(&self, chunk: &Chunk) -> String {
        let mut content = String::new();
        if let Some(text) = chunk.text_column() {
            content.push_str(text);
        }
        if let Some(json) = chunk.json_column() {
            content.push_str(&json.to_string());
        }

        let mut digest = format!("{:x}", md5::compute(content.as_bytes()));
        if let Some(blob) = chunk.blob_column() {
            digest.push_str(&format!("{:x}", md5::compute(blob)));
        }
        digest
    }
}
