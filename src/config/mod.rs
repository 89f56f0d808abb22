// Pipeline configuration module
// Install-time settings for a pipeline plus runtime worker tuning knobs


use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum dimension accepted for the pgvector column.
pub const MAX_EMBEDDING_DIMENSION: u32 = 16000;

/// Schema-version tag written to the config table at install.
pub const SCHEMA_VERSION: &str = "1";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid pipeline name: cannot be empty")]
    EmptyPipelineName,
    #[error("Invalid source table: cannot be empty")]
    EmptySourceTable,
    #[error("Invalid embedding dimension: {0} (must be between 1 and {MAX_EMBEDDING_DIMENSION})")]
    InvalidEmbeddingDimension(u32),
    #[error("Invalid batch size: 0 (must be at least 1)")]
    InvalidBatchSize,
    #[error("Invalid polling interval: 0 (must be at least 1ms)")]
    InvalidPollingInterval,
    #[error("Invalid stalled job timeout: {0} (must be positive)")]
    InvalidStalledJobTimeout(f64),
    #[error("Invalid id type: {0} (must be one of int, bigint, uuid, text)")]
    InvalidIdType(String),
}

/// Scalar type of the source table's `id` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdType {
    #[default]
    Int,
    BigInt,
    Uuid,
    Text,
}

impl IdType {
    /// Postgres column type for this id.
    #[inline]
    pub fn sql_type(self) -> &'static str {
        match self {
            IdType::Int => "INT",
            IdType::BigInt => "BIGINT",
            IdType::Uuid => "UUID",
            IdType::Text => "TEXT",
        }
    }

    /// Cast suffix applied to text binds carrying an id value.
    #[inline]
    pub fn cast(self) -> &'static str {
        match self {
            IdType::Int => "::int",
            IdType::BigInt => "::bigint",
            IdType::Uuid => "::uuid",
            IdType::Text => "::text",
        }
    }
}

impl fmt::Display for IdType {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            IdType::Int => write!(f, "int"),
            IdType::BigInt => write!(f, "bigint"),
            IdType::Uuid => write!(f, "uuid"),
            IdType::Text => write!(f, "text"),
        }
    }
}

impl FromStr for IdType {
    type Err = ConfigError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "int" => Ok(IdType::Int),
            "bigint" => Ok(IdType::BigInt),
            "uuid" => Ok(IdType::Uuid),
            "text" => Ok(IdType::Text),
            other => Err(ConfigError::InvalidIdType(other.to_string())),
        }
    }
}

/// Install-time configuration for a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name; the namespace is derived from it by sanitization.
    pub name: String,
    /// Source table, optionally schema-qualified (`schema.table`).
    pub source_table: String,
    /// Dimension of the pgvector column on the chunks table.
    pub embedding_dimension: u32,
    /// Type of the source table's `id` column.
    pub id_type: IdType,
    /// Override for the shadow table name inside the namespace.
    pub shadow_table: Option<String>,
    /// Override for the chunks table name inside the namespace.
    pub chunks_table: Option<String>,
    /// Suppress creation of the cosine-distance vector index.
    pub skip_embedding_index_setup: bool,
}

impl PipelineConfig {
    #[inline]
    pub fn new(
        name: impl Into<String>,
        source_table: impl Into<String>,
        embedding_dimension: u32,
    ) -> Self {
        Self {
            name: name.into(),
            source_table: source_table.into(),
            embedding_dimension,
            id_type: IdType::default(),
            shadow_table: None,
            chunks_table: None,
            skip_embedding_index_setup: false,
        }
    }

    #[inline]
    pub fn with_id_type(mut self, id_type: IdType) -> Self {
        self.id_type = id_type;
        self
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyPipelineName);
        }
        if self.source_table.trim().is_empty() {
            return Err(ConfigError::EmptySourceTable);
        }
        if self.embedding_dimension == 0 || self.embedding_dimension > MAX_EMBEDDING_DIMENSION {
            return Err(ConfigError::InvalidEmbeddingDimension(
                self.embedding_dimension,
            ));
        }
        Ok(())
    }
}

/// Runtime tuning knobs for a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Tick period for the enqueue and process loops.
    pub polling_interval_ms: u64,
    /// Maximum jobs enqueued or claimed per tick.
    pub batch_size: usize,
    /// Retries for retryable errors before a job is failed.
    pub max_retries: u32,
    /// Initial retry delay in milliseconds (exponential backoff base).
    pub initial_retry_delay_ms: u64,
    /// Maximum retry delay in milliseconds.
    pub max_retry_delay_ms: u64,
    /// Grace period before a processing job is reclaimable by another worker.
    pub stalled_job_timeout_minutes: f64,
}

impl Default for WorkerConfig {
    #[inline]
    fn default() -> Self {
        Self {
            polling_interval_ms: 1000,
            batch_size: 5,
            max_retries: 3,
            initial_retry_delay_ms: 1000,
            max_retry_delay_ms: 3_000_000, // 50 minutes
            stalled_job_timeout_minutes: 1.0,
        }
    }
}

impl WorkerConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.polling_interval_ms == 0 {
            return Err(ConfigError::InvalidPollingInterval);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        if !self.stalled_job_timeout_minutes.is_finite() || self.stalled_job_timeout_minutes <= 0.0
        {
            return Err(ConfigError::InvalidStalledJobTimeout(
                self.stalled_job_timeout_minutes,
            ));
        }
        Ok(())
    }
}
