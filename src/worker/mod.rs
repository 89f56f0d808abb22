// Worker module
// Turns shadow/chunk divergence into jobs, claims them with leases, and
// drives each doc's chunks toward the latest observed shadow clock


use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::PermanentError;
use crate::chunking::{ChunkHasher, Chunker, DefaultChunkHasher, SourceRow, hash_key};
use crate::config::{IdType, PipelineConfig, WorkerConfig};
use crate::database::Database;
use crate::database::models::WorkQueueJob;
use crate::database::names::PipelineNames;
use crate::database::queries::{
    ChunkQueries, NewChunk, ShadowQueries, SourceQueries, WorkQueueQueries,
};
use crate::embeddings::{Embedder, validate_embedding};

/// The user-supplied callbacks a pipeline runs rows through.
pub struct PipelineCallbacks {
    pub chunker: Arc<dyn Chunker>,
    pub embedder: Arc<dyn Embedder>,
    pub hasher: Arc<dyn ChunkHasher>,
}

impl PipelineCallbacks {
    #[inline]
    pub fn new(chunker: Arc<dyn Chunker>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            chunker,
            embedder,
            hasher: Arc::new(DefaultChunkHasher),
        }
    }

    #[inline]
    pub fn with_hasher(mut self, hasher: Arc<dyn ChunkHasher>) -> Self {
        self.hasher = hasher;
        self
    }
}

/// How a claimed job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Completed,
    Skipped(&'static str),
    /// Another worker reclaimed the lease; its new owner will progress.
    Superseded,
}

const SKIP_NEWER_JOB: &str = "newer job found";
const SKIP_DOC_DELETED: &str = "document deleted";
const SKIP_CLOCK_STALE: &str = "vector clock no longer latest";

pub struct Worker {
    database: Database,
    names: PipelineNames,
    id_type: IdType,
    embedding_dimension: u32,
    config: WorkerConfig,
    worker_id: String,
    callbacks: PipelineCallbacks,
}

impl Worker {
    #[inline]
    pub fn new(
        database: Database,
        pipeline: &PipelineConfig,
        config: WorkerConfig,
        callbacks: PipelineCallbacks,
    ) -> Self {
        Self {
            database,
            names: PipelineNames::new(pipeline),
            id_type: pipeline.id_type,
            embedding_dimension: pipeline.embedding_dimension,
            config,
            worker_id: Uuid::new_v4().to_string(),
            callbacks,
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.worker_id
    }

    /// Run the enqueue loop until shutdown is signalled. A new tick is only
    /// scheduled after the previous one finishes.
    pub async fn run_enqueue_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.polling_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.enqueue_tick().await {
                        warn!(
                            worker_id = %self.worker_id,
                            error = %format!("{error:#}"),
                            "enqueue tick failed"
                        );
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!(worker_id = %self.worker_id, "enqueue loop stopped");
    }

    /// Run the process loop until shutdown is signalled.
    pub async fn run_process_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.polling_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.process_tick().await {
                        warn!(
                            worker_id = %self.worker_id,
                            error = %format!("{error:#}"),
                            "process tick failed"
                        );
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!(worker_id = %self.worker_id, "process loop stopped");
    }

    /// One pass of the enqueuer: insert pending jobs for every doc whose
    /// shadow clock is ahead of its chunks, most-stale first.
    pub async fn enqueue_tick(&self) -> Result<u64> {
        let queue = WorkQueueQueries::new(&self.names, self.id_type);
        let enqueued = queue
            .enqueue_outdated(self.database.pool(), self.config.batch_size as i64)
            .await?;
        if enqueued > 0 {
            debug!(worker_id = %self.worker_id, enqueued, "enqueued outdated documents");
        }
        Ok(enqueued)
    }

    /// One pass of the processor: claim up to a batch of pending-or-stalled
    /// jobs and run each to an outcome. Returns the number claimed.
    pub async fn process_tick(&self) -> Result<usize> {
        let queue = WorkQueueQueries::new(&self.names, self.id_type);
        let jobs = queue
            .claim(
                self.database.pool(),
                &self.worker_id,
                self.config.batch_size as i64,
                self.config.stalled_job_timeout_minutes,
            )
            .await?;
        if jobs.is_empty() {
            return Ok(0);
        }

        debug!(worker_id = %self.worker_id, claimed = jobs.len(), "claimed jobs");
        for job in &jobs {
            self.process_job(job).await;
        }
        Ok(jobs.len())
    }

    async fn process_job(&self, job: &WorkQueueJob) {
        match self.run_job(job).await {
            Ok(JobOutcome::Completed) => {
                info!(
                    worker_id = %self.worker_id,
                    doc_id = %job.doc_id,
                    vector_clock = job.vector_clock,
                    "job completed"
                );
            }
            Ok(JobOutcome::Skipped(reason)) => {
                info!(
                    worker_id = %self.worker_id,
                    doc_id = %job.doc_id,
                    vector_clock = job.vector_clock,
                    reason,
                    "job skipped"
                );
            }
            Ok(JobOutcome::Superseded) => {
                debug!(
                    worker_id = %self.worker_id,
                    doc_id = %job.doc_id,
                    vector_clock = job.vector_clock,
                    "lease reclaimed by another worker; leaving job to its new owner"
                );
            }
            Err(error) => self.handle_job_error(job, error).await,
        }
    }

    /// The per-job protocol: preemption check, row load, chunk, diff against
    /// stored hashes, embed only what is new, and swap chunks + complete the
    /// job in one transaction gated on the shadow clock still matching.
    async fn run_job(&self, job: &WorkQueueJob) -> Result<JobOutcome> {
        let pool = self.database.pool();
        let queue = WorkQueueQueries::new(&self.names, self.id_type);

        if let Some(latest) = queue.latest_clock_for_doc(pool, &job.doc_id).await? {
            if latest > job.vector_clock {
                queue
                    .mark_skipped(pool, job.id, &self.worker_id, SKIP_NEWER_JOB)
                    .await?;
                return Ok(JobOutcome::Skipped(SKIP_NEWER_JOB));
            }
        }

        let source = SourceQueries::new(&self.names, self.id_type);
        let Some(data) = source.fetch_row(pool, &job.doc_id).await? else {
            queue
                .mark_skipped(pool, job.id, &self.worker_id, SKIP_DOC_DELETED)
                .await?;
            return Ok(JobOutcome::Skipped(SKIP_DOC_DELETED));
        };
        let row = SourceRow::new(job.doc_id.clone(), data);

        let chunks = self
            .callbacks
            .chunker
            .chunk(&row)
            .await
            .context("chunker callback failed")?;
        let keys: Vec<String> = chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| hash_key(&self.callbacks.hasher.hash(chunk), index))
            .collect();

        let chunk_queries = ChunkQueries::new(&self.names, self.id_type);
        let mut tx = self.database.begin_transaction().await?;

        let existing = chunk_queries.hashes_for_doc(&mut tx, &job.doc_id).await?;
        let key_set: HashSet<&str> = keys.iter().map(String::as_str).collect();
        let to_delete: Vec<String> = existing
            .iter()
            .filter(|hash| !key_set.contains(hash.as_str()))
            .cloned()
            .collect();

        let mut embedded_count = 0usize;
        for (index, (chunk, key)) in chunks.iter().zip(&keys).enumerate() {
            if existing.contains(key) {
                continue;
            }
            let embedded = self
                .callbacks
                .embedder
                .embed(chunk, index)
                .await
                .context("embedder callback failed")?;
            validate_embedding(&embedded.embedding, self.embedding_dimension)?;

            let new_chunk = NewChunk {
                doc_id: job.doc_id.clone(),
                vector_clock: job.vector_clock,
                index: index as i32,
                chunk_hash: key.clone(),
                text: embedded
                    .text
                    .or_else(|| chunk.text_column().map(str::to_string)),
                blob: embedded.blob.or_else(|| chunk.blob_column().map(<[u8]>::to_vec)),
                json: embedded.json.or_else(|| chunk.json_column().cloned()),
                embedding: embedded.embedding,
            };
            chunk_queries.insert(&mut tx, &new_chunk).await?;
            embedded_count += 1;
        }

        let deleted = chunk_queries
            .delete_hashes(&mut tx, &job.doc_id, &to_delete)
            .await?;
        chunk_queries
            .advance_clock(&mut tx, &job.doc_id, job.vector_clock)
            .await?;

        let completed = queue
            .complete_gate(&mut tx, &job.doc_id, job.vector_clock, &self.worker_id)
            .await?;
        if completed {
            tx.commit().await.context("Failed to commit job")?;
            debug!(
                worker_id = %self.worker_id,
                doc_id = %job.doc_id,
                vector_clock = job.vector_clock,
                embedded = embedded_count,
                deleted,
                "chunk swap committed"
            );
            return Ok(JobOutcome::Completed);
        }

        // The gate refused: discard the swap and find out why.
        tx.rollback().await.context("Failed to roll back job")?;

        let shadow_clock = ShadowQueries::new(&self.names, self.id_type)
            .clock_for_doc(pool, &job.doc_id)
            .await?;
        match shadow_clock {
            None => {
                queue
                    .mark_skipped(pool, job.id, &self.worker_id, SKIP_DOC_DELETED)
                    .await?;
                Ok(JobOutcome::Skipped(SKIP_DOC_DELETED))
            }
            Some(clock) if clock > job.vector_clock => {
                queue
                    .mark_skipped(pool, job.id, &self.worker_id, SKIP_CLOCK_STALE)
                    .await?;
                Ok(JobOutcome::Skipped(SKIP_CLOCK_STALE))
            }
            Some(_) => Ok(JobOutcome::Superseded),
        }
    }

    /// Classify a failed job and either schedule a retry (releasing the
    /// lease after the backoff delay) or fail it for good.
    async fn handle_job_error(&self, job: &WorkQueueJob, error: anyhow::Error) {
        let message = format!("{error:#}");
        let retryable = is_retryable(&error);

        if retryable && job.retry_count < self.config.max_retries as i32 {
            let delay = backoff_delay(&self.config, job.retry_count as u32);
            warn!(
                worker_id = %self.worker_id,
                doc_id = %job.doc_id,
                vector_clock = job.vector_clock,
                error = %message,
                retry_count = job.retry_count,
                delay_ms = delay.as_millis() as u64,
                "job failed; releasing for retry after backoff"
            );
            // The job stays leased through the backoff; if this process dies
            // first, stall recovery reclaims it.
            let database = self.database.clone();
            let names = self.names.clone();
            let id_type = self.id_type;
            let worker_id = self.worker_id.clone();
            let job_id = job.id;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let queue = WorkQueueQueries::new(&names, id_type);
                if let Err(release_error) = queue
                    .release_for_retry(database.pool(), job_id, &worker_id, &message)
                    .await
                {
                    warn!(
                        worker_id = %worker_id,
                        error = %release_error,
                        "failed to release job; stall recovery will reclaim it"
                    );
                }
            });
        } else {
            error!(
                worker_id = %self.worker_id,
                doc_id = %job.doc_id,
                vector_clock = job.vector_clock,
                error = %message,
                retry_count = job.retry_count,
                retryable,
                "job failed permanently"
            );
            let queue = WorkQueueQueries::new(&self.names, self.id_type);
            if let Err(mark_error) = queue
                .mark_failed(self.database.pool(), job.id, &self.worker_id, &message)
                .await
            {
                warn!(error = %mark_error, "failed to mark job failed");
            }
        }
    }
}

/// Exponential backoff: `initial * 2^retry_count`, capped.
#[inline]
pub(crate) fn backoff_delay(config: &WorkerConfig, retry_count: u32) -> Duration {
    let delay = config
        .initial_retry_delay_ms
        .saturating_mul(2u64.saturating_pow(retry_count));
    Duration::from_millis(delay.min(config.max_retry_delay_ms))
}

/// Whether an error warrants returning the job to pending for another
/// attempt. Connection-class failures, deadlocks and serialization failures
/// are retryable, as is any callback error that doesn't carry a
/// [`PermanentError`] in its chain. Other database errors are not.
pub fn is_retryable(error: &anyhow::Error) -> bool {
    for cause in error.chain() {
        if cause.downcast_ref::<PermanentError>().is_some() {
            return false;
        }
        if let Some(sqlx_error) = cause.downcast_ref::<sqlx::Error>() {
            return match sqlx_error {
                sqlx::Error::Database(db_error) => match db_error.code().as_deref() {
                    // serialization failure / deadlock detected
                    Some("40001") | Some("40P01") => true,
                    // connection exception class
                    Some(code) => code.starts_with("08"),
                    None => false,
                },
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                _ => false,
            };
        }
    }
    true
}
