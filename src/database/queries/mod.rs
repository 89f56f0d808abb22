// Query namespaces for the pipeline's tables
// All SQL is assembled at runtime because every pipeline owns its own
// namespace; identifiers come pre-quoted from PipelineNames, values are bound.

use std::collections::{BTreeMap, HashSet};

use anyhow::{Context, Result};
use sqlx::postgres::PgConnection;
use sqlx::Row;

use crate::config::IdType;
use crate::database::DbPool;
use crate::database::models::{ChunkRow, QueueStats, ShadowRow, WorkQueueJob};
use crate::database::names::PipelineNames;

/// A chunk ready to be written, embedding included.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    pub doc_id: String,
    pub vector_clock: i64,
    pub index: i32,
    pub chunk_hash: String,
    pub text: Option<String>,
    pub blob: Option<Vec<u8>>,
    pub json: Option<serde_json::Value>,
    pub embedding: Vec<f32>,
}

/// Render an embedding as a pgvector text literal, e.g. `[1,0,2.5]`.
#[inline]
pub fn vector_literal(embedding: &[f32]) -> String {
    let mut out = String::with_capacity(2 + embedding.len() * 8);
    out.push('[');
    for (i, value) in embedding.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&value.to_string());
    }
    out.push(']');
    out
}

pub struct ConfigQueries<'a> {
    names: &'a PipelineNames,
}

impl<'a> ConfigQueries<'a> {
    #[inline]
    pub fn new(names: &'a PipelineNames) -> Self {
        Self { names }
    }

    pub async fn upsert(&self, conn: &mut PgConnection, entries: &[(&str, String)]) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
            self.names.config()
        );
        for (key, value) in entries {
            sqlx::query(&sql)
                .bind(key)
                .bind(value)
                .execute(&mut *conn)
                .await
                .with_context(|| format!("Failed to upsert config key {key}"))?;
        }
        Ok(())
    }

    pub async fn fetch(&self, pool: &DbPool) -> Result<BTreeMap<String, String>> {
        let sql = format!("SELECT key, value FROM {}", self.names.config());
        let rows = sqlx::query(&sql)
            .fetch_all(pool)
            .await
            .context("Failed to fetch pipeline config")?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("key"), row.get::<String, _>("value")))
            .collect())
    }
}

pub struct ShadowQueries<'a> {
    names: &'a PipelineNames,
    id_type: IdType,
}

impl<'a> ShadowQueries<'a> {
    #[inline]
    pub fn new(names: &'a PipelineNames, id_type: IdType) -> Self {
        Self { names, id_type }
    }

    pub async fn clock_for_doc(&self, pool: &DbPool, doc_id: &str) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT vector_clock FROM {} WHERE doc_id = $1{}",
            self.names.shadow(),
            self.id_type.cast()
        );
        sqlx::query_scalar(&sql)
            .bind(doc_id)
            .fetch_optional(pool)
            .await
            .context("Failed to read shadow clock")
    }

    /// Insert clock=1 shadow rows for source rows that lack one.
    pub async fn backfill_missing(&self, conn: &mut PgConnection) -> Result<u64> {
        let sql = format!(
            "INSERT INTO {shadow} (doc_id, vector_clock) \
             SELECT t.id, 1 FROM {source} t \
             WHERE NOT EXISTS (SELECT 1 FROM {shadow} s WHERE s.doc_id = t.id) \
             ON CONFLICT (doc_id) DO NOTHING",
            shadow = self.names.shadow(),
            source = self.names.source(),
        );
        let result = sqlx::query(&sql)
            .execute(conn)
            .await
            .context("Failed to backfill shadow rows")?;
        Ok(result.rows_affected())
    }

    /// Bump every shadow clock by one; drives a full re-embed.
    pub async fn bump_all(&self, conn: &mut PgConnection) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET vector_clock = vector_clock + 1",
            self.names.shadow()
        );
        let result = sqlx::query(&sql)
            .execute(conn)
            .await
            .context("Failed to bump shadow clocks")?;
        Ok(result.rows_affected())
    }

    /// Delete shadow rows whose source row no longer exists.
    pub async fn delete_orphans(&self, conn: &mut PgConnection) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {shadow} s \
             WHERE NOT EXISTS (SELECT 1 FROM {source} t WHERE t.id = s.doc_id)",
            shadow = self.names.shadow(),
            source = self.names.source(),
        );
        let result = sqlx::query(&sql)
            .execute(conn)
            .await
            .context("Failed to delete orphaned shadow rows")?;
        Ok(result.rows_affected())
    }

    pub async fn fetch_all(&self, pool: &DbPool) -> Result<Vec<ShadowRow>> {
        let sql = format!(
            "SELECT id, doc_id::text AS doc_id, vector_clock FROM {} ORDER BY id",
            self.names.shadow()
        );
        sqlx::query_as(&sql)
            .fetch_all(pool)
            .await
            .context("Failed to fetch shadow rows")
    }
}

pub struct ChunkQueries<'a> {
    names: &'a PipelineNames,
    id_type: IdType,
}

impl<'a> ChunkQueries<'a> {
    #[inline]
    pub fn new(names: &'a PipelineNames, id_type: IdType) -> Self {
        Self { names, id_type }
    }

    pub async fn hashes_for_doc(
        &self,
        conn: &mut PgConnection,
        doc_id: &str,
    ) -> Result<HashSet<String>> {
        let sql = format!(
            "SELECT chunk_hash FROM {} WHERE doc_id = $1{}",
            self.names.chunks(),
            self.id_type.cast()
        );
        let hashes: Vec<String> = sqlx::query_scalar(&sql)
            .bind(doc_id)
            .fetch_all(conn)
            .await
            .context("Failed to read stored chunk hashes")?;
        Ok(hashes.into_iter().collect())
    }

    pub async fn insert(&self, conn: &mut PgConnection, chunk: &NewChunk) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (doc_id, vector_clock, \"index\", chunk_hash, text, blob, json, embedding) \
             VALUES ($1{}, $2, $3, $4, $5, $6, $7, $8::vector)",
            self.names.chunks(),
            self.id_type.cast()
        );
        sqlx::query(&sql)
            .bind(&chunk.doc_id)
            .bind(chunk.vector_clock)
            .bind(chunk.index)
            .bind(&chunk.chunk_hash)
            .bind(&chunk.text)
            .bind(&chunk.blob)
            .bind(&chunk.json)
            .bind(vector_literal(&chunk.embedding))
            .execute(conn)
            .await
            .context("Failed to insert chunk")?;
        Ok(())
    }

    pub async fn delete_hashes(
        &self,
        conn: &mut PgConnection,
        doc_id: &str,
        hashes: &[String],
    ) -> Result<u64> {
        if hashes.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM {} WHERE doc_id = $1{} AND chunk_hash = ANY($2)",
            self.names.chunks(),
            self.id_type.cast()
        );
        let result = sqlx::query(&sql)
            .bind(doc_id)
            .bind(hashes)
            .execute(conn)
            .await
            .context("Failed to delete stale chunks")?;
        Ok(result.rows_affected())
    }

    /// Bring every surviving chunk for the doc forward to the given clock.
    pub async fn advance_clock(
        &self,
        conn: &mut PgConnection,
        doc_id: &str,
        vector_clock: i64,
    ) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET vector_clock = $2 WHERE doc_id = $1{}",
            self.names.chunks(),
            self.id_type.cast()
        );
        let result = sqlx::query(&sql)
            .bind(doc_id)
            .bind(vector_clock)
            .execute(conn)
            .await
            .context("Failed to advance chunk clocks")?;
        Ok(result.rows_affected())
    }

    /// Delete chunk rows whose source row no longer exists.
    pub async fn delete_orphans(&self, conn: &mut PgConnection) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {chunks} c \
             WHERE NOT EXISTS (SELECT 1 FROM {source} t WHERE t.id = c.doc_id)",
            chunks = self.names.chunks(),
            source = self.names.source(),
        );
        let result = sqlx::query(&sql)
            .execute(conn)
            .await
            .context("Failed to delete orphaned chunks")?;
        Ok(result.rows_affected())
    }

    pub async fn for_doc(&self, pool: &DbPool, doc_id: &str) -> Result<Vec<ChunkRow>> {
        let sql = format!(
            "SELECT id, doc_id::text AS doc_id, vector_clock, \"index\", chunk_hash, text, blob, json \
             FROM {} WHERE doc_id = $1{} ORDER BY \"index\" ASC",
            self.names.chunks(),
            self.id_type.cast()
        );
        sqlx::query_as(&sql)
            .bind(doc_id)
            .fetch_all(pool)
            .await
            .context("Failed to fetch chunks for doc")
    }
}

pub struct SourceQueries<'a> {
    names: &'a PipelineNames,
    id_type: IdType,
}

impl<'a> SourceQueries<'a> {
    #[inline]
    pub fn new(names: &'a PipelineNames, id_type: IdType) -> Self {
        Self { names, id_type }
    }

    /// Load a source row as JSON, or None if it was deleted.
    pub async fn fetch_row(
        &self,
        pool: &DbPool,
        doc_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        let sql = format!(
            "SELECT to_jsonb(t) AS data FROM {} t WHERE t.id = $1{}",
            self.names.source(),
            self.id_type.cast()
        );
        sqlx::query_scalar(&sql)
            .bind(doc_id)
            .fetch_optional(pool)
            .await
            .context("Failed to load source row")
    }
}

const JOB_COLUMNS: &str = "id, doc_id::text AS doc_id, vector_clock, status, created_at, \
     processing_started_at, completed_at, worker_id, error, retry_count";

pub struct WorkQueueQueries<'a> {
    names: &'a PipelineNames,
    id_type: IdType,
}

impl<'a> WorkQueueQueries<'a> {
    #[inline]
    pub fn new(names: &'a PipelineNames, id_type: IdType) -> Self {
        Self { names, id_type }
    }

    /// Turn shadow/chunk divergence into pending jobs, most-stale first.
    /// The uniqueness constraint on `(doc_id, vector_clock)` makes this safe
    /// to run concurrently from many workers.
    pub async fn enqueue_outdated(&self, pool: &DbPool, limit: i64) -> Result<u64> {
        let sql = format!(
            "INSERT INTO {wq} (doc_id, vector_clock, status) \
             SELECT s.doc_id, s.vector_clock, 'pending' \
             FROM {shadow} s \
             LEFT JOIN ( \
                 SELECT doc_id, MAX(vector_clock) AS chunk_clock \
                 FROM {chunks} GROUP BY doc_id \
             ) c ON c.doc_id = s.doc_id \
             WHERE s.vector_clock > COALESCE(c.chunk_clock, 0) \
               AND NOT EXISTS ( \
                   SELECT 1 FROM {wq} q \
                   WHERE q.doc_id = s.doc_id AND q.vector_clock = s.vector_clock \
               ) \
             ORDER BY s.vector_clock - COALESCE(c.chunk_clock, 0) DESC, s.vector_clock ASC \
             LIMIT $1 \
             ON CONFLICT (doc_id, vector_clock) DO NOTHING",
            wq = self.names.work_queue(),
            shadow = self.names.shadow(),
            chunks = self.names.chunks(),
        );
        let result = sqlx::query(&sql)
            .bind(limit)
            .execute(pool)
            .await
            .context("Failed to enqueue outdated documents")?;
        Ok(result.rows_affected())
    }

    /// Atomically claim up to `limit` pending-or-stalled jobs. SKIP LOCKED
    /// plus the predicate re-check guarantee at most one owner per job.
    pub async fn claim(
        &self,
        pool: &DbPool,
        worker_id: &str,
        limit: i64,
        stalled_job_timeout_minutes: f64,
    ) -> Result<Vec<WorkQueueJob>> {
        let sql = format!(
            "UPDATE {wq} q \
             SET status = 'processing', processing_started_at = now(), worker_id = $1 \
             FROM ( \
                 SELECT id FROM {wq} \
                 WHERE status = 'pending' \
                    OR (status = 'processing' \
                        AND processing_started_at < now() - ($2::float8 * interval '1 minute')) \
                 ORDER BY created_at ASC \
                 LIMIT $3 \
                 FOR UPDATE SKIP LOCKED \
             ) candidates \
             WHERE q.id = candidates.id \
               AND (q.status = 'pending' \
                    OR (q.status = 'processing' \
                        AND q.processing_started_at < now() - ($2::float8 * interval '1 minute'))) \
             RETURNING q.id, q.doc_id::text AS doc_id, q.vector_clock, q.status, q.created_at, \
                       q.processing_started_at, q.completed_at, q.worker_id, q.error, q.retry_count",
            wq = self.names.work_queue(),
        );
        sqlx::query_as(&sql)
            .bind(worker_id)
            .bind(stalled_job_timeout_minutes)
            .bind(limit)
            .fetch_all(pool)
            .await
            .context("Failed to claim jobs")
    }

    pub async fn latest_clock_for_doc(&self, pool: &DbPool, doc_id: &str) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT vector_clock FROM {} WHERE doc_id = $1{} \
             ORDER BY vector_clock DESC LIMIT 1",
            self.names.work_queue(),
            self.id_type.cast()
        );
        sqlx::query_scalar(&sql)
            .bind(doc_id)
            .fetch_optional(pool)
            .await
            .context("Failed to read latest queued clock")
    }

    /// The atomic completion gate: completes the job only while the worker
    /// still owns it and the shadow clock still equals the job's clock.
    pub async fn complete_gate(
        &self,
        conn: &mut PgConnection,
        doc_id: &str,
        vector_clock: i64,
        worker_id: &str,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE {wq} \
             SET status = 'completed', completed_at = now(), error = NULL \
             WHERE doc_id = $1{cast} AND vector_clock = $2 AND worker_id = $3 \
               AND status = 'processing' \
               AND vector_clock = (SELECT vector_clock FROM {shadow} WHERE doc_id = $1{cast}) \
             RETURNING id",
            wq = self.names.work_queue(),
            shadow = self.names.shadow(),
            cast = self.id_type.cast(),
        );
        let completed: Option<i64> = sqlx::query_scalar(&sql)
            .bind(doc_id)
            .bind(vector_clock)
            .bind(worker_id)
            .fetch_optional(conn)
            .await
            .context("Failed to run completion gate")?;
        Ok(completed.is_some())
    }

    pub async fn mark_skipped(
        &self,
        pool: &DbPool,
        job_id: i64,
        worker_id: &str,
        reason: &str,
    ) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET status = 'skipped', error = $3 \
             WHERE id = $1 AND worker_id = $2 AND status = 'processing'",
            self.names.work_queue()
        );
        let result = sqlx::query(&sql)
            .bind(job_id)
            .bind(worker_id)
            .bind(reason)
            .execute(pool)
            .await
            .context("Failed to mark job skipped")?;
        Ok(result.rows_affected())
    }

    /// Release the lease and return the job to pending for another attempt.
    pub async fn release_for_retry(
        &self,
        pool: &DbPool,
        job_id: i64,
        worker_id: &str,
        error: &str,
    ) -> Result<u64> {
        let sql = format!(
            "UPDATE {} \
             SET status = 'pending', retry_count = retry_count + 1, error = $3, \
                 worker_id = NULL, processing_started_at = NULL \
             WHERE id = $1 AND worker_id = $2 AND status = 'processing'",
            self.names.work_queue()
        );
        let result = sqlx::query(&sql)
            .bind(job_id)
            .bind(worker_id)
            .bind(error)
            .execute(pool)
            .await
            .context("Failed to release job for retry")?;
        Ok(result.rows_affected())
    }

    pub async fn mark_failed(
        &self,
        pool: &DbPool,
        job_id: i64,
        worker_id: &str,
        error: &str,
    ) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET status = 'failed', error = $3 \
             WHERE id = $1 AND worker_id = $2 AND status = 'processing'",
            self.names.work_queue()
        );
        let result = sqlx::query(&sql)
            .bind(job_id)
            .bind(worker_id)
            .bind(error)
            .execute(pool)
            .await
            .context("Failed to mark job failed")?;
        Ok(result.rows_affected())
    }

    pub async fn count_pending(&self, pool: &DbPool) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE status = 'pending'",
            self.names.work_queue()
        );
        sqlx::query_scalar(&sql)
            .fetch_one(pool)
            .await
            .context("Failed to count pending jobs")
    }

    pub async fn stats(&self, pool: &DbPool) -> Result<QueueStats> {
        let sql = format!(
            "SELECT \
                 COUNT(*) FILTER (WHERE status = 'pending') AS pending, \
                 COUNT(*) FILTER (WHERE status = 'processing') AS processing, \
                 COUNT(*) FILTER (WHERE status = 'completed') AS completed, \
                 COUNT(*) FILTER (WHERE status = 'failed') AS failed, \
                 COUNT(*) FILTER (WHERE status = 'skipped') AS skipped, \
                 COUNT(*) AS total, \
                 EXTRACT(EPOCH FROM now() - MIN(created_at) FILTER (WHERE status = 'pending'))::bigint \
                     AS oldest_pending_age_seconds \
             FROM {}",
            self.names.work_queue()
        );
        let row = sqlx::query(&sql)
            .fetch_one(pool)
            .await
            .context("Failed to read queue statistics")?;

        Ok(QueueStats {
            pending: row.get("pending"),
            processing: row.get("processing"),
            completed: row.get("completed"),
            failed: row.get("failed"),
            skipped: row.get("skipped"),
            total: row.get("total"),
            oldest_pending_age_seconds: row.get("oldest_pending_age_seconds"),
        })
    }

    /// Delete terminal jobs older than the cutoff; retains recent history.
    pub async fn cleanup_terminal(&self, pool: &DbPool, older_than_seconds: f64) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} \
             WHERE status IN ('completed', 'failed', 'skipped') \
               AND created_at < now() - ($1::float8 * interval '1 second')",
            self.names.work_queue()
        );
        let result = sqlx::query(&sql)
            .bind(older_than_seconds)
            .execute(pool)
            .await
            .context("Failed to clean up terminal jobs")?;
        Ok(result.rows_affected())
    }

    pub async fn truncate(&self, conn: &mut PgConnection) -> Result<()> {
        let sql = format!("TRUNCATE {}", self.names.work_queue());
        sqlx::query(&sql)
            .execute(conn)
            .await
            .context("Failed to truncate work queue")?;
        Ok(())
    }

    /// Seed a pending job directly; normal operation goes through
    /// `enqueue_outdated`.
    pub async fn insert_pending(
        &self,
        pool: &DbPool,
        doc_id: &str,
        vector_clock: i64,
    ) -> Result<u64> {
        let sql = format!(
            "INSERT INTO {} (doc_id, vector_clock, status) VALUES ($1{}, $2, 'pending') \
             ON CONFLICT (doc_id, vector_clock) DO NOTHING",
            self.names.work_queue(),
            self.id_type.cast()
        );
        let result = sqlx::query(&sql)
            .bind(doc_id)
            .bind(vector_clock)
            .execute(pool)
            .await
            .context("Failed to insert pending job")?;
        Ok(result.rows_affected())
    }

    pub async fn get_by_id(&self, pool: &DbPool, job_id: i64) -> Result<Option<WorkQueueJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {} WHERE id = $1",
            self.names.work_queue()
        );
        sqlx::query_as(&sql)
            .bind(job_id)
            .fetch_optional(pool)
            .await
            .context("Failed to get job by id")
    }

    pub async fn jobs_for_doc(&self, pool: &DbPool, doc_id: &str) -> Result<Vec<WorkQueueJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {} WHERE doc_id = $1{} ORDER BY vector_clock ASC",
            self.names.work_queue(),
            self.id_type.cast()
        );
        sqlx::query_as(&sql)
            .bind(doc_id)
            .fetch_all(pool)
            .await
            .context("Failed to list jobs for doc")
    }
}
