#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

//! Integration tests for pipeline install, trigger fidelity and admin ops.
//!
//! Requirements for running these tests:
//! - A Postgres server with the pgvector extension available
//! - `RAGMATIC_TEST_DATABASE_URL` pointing at a database the tests may
//!   create tables and schemas in
//!
//! Without the env var the tests skip themselves.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use ragmatic::chunking::{Chunk, Chunker, SourceRow};
use ragmatic::config::{IdType, PipelineConfig, WorkerConfig};
use ragmatic::database::names::PipelineNames;
use ragmatic::database::queries::{ChunkQueries, ShadowQueries, WorkQueueQueries};
use ragmatic::database::{Database, JobStatus};
use ragmatic::embeddings::{EmbeddedChunk, Embedder};
use ragmatic::worker::PipelineCallbacks;
use ragmatic::{Pipeline, RagmaticError};

const ENV_DATABASE_URL: &str = "RAGMATIC_TEST_DATABASE_URL";
const DIMENSION: u32 = 4;

macro_rules! require_database_url {
    () => {
        match std::env::var(ENV_DATABASE_URL) {
            Ok(url) => url,
            Err(_) => {
                eprintln!("skipping: {ENV_DATABASE_URL} not set");
                return Ok(());
            }
        }
    };
}

/// Splits the `content` column on whitespace, one text chunk per word.
struct WhitespaceChunker;

#[async_trait]
impl Chunker for WhitespaceChunker {
    async fn chunk(&self, row: &SourceRow) -> Result<Vec<Chunk>> {
        let content = row.column_str("content").unwrap_or_default();
        Ok(content.split_whitespace().map(Chunk::text).collect())
    }
}

/// Returns `[text_len, 0, 0, 0]` for every chunk.
struct LengthEmbedder;

#[async_trait]
impl Embedder for LengthEmbedder {
    async fn embed(&self, chunk: &Chunk, _index: usize) -> Result<EmbeddedChunk> {
        let mut embedding = vec![0.0f32; DIMENSION as usize];
        embedding[0] = chunk.text_column().map_or(0, str::len) as f32;
        Ok(EmbeddedChunk::new(embedding))
    }
}

fn test_callbacks() -> PipelineCallbacks {
    PipelineCallbacks::new(Arc::new(WhitespaceChunker), Arc::new(LengthEmbedder))
}

fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        polling_interval_ms: 50,
        initial_retry_delay_ms: 1,
        ..WorkerConfig::default()
    }
}

/// Drop and recreate the source table plus any leftover pipeline schema
/// from a previous run.
async fn fresh_fixture(url: &str, name: &str, table: &str) -> Result<Database> {
    let database = Database::connect(url).await?;
    sqlx::query(&format!("DROP SCHEMA IF EXISTS \"ragmatic_{name}\" CASCADE"))
        .execute(database.pool())
        .await?;
    sqlx::query(&format!("DROP TABLE IF EXISTS \"{table}\" CASCADE"))
        .execute(database.pool())
        .await?;
    sqlx::query(&format!(
        "CREATE TABLE \"{table}\" (id INT PRIMARY KEY, content TEXT)"
    ))
    .execute(database.pool())
    .await?;
    Ok(database)
}

async fn create_pipeline(url: &str, name: &str, table: &str) -> Result<Pipeline> {
    let config = PipelineConfig::new(name, table, DIMENSION);
    let pipeline =
        ragmatic::create(url, config, fast_worker_config(), test_callbacks()).await?;
    Ok(pipeline)
}

async fn insert_doc(database: &Database, table: &str, id: i32, content: &str) -> Result<()> {
    sqlx::query(&format!(
        "INSERT INTO \"{table}\" (id, content) VALUES ($1, $2)"
    ))
    .bind(id)
    .bind(content)
    .execute(database.pool())
    .await?;
    Ok(())
}

async fn update_doc(database: &Database, table: &str, id: i32, content: &str) -> Result<()> {
    sqlx::query(&format!("UPDATE \"{table}\" SET content = $2 WHERE id = $1"))
        .bind(id)
        .bind(content)
        .execute(database.pool())
        .await?;
    Ok(())
}

async fn run_ticks(pipeline: &Pipeline) -> Result<usize> {
    pipeline.worker().enqueue_tick().await?;
    let processed = pipeline.worker().process_tick().await?;
    Ok(processed)
}

#[tokio::test]
async fn integration_install_is_idempotent() -> Result<()> {
    let url = require_database_url!();
    let database = fresh_fixture(&url, "install_twice", "rag_it_install_twice").await?;

    let pipeline = create_pipeline(&url, "install_twice", "rag_it_install_twice").await?;

    // All four namespace tables exist.
    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT table_name FROM information_schema.tables \
         WHERE table_schema = 'ragmatic_install_twice' ORDER BY table_name",
    )
    .fetch_all(database.pool())
    .await?;
    assert_eq!(tables, ["chunks", "config", "shadows", "work_queue"]);

    // Produce chunks, then re-run the installer; valid chunks must survive.
    insert_doc(&database, "rag_it_install_twice", 1, "a b").await?;
    run_ticks(&pipeline).await?;

    let installer =
        ragmatic::installer::Installer::new(pipeline.database(), pipeline.config());
    installer.install().await?;

    let names = PipelineNames::new(pipeline.config());
    let chunks = ChunkQueries::new(&names, IdType::Int)
        .for_doc(pipeline.database().pool(), "1")
        .await?;
    assert_eq!(chunks.len(), 2);

    // Re-creating the same name returns the cached handle.
    let again = create_pipeline(&url, "install_twice", "rag_it_install_twice").await?;
    assert_eq!(again.name(), pipeline.name());

    pipeline.destroy().await?;
    Ok(())
}

#[tokio::test]
async fn integration_trigger_tracks_source_mutations() -> Result<()> {
    let url = require_database_url!();
    let database = fresh_fixture(&url, "trigger_fidelity", "rag_it_trigger").await?;
    let pipeline = create_pipeline(&url, "trigger_fidelity", "rag_it_trigger").await?;

    insert_doc(&database, "rag_it_trigger", 1, "one").await?;
    insert_doc(&database, "rag_it_trigger", 2, "two").await?;
    update_doc(&database, "rag_it_trigger", 1, "one updated").await?;
    update_doc(&database, "rag_it_trigger", 1, "one updated again").await?;

    let names = PipelineNames::new(pipeline.config());
    let shadow = ShadowQueries::new(&names, IdType::Int);

    assert_eq!(shadow.fetch_all(database.pool()).await?.len(), 2);

    // clock = 1 + number of updates
    assert_eq!(shadow.clock_for_doc(database.pool(), "1").await?, Some(3));
    assert_eq!(shadow.clock_for_doc(database.pool(), "2").await?, Some(1));

    sqlx::query("DELETE FROM \"rag_it_trigger\" WHERE id = 2")
        .execute(database.pool())
        .await?;
    assert_eq!(shadow.clock_for_doc(database.pool(), "2").await?, None);

    pipeline.destroy().await?;
    Ok(())
}

#[tokio::test]
async fn integration_enqueue_deduplicates() -> Result<()> {
    let url = require_database_url!();
    let database = fresh_fixture(&url, "enqueue_dedup", "rag_it_enqueue").await?;
    let pipeline = create_pipeline(&url, "enqueue_dedup", "rag_it_enqueue").await?;

    insert_doc(&database, "rag_it_enqueue", 1, "alpha").await?;
    insert_doc(&database, "rag_it_enqueue", 2, "beta").await?;

    let enqueued = pipeline.worker().enqueue_tick().await?;
    assert_eq!(enqueued, 2);

    // Same divergence, nothing new to enqueue.
    let enqueued = pipeline.worker().enqueue_tick().await?;
    assert_eq!(enqueued, 0);

    // The uniqueness constraint rejects explicit duplicates too.
    let names = PipelineNames::new(pipeline.config());
    let queue = WorkQueueQueries::new(&names, IdType::Int);
    let inserted = queue.insert_pending(database.pool(), "1", 1).await?;
    assert_eq!(inserted, 0);

    assert_eq!(pipeline.count_remaining_documents().await?, 2);

    pipeline.destroy().await?;
    Ok(())
}

#[tokio::test]
async fn integration_admin_operations() -> Result<()> {
    let url = require_database_url!();
    let database = fresh_fixture(&url, "admin_ops", "rag_it_admin").await?;
    let pipeline = create_pipeline(&url, "admin_ops", "rag_it_admin").await?;

    insert_doc(&database, "rag_it_admin", 1, "hello world").await?;
    run_ticks(&pipeline).await?;

    let stored = pipeline.stored_config().await?;
    assert_eq!(stored.get("source_table").map(String::as_str), Some("rag_it_admin"));
    assert_eq!(stored.get("embedding_dimension").map(String::as_str), Some("4"));
    assert_eq!(stored.get("id_type").map(String::as_str), Some("int"));
    assert_eq!(stored.get("schema_version").map(String::as_str), Some("1"));

    let stats = pipeline.stats().await?;
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.total, 1);

    // reprocess_all bumps every clock, so the next tick re-enqueues.
    let scheduled = pipeline.reprocess_all().await?;
    assert_eq!(scheduled, 1);
    assert_eq!(run_ticks(&pipeline).await?, 1);

    let names = PipelineNames::new(pipeline.config());
    let chunks = ChunkQueries::new(&names, IdType::Int)
        .for_doc(database.pool(), "1")
        .await?;
    assert!(chunks.iter().all(|c| c.vector_clock == 2));

    // Terminal rows can be pruned.
    let stats = pipeline.stats().await?;
    assert_eq!(stats.completed, 2);
    let deleted = pipeline.cleanup_queue(Duration::ZERO).await?;
    assert_eq!(deleted, 2);
    assert_eq!(pipeline.stats().await?.total, 0);

    pipeline.destroy().await?;
    Ok(())
}

#[tokio::test]
async fn integration_polling_loops_process_documents() -> Result<()> {
    let url = require_database_url!();
    let database = fresh_fixture(&url, "polling_loops", "rag_it_polling").await?;
    let pipeline = create_pipeline(&url, "polling_loops", "rag_it_polling").await?;

    pipeline.start().await?;
    // Starting twice is a no-op.
    pipeline.start().await?;

    insert_doc(&database, "rag_it_polling", 1, "a b c").await?;

    let names = PipelineNames::new(pipeline.config());
    let chunk_queries = ChunkQueries::new(&names, IdType::Int);
    let mut chunks = Vec::new();
    for _ in 0..100 {
        chunks = chunk_queries.for_doc(database.pool(), "1").await?;
        if chunks.len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(chunks.len(), 3, "polling loops should have produced chunks");

    pipeline.pause().await?;
    pipeline.destroy().await?;
    pipeline.stop().await?;
    Ok(())
}

#[tokio::test]
async fn integration_destroy_removes_namespace_and_trigger() -> Result<()> {
    let url = require_database_url!();
    let database = fresh_fixture(&url, "destroy_me", "rag_it_destroy").await?;
    let pipeline = create_pipeline(&url, "destroy_me", "rag_it_destroy").await?;

    insert_doc(&database, "rag_it_destroy", 1, "ephemeral").await?;
    run_ticks(&pipeline).await?;

    pipeline.destroy().await?;

    let schema: Option<String> = sqlx::query_scalar(
        "SELECT schema_name FROM information_schema.schemata WHERE schema_name = $1",
    )
    .bind("ragmatic_destroy_me")
    .fetch_optional(database.pool())
    .await?;
    assert!(schema.is_none());

    let trigger: Option<String> = sqlx::query_scalar(
        "SELECT tgname FROM pg_trigger WHERE tgname = $1",
    )
    .bind("ragmatic_destroy_me_shadow_sync")
    .fetch_optional(database.pool())
    .await?;
    assert!(trigger.is_none());

    // The source table is external and must survive.
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM \"rag_it_destroy\"")
        .fetch_one(database.pool())
        .await?;
    assert_eq!(count, 1);

    // A destroyed pipeline refuses to start.
    let result = pipeline.start().await;
    assert!(matches!(
        result,
        Err(RagmaticError::Database(_)) | Err(RagmaticError::Config(_))
    ));

    Ok(())
}

#[tokio::test]
async fn integration_text_id_pipeline() -> Result<()> {
    let url = require_database_url!();
    let database = Database::connect(&url).await?;
    sqlx::query("DROP SCHEMA IF EXISTS \"ragmatic_text_ids\" CASCADE")
        .execute(database.pool())
        .await?;
    sqlx::query("DROP TABLE IF EXISTS \"rag_it_text_ids\" CASCADE")
        .execute(database.pool())
        .await?;
    sqlx::query("CREATE TABLE \"rag_it_text_ids\" (id TEXT PRIMARY KEY, content TEXT)")
        .execute(database.pool())
        .await?;

    let config = PipelineConfig::new("text_ids", "rag_it_text_ids", DIMENSION)
        .with_id_type(IdType::Text);
    let pipeline =
        ragmatic::create(&url, config, fast_worker_config(), test_callbacks()).await?;

    sqlx::query("INSERT INTO \"rag_it_text_ids\" (id, content) VALUES ('doc-a', 'x y')")
        .execute(database.pool())
        .await?;
    run_ticks(&pipeline).await?;

    let names = PipelineNames::new(pipeline.config());
    let chunks = ChunkQueries::new(&names, IdType::Text)
        .for_doc(database.pool(), "doc-a")
        .await?;
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].doc_id, "doc-a");

    let jobs = WorkQueueQueries::new(&names, IdType::Text)
        .jobs_for_doc(database.pool(), "doc-a")
        .await?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Completed);

    pipeline.destroy().await?;
    Ok(())
}
