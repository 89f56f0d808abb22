// Pipeline handle module
// Public lifecycle and admin surface plus the per-process handle registry

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use once_cell::sync::Lazy;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{PipelineConfig, WorkerConfig};
use crate::database::Database;
use crate::database::models::QueueStats;
use crate::database::names::PipelineNames;
use crate::database::queries::{ConfigQueries, ShadowQueries, WorkQueueQueries};
use crate::installer::Installer;
use crate::worker::{PipelineCallbacks, Worker};
use crate::{RagmaticError, Result};

/// Handles already created in this process, keyed by pipeline name.
/// Requesting the same name again returns the same handle.
static REGISTRY: Lazy<Mutex<HashMap<String, Pipeline>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Install a pipeline and return its handle. Re-creating an existing name is
/// idempotent: the installer is a no-op for valid data and within one
/// process the cached handle is returned.
pub async fn create(
    database_url: &str,
    config: PipelineConfig,
    worker_config: WorkerConfig,
    callbacks: PipelineCallbacks,
) -> Result<Pipeline> {
    config
        .validate()
        .map_err(|e| RagmaticError::Config(e.to_string()))?;
    worker_config
        .validate()
        .map_err(|e| RagmaticError::Config(e.to_string()))?;

    if let Some(existing) = REGISTRY
        .lock()
        .expect("pipeline registry poisoned")
        .get(&config.name)
    {
        debug!(pipeline = %config.name, "returning cached pipeline handle");
        return Ok(existing.clone());
    }

    let database = Database::connect(database_url).await?;
    Installer::new(&database, &config)
        .install()
        .await
        .map_err(|e| RagmaticError::Installer(format!("{e:#}")))?;

    let names = PipelineNames::new(&config);
    let worker = Arc::new(Worker::new(
        database.clone(),
        &config,
        worker_config,
        callbacks,
    ));

    let pipeline = Pipeline {
        inner: Arc::new(PipelineInner {
            database,
            config,
            names,
            worker,
            state: tokio::sync::Mutex::new(LifecycleState::default()),
        }),
    };

    let mut registry = REGISTRY.lock().expect("pipeline registry poisoned");
    let entry = registry
        .entry(pipeline.name().to_string())
        .or_insert_with(|| pipeline.clone());
    Ok(entry.clone())
}

/// A named, isolated instance of the engine tied to one source table.
/// Cheap to clone; clones share lifecycle state.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    database: Database,
    config: PipelineConfig,
    names: PipelineNames,
    worker: Arc<Worker>,
    state: tokio::sync::Mutex<LifecycleState>,
}

#[derive(Default)]
struct LifecycleState {
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    #[inline]
    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    #[inline]
    pub fn database(&self) -> &Database {
        &self.inner.database
    }

    /// The worker backing this handle; exposed so hosts can drive ticks
    /// manually instead of running the polling loops.
    #[inline]
    pub fn worker(&self) -> &Arc<Worker> {
        &self.inner.worker
    }

    /// Start the enqueue and process loops. Fails fast if the pipeline
    /// schema or its config manifest is missing.
    pub async fn start(&self) -> Result<()> {
        let stored = ConfigQueries::new(&self.inner.names)
            .fetch(self.inner.database.pool())
            .await
            .map_err(|e| {
                RagmaticError::Database(format!(
                    "pipeline schema unreadable (was the pipeline installed?): {e:#}"
                ))
            })?;
        if stored.is_empty() {
            return Err(RagmaticError::Config(
                "pipeline config missing; run create() first".to_string(),
            ));
        }
        if let Some(dimension) = stored.get("embedding_dimension") {
            if *dimension != self.inner.config.embedding_dimension.to_string() {
                return Err(RagmaticError::Config(format!(
                    "stored embedding dimension {dimension} does not match configured {}",
                    self.inner.config.embedding_dimension
                )));
            }
        }

        let mut state = self.inner.state.lock().await;
        if state.shutdown.is_some() {
            debug!(pipeline = %self.name(), "pipeline already running");
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        state.tasks.push(tokio::spawn(
            Arc::clone(&self.inner.worker).run_enqueue_loop(shutdown_rx.clone()),
        ));
        state.tasks.push(tokio::spawn(
            Arc::clone(&self.inner.worker).run_process_loop(shutdown_rx),
        ));
        state.shutdown = Some(shutdown_tx);

        info!(
            pipeline = %self.name(),
            worker_id = %self.inner.worker.id(),
            "pipeline started"
        );
        Ok(())
    }

    /// Cancel the loop timers and await the in-flight ticks.
    pub async fn pause(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let Some(shutdown) = state.shutdown.take() else {
            return Ok(());
        };
        let _ = shutdown.send(true);
        for task in state.tasks.drain(..) {
            if let Err(error) = task.await {
                warn!(pipeline = %self.name(), error = %error, "worker loop panicked");
            }
        }
        info!(pipeline = %self.name(), "pipeline paused");
        Ok(())
    }

    /// Pause, then close the connection pool. The handle is unusable after.
    pub async fn stop(&self) -> Result<()> {
        self.pause().await?;
        self.inner.database.close().await;
        info!(pipeline = %self.name(), "pipeline stopped");
        Ok(())
    }

    /// Bump every shadow clock (inserting clock=1 rows for any missing) so
    /// workers re-enqueue every document. Returns the number of documents
    /// scheduled.
    pub async fn reprocess_all(&self) -> Result<u64> {
        let shadow = ShadowQueries::new(&self.inner.names, self.inner.config.id_type);
        let mut tx = self.inner.database.begin_transaction().await?;
        let bumped = shadow.bump_all(&mut tx).await?;
        let backfilled = shadow.backfill_missing(&mut tx).await?;
        tx.commit()
            .await
            .context("Failed to commit reprocess-all")?;

        info!(
            pipeline = %self.name(),
            bumped,
            backfilled,
            "scheduled full reprocess"
        );
        Ok(bumped + backfilled)
    }

    /// Number of pending jobs in the work queue.
    pub async fn count_remaining_documents(&self) -> Result<i64> {
        let count = WorkQueueQueries::new(&self.inner.names, self.inner.config.id_type)
            .count_pending(self.inner.database.pool())
            .await?;
        Ok(count)
    }

    /// Per-status queue counts for monitoring.
    pub async fn stats(&self) -> Result<QueueStats> {
        let stats = WorkQueueQueries::new(&self.inner.names, self.inner.config.id_type)
            .stats(self.inner.database.pool())
            .await?;
        Ok(stats)
    }

    /// Delete terminal queue rows older than the cutoff. Retained history is
    /// what preserves monotonicity, so only prune ages you no longer need
    /// for audit.
    pub async fn cleanup_queue(&self, older_than: Duration) -> Result<u64> {
        let deleted = WorkQueueQueries::new(&self.inner.names, self.inner.config.id_type)
            .cleanup_terminal(self.inner.database.pool(), older_than.as_secs_f64())
            .await?;
        if deleted > 0 {
            info!(pipeline = %self.name(), deleted, "cleaned up old queue rows");
        }
        Ok(deleted)
    }

    /// The stored config manifest, the authoritative description of the
    /// pipeline's persisted layout.
    pub async fn stored_config(&self) -> Result<BTreeMap<String, String>> {
        let stored = ConfigQueries::new(&self.inner.names)
            .fetch(self.inner.database.pool())
            .await?;
        Ok(stored)
    }

    /// Drop the source trigger and the whole pipeline namespace, and evict
    /// this handle from the registry.
    pub async fn destroy(&self) -> Result<()> {
        self.pause().await?;
        Installer::new(&self.inner.database, &self.inner.config)
            .destroy()
            .await
            .map_err(|e| RagmaticError::Installer(format!("{e:#}")))?;
        REGISTRY
            .lock()
            .expect("pipeline registry poisoned")
            .remove(self.name());
        Ok(())
    }
}
