// Installer module
// Provisions a pipeline namespace idempotently and attaches the source trigger


use anyhow::{Context, Result};
use sqlx::postgres::PgConnection;
use tracing::{debug, info, warn};

use crate::config::{PipelineConfig, SCHEMA_VERSION};
use crate::database::Database;
use crate::database::names::{PipelineNames, quote_identifier};
use crate::database::queries::{ChunkQueries, ConfigQueries, ShadowQueries, WorkQueueQueries};

pub struct Installer<'a> {
    database: &'a Database,
    config: &'a PipelineConfig,
    names: PipelineNames,
}

impl<'a> Installer<'a> {
    #[inline]
    pub fn new(database: &'a Database, config: &'a PipelineConfig) -> Self {
        Self {
            database,
            config,
            names: PipelineNames::new(config),
        }
    }

    /// Provision the namespace, tables, indexes and trigger, write the config
    /// manifest, and reconcile leftovers from a dropped source table. The
    /// whole pass runs in one transaction; re-running with identical config
    /// is a no-op for valid data.
    pub async fn install(&self) -> Result<()> {
        let mut tx = self.database.begin_transaction().await?;

        for statement in ddl_statements(&self.names, self.config) {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to run install DDL: {statement}"))?;
        }

        ConfigQueries::new(&self.names)
            .upsert(&mut tx, &config_entries(&self.names, self.config))
            .await?;

        self.reconcile(&mut tx).await?;

        tx.commit().await.context("Failed to commit install")?;

        // Event triggers need elevated privileges; missing them is not fatal.
        self.install_drop_hook().await;

        info!(
            pipeline = %self.config.name,
            schema = %self.names.schema(),
            "pipeline installed"
        );
        Ok(())
    }

    /// Tolerate a prior drop+recreate of the source table: purge shadow and
    /// chunk rows whose doc is gone, and if any were found, flush the queue
    /// so stale clocks cannot outrank the recreated rows. Then backfill
    /// shadow rows for source rows that lack one.
    async fn reconcile(&self, conn: &mut PgConnection) -> Result<()> {
        let shadow_queries = ShadowQueries::new(&self.names, self.config.id_type);
        let chunk_queries = ChunkQueries::new(&self.names, self.config.id_type);

        let shadow_orphans = shadow_queries.delete_orphans(&mut *conn).await?;
        let chunk_orphans = chunk_queries.delete_orphans(&mut *conn).await?;
        if shadow_orphans > 0 || chunk_orphans > 0 {
            warn!(
                shadow_orphans,
                chunk_orphans, "orphaned rows found; clearing work queue"
            );
            WorkQueueQueries::new(&self.names, self.config.id_type)
                .truncate(&mut *conn)
                .await?;
        }

        let backfilled = shadow_queries.backfill_missing(&mut *conn).await?;
        if backfilled > 0 {
            info!(backfilled, "backfilled shadow rows for existing documents");
        }
        Ok(())
    }

    /// Register a DDL event trigger that drops the pipeline namespace when
    /// the source table itself is dropped. Best-effort: event triggers
    /// require elevated privileges, so failure is only a warning.
    async fn install_drop_hook(&self) {
        for statement in drop_hook_statements(&self.names) {
            if let Err(error) = sqlx::query(&statement)
                .execute(self.database.pool())
                .await
            {
                warn!(
                    error = %error,
                    "could not register source drop hook; continuing without it"
                );
                return;
            }
        }
        debug!(event_trigger = %self.names.event_trigger(), "source drop hook registered");
    }

    /// Drop the source trigger and the whole pipeline namespace.
    pub async fn destroy(&self) -> Result<()> {
        let drop_trigger = format!(
            "DROP TRIGGER IF EXISTS {} ON {}",
            quote_identifier(&self.names.trigger()),
            self.names.source()
        );
        if let Err(error) = sqlx::query(&drop_trigger)
            .execute(self.database.pool())
            .await
        {
            // The source table may already be gone.
            debug!(error = %error, "source trigger not dropped");
        }

        let drop_hook = format!(
            "DROP EVENT TRIGGER IF EXISTS {}",
            quote_identifier(&self.names.event_trigger())
        );
        if let Err(error) = sqlx::query(&drop_hook).execute(self.database.pool()).await {
            warn!(error = %error, "could not drop source drop hook");
        }

        let drop_schema = format!(
            "DROP SCHEMA IF EXISTS {} CASCADE",
            quote_identifier(self.names.schema())
        );
        sqlx::query(&drop_schema)
            .execute(self.database.pool())
            .await
            .context("Failed to drop pipeline schema")?;

        info!(pipeline = %self.config.name, "pipeline destroyed");
        Ok(())
    }
}

/// Escape a string for embedding into a SQL single-quoted literal.
fn quote_literal(value: &str) -> String {
    value.replace('\'', "''")
}

fn config_entries(names: &PipelineNames, config: &PipelineConfig) -> Vec<(&'static str, String)> {
    vec![
        ("source_schema", names.source_schema().to_string()),
        ("source_table", names.source_table().to_string()),
        ("id_type", config.id_type.to_string()),
        (
            "embedding_dimension",
            config.embedding_dimension.to_string(),
        ),
        ("shadow_table", names.shadow_table().to_string()),
        ("chunks_table", names.chunks_table().to_string()),
        ("schema_version", SCHEMA_VERSION.to_string()),
    ]
}

fn ddl_statements(names: &PipelineNames, config: &PipelineConfig) -> Vec<String> {
    let schema = quote_identifier(names.schema());
    let source = names.source();
    let shadow = names.shadow();
    let chunks = names.chunks();
    let work_queue = names.work_queue();
    let id_type = config.id_type.sql_type();
    let dimension = config.embedding_dimension;

    let mut statements = vec![
        "CREATE EXTENSION IF NOT EXISTS vector".to_string(),
        format!("CREATE SCHEMA IF NOT EXISTS {schema}"),
        format!(
            "CREATE TABLE IF NOT EXISTS {config_table} ( \
                 key TEXT PRIMARY KEY, \
                 value TEXT NOT NULL \
             )",
            config_table = names.config()
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {shadow} ( \
                 id BIGSERIAL PRIMARY KEY, \
                 doc_id {id_type} NOT NULL UNIQUE \
                     REFERENCES {source} (id) ON DELETE CASCADE \
                     DEFERRABLE INITIALLY DEFERRED, \
                 vector_clock BIGINT NOT NULL DEFAULT 1 \
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {chunks} ( \
                 id BIGSERIAL PRIMARY KEY, \
                 doc_id {id_type} NOT NULL \
                     REFERENCES {source} (id) ON DELETE CASCADE, \
                 vector_clock BIGINT NOT NULL, \
                 \"index\" INT NOT NULL, \
                 chunk_hash TEXT NOT NULL, \
                 text TEXT, \
                 blob BYTEA, \
                 json JSONB, \
                 embedding vector({dimension}) NOT NULL \
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {work_queue} ( \
                 id BIGSERIAL PRIMARY KEY, \
                 doc_id {id_type} NOT NULL, \
                 vector_clock BIGINT NOT NULL, \
                 status TEXT NOT NULL DEFAULT 'pending', \
                 created_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
                 processing_started_at TIMESTAMPTZ, \
                 completed_at TIMESTAMPTZ, \
                 worker_id TEXT, \
                 error TEXT, \
                 retry_count INT NOT NULL DEFAULT 0, \
                 UNIQUE (doc_id, vector_clock) \
             )"
        ),
    ];

    let index = |table: &str, suffix: &str, target: &str, columns: &str| {
        format!(
            "CREATE INDEX IF NOT EXISTS {name} ON {target}{columns}",
            name = quote_identifier(&format!("idx_{table}_{suffix}")),
        )
    };

    let shadow_table = names.shadow_table();
    let chunks_table = names.chunks_table();
    statements.push(index(
        shadow_table,
        "vector_clock",
        &shadow,
        " (vector_clock)",
    ));
    statements.push(index(chunks_table, "doc_id", &chunks, " (doc_id)"));
    statements.push(index(chunks_table, "chunk_hash", &chunks, " (chunk_hash)"));
    statements.push(index(
        chunks_table,
        "vector_clock",
        &chunks,
        " (vector_clock)",
    ));
    statements.push(index(
        chunks_table,
        "doc_id_vector_clock",
        &chunks,
        " (doc_id, vector_clock)",
    ));
    statements.push(index(
        chunks_table,
        "doc_id_index",
        &chunks,
        " (doc_id, \"index\")",
    ));
    statements.push(index("work_queue", "status", &work_queue, " (status)"));
    statements.push(index("work_queue", "doc_id", &work_queue, " (doc_id)"));
    statements.push(index(
        "work_queue",
        "vector_clock",
        &work_queue,
        " (vector_clock)",
    ));
    statements.push(index(
        "work_queue",
        "status_processing_started_at",
        &work_queue,
        " (status, processing_started_at)",
    ));
    statements.push(index(
        "work_queue",
        "doc_id_vector_clock",
        &work_queue,
        " (doc_id, vector_clock DESC)",
    ));

    if !config.skip_embedding_index_setup {
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS {name} ON {chunks} \
             USING ivfflat (embedding vector_cosine_ops) WITH (lists = 100)",
            name = quote_identifier(&format!("idx_{chunks_table}_embedding_cosine")),
        ));
    }

    statements.push(format!(
        "CREATE OR REPLACE FUNCTION {function}() RETURNS trigger \
         LANGUAGE plpgsql AS $trigger$ \
         BEGIN \
             IF TG_OP = 'INSERT' THEN \
                 INSERT INTO {shadow} (doc_id, vector_clock) VALUES (NEW.id, 1) \
                 ON CONFLICT (doc_id) DO NOTHING; \
             ELSIF TG_OP = 'UPDATE' THEN \
                 UPDATE {shadow} SET vector_clock = vector_clock + 1 WHERE doc_id = NEW.id; \
             END IF; \
             RETURN NEW; \
         END; \
         $trigger$",
        function = names.trigger_function(),
    ));
    statements.push(format!(
        "DROP TRIGGER IF EXISTS {trigger} ON {source}",
        trigger = quote_identifier(&names.trigger()),
    ));
    statements.push(format!(
        "CREATE TRIGGER {trigger} AFTER INSERT OR UPDATE ON {source} \
         FOR EACH ROW EXECUTE FUNCTION {function}()",
        trigger = quote_identifier(&names.trigger()),
        function = names.trigger_function(),
    ));

    statements
}

fn drop_hook_statements(names: &PipelineNames) -> Vec<String> {
    let event_trigger = quote_identifier(&names.event_trigger());
    let function = names.event_trigger_function();

    vec![
        format!(
            "CREATE OR REPLACE FUNCTION {function}() RETURNS event_trigger \
             LANGUAGE plpgsql AS $hook$ \
             DECLARE \
                 obj record; \
             BEGIN \
                 FOR obj IN SELECT * FROM pg_event_trigger_dropped_objects() LOOP \
                     IF obj.object_type = 'table' \
                        AND obj.schema_name = '{source_schema}' \
                        AND obj.object_name = '{source_table}' THEN \
                         EXECUTE 'DROP SCHEMA IF EXISTS {schema} CASCADE'; \
                     END IF; \
                 END LOOP; \
             END; \
             $hook$",
            source_schema = quote_literal(names.source_schema()),
            source_table = quote_literal(names.source_table()),
            schema = quote_identifier(names.schema()),
        ),
        format!("DROP EVENT TRIGGER IF EXISTS {event_trigger}"),
        format!("CREATE EVENT TRIGGER {event_trigger} ON sql_drop EXECUTE FUNCTION {function}()"),
    ]
}
