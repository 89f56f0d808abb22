use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use tracing::debug;

pub mod models;
pub mod names;
pub mod queries;

pub use models::*;
pub use names::PipelineNames;
pub use queries::*;

pub type DbPool = Pool<Postgres>;

#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    #[inline]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("Failed to create database connection pool")?;

        debug!("Database connection pool established");
        Ok(Self { pool })
    }

    /// Wrap an existing pool, e.g. one shared with the host application.
    #[inline]
    pub fn from_pool(pool: DbPool) -> Self {
        Self { pool }
    }

    #[inline]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    #[inline]
    pub async fn begin_transaction(&self) -> Result<sqlx::Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .context("Failed to begin database transaction")
    }

    #[inline]
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
