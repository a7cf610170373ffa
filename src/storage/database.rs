//! PostgreSQL control-plane connection handling.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::debug;

use crate::config::PgConfig;
use crate::error::StoreError;

use super::migrations;

/// Shared control-plane handle; cloning shares the pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    slow_ms: u64,
    log_sql: bool,
}

impl Database {
    /// Connects to the database described by `config`.
    pub async fn connect(config: &PgConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_conns)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.url)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            pool,
            slow_ms: config.slow_ms,
            log_sql: config.log_sql,
        })
    }

    /// Creates a handle from an existing pool, for tests.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            slow_ms: 250,
            log_sql: false,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Brings the control-plane schema up to date via the schema journal.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        migrations::apply_control_schema(&self.pool).await?;
        Ok(())
    }

    /// Logs a finished statement, flagging slow ones.
    pub fn observe_query(&self, label: &str, elapsed: Duration) {
        if self.log_sql {
            debug!(label, elapsed_ms = elapsed.as_millis() as u64, "sql");
        }
        if elapsed.as_millis() as u64 >= self.slow_ms {
            tracing::warn!(label, elapsed_ms = elapsed.as_millis() as u64, "slow sql");
        }
    }
}
