//! Transactional store for users, applications, jobs and properties.
//!
//! Each row keeps the indexed columns the queries need next to a `json`
//! column holding the canonical entity encoding. The JSON is the source of
//! truth; hydration always decodes it and cross-checks the columns, so the
//! two views cannot drift silently.
//!
//! Multi-statement operations run with an explicit transaction and commit
//! exactly once; single-statement reads go straight to the pool. On
//! PostgreSQL every transaction is promoted to SERIALIZABLE; SQLite
//! transactions are serializable by construction.

mod applications;
mod jobs;
mod properties;
mod schema;
mod users;

use std::time::Duration;

use sqlx::any::AnyPoolOptions;
use sqlx::{Any, AnyPool, Row, Transaction};
use tracing::info;

use crate::error::{Result, StoreError};

/// Database backends certified to run at serializable isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Sqlite,
    Postgres,
}

impl Backend {
    fn from_url(url: &str) -> Result<Backend> {
        if url.starts_with("sqlite:") {
            Ok(Backend::Sqlite)
        } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Ok(Backend::Postgres)
        } else {
            Err(StoreError::IsolationUnsupported)
        }
    }
}

/// Handle to the scheduler database. Cheap to clone; constructed once at
/// startup and passed to every component.
#[derive(Clone, Debug)]
pub struct Store {
    pool: AnyPool,
    backend: Backend,
}

impl Store {
    /// Connect, verify the backend runs serializable transactions, and
    /// bootstrap the schema if the database is empty.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let backend = Backend::from_url(url)?;

        info!("initializing database {}", url);
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(StoreError::sql("connect"))?;

        let store = Self { pool, backend };
        store.verify_isolation().await?;
        store.bootstrap_schema().await?;
        Ok(store)
    }

    /// In-memory SQLite store on a single connection. Intended for tests;
    /// the database disappears when the store is dropped.
    pub async fn open_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    /// Begin a transaction at serializable isolation.
    pub(crate) async fn begin(&self, op: &'static str) -> Result<Transaction<'static, Any>> {
        let mut tx = self.pool.begin().await.map_err(StoreError::sql(op))?;
        if self.backend == Backend::Postgres {
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await
                .map_err(StoreError::sql(op))?;
        }
        Ok(tx)
    }

    async fn verify_isolation(&self) -> Result<()> {
        match self.backend {
            // SQLite transactions are serializable by construction.
            Backend::Sqlite => Ok(()),
            Backend::Postgres => {
                let mut tx = self
                    .pool
                    .begin()
                    .await
                    .map_err(StoreError::sql("verify_isolation"))?;
                sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                    .execute(&mut *tx)
                    .await
                    .map_err(|_| StoreError::IsolationUnsupported)?;
                let row = sqlx::query("SHOW transaction_isolation")
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(StoreError::sql("verify_isolation"))?;
                let level: String = row.try_get(0).map_err(StoreError::sql("verify_isolation"))?;
                let _ = tx.rollback().await;
                if level.eq_ignore_ascii_case("serializable") {
                    Ok(())
                } else {
                    Err(StoreError::IsolationUnsupported)
                }
            }
        }
    }

    /// Health check: one round-trip to the database.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::sql("ping"))?;
        Ok(())
    }

    /// Drain and close the pool: wait until no connection is checked out,
    /// polling every 512 ms, then close.
    pub async fn stop(&self) {
        info!("stopping store");
        loop {
            let size = self.pool.size() as usize;
            let idle = self.pool.num_idle();
            let active = size.saturating_sub(idle);
            if active == 0 {
                break;
            }
            info!("stopping store: active/idle = {}/{}", active, idle);
            tokio::time::sleep(Duration::from_millis(512)).await;
        }
        self.pool.close().await;
        info!("store stopped");
    }

    /// Raw pool access for administrative tooling and tests.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}
