//! Schema probe and bootstrap.

use sqlx::Row;
use tracing::{debug, error, info};

use super::{Backend, Store};
use crate::error::{Result, StoreError};

/// The four tables that make up the schema, in creation order.
pub(crate) const TABLES: [&str; 4] = ["users", "applications", "jobs", "properties"];

const DDL: &str = include_str!("schema.sql");

impl Store {
    /// Probe for the schema. All four tables present: proceed. None:
    /// execute the DDL. Anything in between means a half-migrated
    /// database, and operating on it would corrupt data.
    pub(crate) async fn bootstrap_schema(&self) -> Result<()> {
        let mut present = 0;
        for table in TABLES {
            if self.table_exists(table).await? {
                present += 1;
            }
        }

        match present {
            4 => {
                debug!("all four tables present");
                Ok(())
            }
            0 => {
                info!("no tables found: creating schema");
                let mut tx = self.begin("bootstrap_schema").await?;
                sqlx::raw_sql(DDL)
                    .execute(&mut *tx)
                    .await
                    .map_err(StoreError::sql("bootstrap_schema"))?;
                tx.commit()
                    .await
                    .map_err(StoreError::sql("bootstrap_schema"))?;
                Ok(())
            }
            n => {
                error!("database is partially initialized: {} of 4 tables exist", n);
                Err(StoreError::SchemaPartial)
            }
        }
    }

    async fn table_exists(&self, name: &str) -> Result<bool> {
        // Engines differ in how they fold unquoted identifiers, so the
        // probe matches case-insensitively.
        let sql = match self.backend {
            Backend::Sqlite => {
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND lower(name) = $1"
            }
            Backend::Postgres => {
                "SELECT count(*) FROM information_schema.tables \
                 WHERE lower(table_schema) = 'public' AND lower(table_name) = $1"
            }
        };
        let row = sqlx::query(sql)
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::sql("table_exists"))?;
        let count: i64 = row.try_get(0).map_err(StoreError::sql("table_exists"))?;
        Ok(count > 0)
    }

    /// Drop every table. Test helper; production code never calls this.
    pub async fn clear(&self) -> Result<()> {
        for table in ["jobs", "applications", "users", "properties"] {
            let sql = format!("DROP TABLE IF EXISTS {table}");
            sqlx::raw_sql(&sql)
                .execute(&self.pool)
                .await
                .map_err(StoreError::sql("clear"))?;
        }
        info!("all tables dropped");
        Ok(())
    }
}
