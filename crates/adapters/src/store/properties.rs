//! Scheduler-global properties: a singleton key/value table.

use sqlx::Row;
use tracing::info;

use super::Store;
use crate::error::{Result, StoreError};

const FRAMEWORK_ID_KEY: &str = "frameworkId";

impl Store {
    /// Persist the broker-issued framework id so the scheduler keeps its
    /// identity across restarts. Returns true when the id was newly
    /// inserted, false when an existing row was overwritten.
    pub async fn set_framework_id(&self, value: &str) -> Result<bool> {
        let mut tx = self.begin("set_framework_id").await?;
        let existing = sqlx::query("SELECT value FROM properties WHERE key = $1")
            .bind(FRAMEWORK_ID_KEY)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::sql("set_framework_id"))?;

        let inserted = match existing {
            None => {
                sqlx::query("INSERT INTO properties (key, value) VALUES ($1, $2)")
                    .bind(FRAMEWORK_ID_KEY)
                    .bind(value)
                    .execute(&mut *tx)
                    .await
                    .map_err(StoreError::sql("set_framework_id"))?;
                true
            }
            Some(_) => {
                sqlx::query("UPDATE properties SET value = $1 WHERE key = $2")
                    .bind(value)
                    .bind(FRAMEWORK_ID_KEY)
                    .execute(&mut *tx)
                    .await
                    .map_err(StoreError::sql("set_framework_id"))?;
                false
            }
        };
        tx.commit()
            .await
            .map_err(StoreError::sql("set_framework_id"))?;
        info!("framework id set to {}", value);
        Ok(inserted)
    }

    pub async fn get_framework_id(&self) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM properties WHERE key = $1")
            .bind(FRAMEWORK_ID_KEY)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::sql("get_framework_id"))?;
        row.map(|row| row.try_get(0).map_err(StoreError::sql("get_framework_id")))
            .transpose()
    }

    pub async fn delete_all_properties(&self) -> Result<()> {
        let mut tx = self.begin("delete_all_properties").await?;
        sqlx::query("DELETE FROM properties")
            .execute(&mut *tx)
            .await
            .map_err(StoreError::sql("delete_all_properties"))?;
        tx.commit()
            .await
            .map_err(StoreError::sql("delete_all_properties"))?;
        Ok(())
    }
}
