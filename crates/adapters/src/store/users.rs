//! User persistence.

use retz_core::User;
use sqlx::{AnyConnection, Row};
use tracing::info;
use uuid::Uuid;

use super::Store;
use crate::error::{Result, StoreError};

impl Store {
    pub async fn all_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query("SELECT key_id, json FROM users")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::sql("all_users"))?;
        rows.iter()
            .map(|row| {
                let key_id: String = row.try_get("key_id").map_err(StoreError::sql("all_users"))?;
                let json: String = row.try_get("json").map_err(StoreError::sql("all_users"))?;
                decode_user("all_users", &json, &key_id)
            })
            .collect()
    }

    /// Issue fresh credentials (32 hex characters each) and persist the
    /// new user, enabled.
    pub async fn create_user(&self, info: &str) -> Result<User> {
        let key_id = Uuid::new_v4().simple().to_string();
        let secret = Uuid::new_v4().simple().to_string();
        let user = User::new(key_id, secret, true, info);
        info!("issuing credentials for new user {}", user.key_id);
        self.add_user(&user).await?;
        Ok(user)
    }

    pub async fn add_user(&self, user: &User) -> Result<()> {
        let json = serde_json::to_string(user).map_err(StoreError::json("add_user"))?;
        sqlx::query("INSERT INTO users (key_id, secret, enabled, json) VALUES ($1, $2, $3, $4)")
            .bind(&user.key_id)
            .bind(&user.secret)
            .bind(user.enabled)
            .bind(json)
            .execute(&self.pool)
            .await
            .map_err(StoreError::sql("add_user"))?;
        Ok(())
    }

    pub async fn get_user(&self, key_id: &str) -> Result<Option<User>> {
        let mut tx = self.begin("get_user").await?;
        let user = fetch_user(&mut tx, key_id).await?;
        tx.commit().await.map_err(StoreError::sql("get_user"))?;
        Ok(user)
    }

    /// Flip the enabled flag; a no-op when the user does not exist.
    pub async fn enable_user(&self, key_id: &str, enabled: bool) -> Result<()> {
        let mut tx = self.begin("enable_user").await?;
        if let Some(mut user) = fetch_user(&mut tx, key_id).await? {
            user.enable(enabled);
            let json = serde_json::to_string(&user).map_err(StoreError::json("enable_user"))?;
            sqlx::query("UPDATE users SET secret = $1, enabled = $2, json = $3 WHERE key_id = $4")
                .bind(&user.secret)
                .bind(user.enabled)
                .bind(json)
                .bind(&user.key_id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::sql("enable_user"))?;
        }
        tx.commit().await.map_err(StoreError::sql("enable_user"))?;
        Ok(())
    }
}

/// Read one user inside an open transaction.
pub(crate) async fn fetch_user(conn: &mut AnyConnection, key_id: &str) -> Result<Option<User>> {
    let row = sqlx::query("SELECT key_id, json FROM users WHERE key_id = $1")
        .bind(key_id)
        .fetch_optional(conn)
        .await
        .map_err(StoreError::sql("fetch_user"))?;
    row.map(|row| {
        let key_id: String = row.try_get("key_id").map_err(StoreError::sql("fetch_user"))?;
        let json: String = row.try_get("json").map_err(StoreError::sql("fetch_user"))?;
        decode_user("fetch_user", &json, &key_id)
    })
    .transpose()
}

fn decode_user(op: &'static str, json: &str, key_id_column: &str) -> Result<User> {
    let user: User = serde_json::from_str(json).map_err(StoreError::json(op))?;
    if user.key_id != key_id_column {
        return Err(StoreError::InvariantViolation(format!(
            "users row {key_id_column} disagrees with its JSON document ({})",
            user.key_id
        )));
    }
    Ok(user)
}
