//! Application persistence.

use retz_core::Application;
use sqlx::{AnyConnection, Row};
use tracing::{info, warn};

use super::users::fetch_user;
use super::Store;
use crate::error::{Result, StoreError};

impl Store {
    /// All applications, optionally restricted to one owner.
    pub async fn get_all_applications(&self, owner: Option<&str>) -> Result<Vec<Application>> {
        let mut tx = self.begin("get_all_applications").await?;
        let rows = match owner {
            Some(owner) => {
                sqlx::query("SELECT appid, json FROM applications WHERE owner = $1").bind(owner)
            }
            None => sqlx::query("SELECT appid, json FROM applications"),
        }
        .fetch_all(&mut *tx)
        .await
        .map_err(StoreError::sql("get_all_applications"))?;
        tx.commit()
            .await
            .map_err(StoreError::sql("get_all_applications"))?;

        rows.iter()
            .map(|row| {
                let appid: String = row
                    .try_get("appid")
                    .map_err(StoreError::sql("get_all_applications"))?;
                let json: String = row
                    .try_get("json")
                    .map_err(StoreError::sql("get_all_applications"))?;
                decode_application("get_all_applications", &json, &appid)
            })
            .collect()
    }

    /// Register an application, replacing any previous definition with the
    /// same appid in the same transaction. Returns false without writing
    /// when the owner is missing or disabled.
    pub async fn add_application(&self, app: &Application) -> Result<bool> {
        let mut tx = self.begin("add_application").await?;

        match fetch_user(&mut tx, &app.owner).await? {
            None => {
                warn!(
                    "{} tried to register application {}, but the user does not exist",
                    app.owner, app.appid
                );
                return Ok(false);
            }
            Some(user) if !user.enabled => {
                warn!(
                    "{} tried to register application {}, but the user is disabled",
                    app.owner, app.appid
                );
                return Ok(false);
            }
            Some(_) => {}
        }

        delete_application(&mut tx, &app.appid).await?;
        let json = serde_json::to_string(app).map_err(StoreError::json("add_application"))?;
        sqlx::query("INSERT INTO applications (appid, owner, json) VALUES ($1, $2, $3)")
            .bind(&app.appid)
            .bind(&app.owner)
            .bind(json)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::sql("add_application"))?;
        tx.commit()
            .await
            .map_err(StoreError::sql("add_application"))?;
        Ok(true)
    }

    pub async fn get_application(&self, appid: &str) -> Result<Option<Application>> {
        let row = sqlx::query("SELECT appid, json FROM applications WHERE appid = $1")
            .bind(appid)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::sql("get_application"))?;
        row.map(|row| {
            let appid: String = row
                .try_get("appid")
                .map_err(StoreError::sql("get_application"))?;
            let json: String = row
                .try_get("json")
                .map_err(StoreError::sql("get_application"))?;
            decode_application("get_application", &json, &appid)
        })
        .transpose()
    }

    /// Delete an application, refusing while any queued or running job
    /// still references it. Finished jobs keep their appid as history.
    pub async fn safe_delete_application(&self, appid: &str) -> Result<()> {
        let mut tx = self.begin("safe_delete_application").await?;

        let row = sqlx::query(
            "SELECT count(id) FROM jobs \
             WHERE appid = $1 AND state IN ('QUEUED', 'STARTING', 'STARTED')",
        )
        .bind(appid)
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::sql("safe_delete_application"))?;
        let active: i64 = row
            .try_get(0)
            .map_err(StoreError::sql("safe_delete_application"))?;
        if active > 0 {
            warn!(
                "refusing to delete application {}: {} non-finished jobs reference it",
                appid, active
            );
            return Err(StoreError::ApplicationInUse {
                appid: appid.to_string(),
                count: active,
            });
        }

        delete_application(&mut tx, appid).await?;
        tx.commit()
            .await
            .map_err(StoreError::sql("safe_delete_application"))?;
        info!("application {} deleted", appid);
        Ok(())
    }
}

/// Read one application inside an open transaction.
pub(crate) async fn fetch_application(
    conn: &mut AnyConnection,
    appid: &str,
) -> Result<Option<Application>> {
    let row = sqlx::query("SELECT appid, json FROM applications WHERE appid = $1")
        .bind(appid)
        .fetch_optional(conn)
        .await
        .map_err(StoreError::sql("fetch_application"))?;
    row.map(|row| {
        let appid: String = row
            .try_get("appid")
            .map_err(StoreError::sql("fetch_application"))?;
        let json: String = row
            .try_get("json")
            .map_err(StoreError::sql("fetch_application"))?;
        decode_application("fetch_application", &json, &appid)
    })
    .transpose()
}

async fn delete_application(conn: &mut AnyConnection, appid: &str) -> Result<()> {
    sqlx::query("DELETE FROM applications WHERE appid = $1")
        .bind(appid)
        .execute(conn)
        .await
        .map_err(StoreError::sql("delete_application"))?;
    Ok(())
}

fn decode_application(op: &'static str, json: &str, appid_column: &str) -> Result<Application> {
    let app: Application = serde_json::from_str(json).map_err(StoreError::json(op))?;
    if app.appid != appid_column {
        return Err(StoreError::InvariantViolation(format!(
            "applications row {appid_column} disagrees with its JSON document ({})",
            app.appid
        )));
    }
    Ok(app)
}
