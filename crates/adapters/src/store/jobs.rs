//! Job persistence and the planner's queue queries.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::TryStreamExt;
use retz_core::{Application, Job, JobState, JobTransition, ResourceQuantity};
use sqlx::any::AnyRow;
use sqlx::{AnyConnection, Row};
use tracing::{debug, info, warn};

use super::applications::fetch_application;
use super::Store;
use crate::error::{Result, StoreError};

/// Columns `find_fit` accepts in its order list.
const ORDER_COLUMNS: &[&str] = &["id", "name", "appid", "cmd", "priority", "taskid", "state"];

impl Store {
    /// Insert a job after checking, in the same transaction, that its
    /// application exists.
    pub async fn safe_add_job(&self, job: &Job) -> Result<()> {
        let mut tx = self.begin("safe_add_job").await?;
        if fetch_application(&mut tx, &job.appid).await?.is_none() {
            return Err(StoreError::ApplicationNotFound(job.appid.clone()));
        }
        insert_job(&mut tx, job).await?;
        tx.commit().await.map_err(StoreError::sql("safe_add_job"))?;
        debug!("job {} queued for application {}", job.id, job.appid);
        Ok(())
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT id, taskid, state, json FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::sql("get_job"))?;
        row.map(|row| decode_job_row("get_job", &row)).transpose()
    }

    pub async fn get_job_from_task_id(&self, task_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT id, taskid, state, json FROM jobs WHERE taskid = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::sql("get_job_from_task_id"))?;
        row.map(|row| decode_job_row("get_job_from_task_id", &row))
            .transpose()
    }

    /// Joined lookup of a job together with its application.
    pub async fn get_app_job(&self, id: i64) -> Result<Option<(Application, Job)>> {
        let row = sqlx::query(
            "SELECT j.id, j.taskid, j.state, j.json, a.json AS app_json \
             FROM jobs j, applications a WHERE j.id = $1 AND j.appid = a.appid",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::sql("get_app_job"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job = decode_job_row("get_app_job", &row)?;
        let app_json: String = row
            .try_get("app_json")
            .map_err(StoreError::sql("get_app_job"))?;
        let app: Application =
            serde_json::from_str(&app_json).map_err(StoreError::json("get_app_job"))?;
        if app.appid != job.appid {
            return Err(StoreError::InvariantViolation(format!(
                "job {} references application {} but the joined row decoded {}",
                job.id, job.appid, app.appid
            )));
        }
        Ok(Some((app, job)))
    }

    /// Jobs of one owner in one state, newest first. The tag filter is
    /// applied after hydration since tags only live in the JSON.
    pub async fn list_jobs(
        &self,
        owner: &str,
        state: JobState,
        tag: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT j.id, j.taskid, j.state, j.json \
             FROM jobs j, applications a \
             WHERE j.appid = a.appid AND a.owner = $1 AND j.state = $2 \
             ORDER BY j.id DESC LIMIT $3",
        )
        .bind(owner)
        .bind(state.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::sql("list_jobs"))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            let job = decode_job_row("list_jobs", row)?;
            if let Some(tag) = tag {
                if !job.tags.contains(tag) {
                    continue;
                }
            }
            jobs.push(job);
        }
        Ok(jobs)
    }

    /// Queued jobs in submission order.
    pub async fn queued(&self, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT id, taskid, state, json FROM jobs \
             WHERE state = 'QUEUED' ORDER BY id ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::sql("queued"))?;
        rows.iter().map(|row| decode_job_row("queued", row)).collect()
    }

    /// The longest prefix of the queue, ordered by `order_by` (all
    /// ascending, no duplicate columns), whose cumulative cpu and memory
    /// stay within both caps. The scan stops at the first job that would
    /// exceed either cap; later, smaller jobs are never pulled forward.
    pub async fn find_fit(&self, order_by: &[&str], cpu: i32, mem_mb: i32) -> Result<Vec<Job>> {
        for (i, column) in order_by.iter().enumerate() {
            if !ORDER_COLUMNS.contains(column) {
                return Err(StoreError::InvariantViolation(format!(
                    "find_fit: unknown order column {column}"
                )));
            }
            if order_by[..i].contains(column) {
                return Err(StoreError::InvariantViolation(format!(
                    "find_fit: duplicate order column {column}"
                )));
            }
        }
        let orders = order_by
            .iter()
            .map(|column| format!("{column} ASC"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id, taskid, state, json FROM jobs WHERE state = 'QUEUED' ORDER BY {orders}"
        );

        let mut rows = sqlx::query(&sql).fetch(&self.pool);
        let mut fit = Vec::new();
        let mut total = ResourceQuantity::default();
        while let Some(row) = rows.try_next().await.map_err(StoreError::sql("find_fit"))? {
            let job = decode_job_row("find_fit", &row)?;
            if total.cpu + job.resources.cpu <= cpu && total.mem_mb + job.resources.mem_mb <= mem_mb
            {
                total.cpu += job.resources.cpu;
                total.mem_mb += job.resources.mem_mb;
                fit.push(job);
            } else {
                break;
            }
        }
        Ok(fit)
    }

    /// Jobs currently occupying cluster resources (STARTING or STARTED).
    pub async fn get_running(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT id, taskid, state, json FROM jobs \
             WHERE state IN ('STARTING', 'STARTED') ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::sql("get_running"))?;
        rows.iter()
            .map(|row| decode_job_row("get_running", row))
            .collect()
    }

    /// Jobs whose terminal timestamp falls in `[start, end)`.
    pub async fn finished_jobs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT id, taskid, state, json FROM jobs \
             WHERE finished IS NOT NULL AND $1 <= finished AND finished < $2 \
             ORDER BY id ASC",
        )
        .bind(format_ts(&start))
        .bind(format_ts(&end))
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::sql("finished_jobs"))?;
        rows.iter()
            .map(|row| decode_job_row("finished_jobs", row))
            .collect()
    }

    /// Transactional read-modify-write: load the job, apply the typed
    /// transition, persist the result. An illegal transition aborts the
    /// transaction and leaves the row untouched.
    pub async fn update_job(&self, id: i64, transition: &JobTransition) -> Result<Job> {
        let mut tx = self.begin("update_job").await?;
        let row = sqlx::query("SELECT id, taskid, state, json FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::sql("update_job"))?;
        let Some(row) = row else {
            return Err(StoreError::JobNotFound(id));
        };
        let mut job = decode_job_row("update_job", &row)?;
        transition.apply(&mut job, Utc::now())?;
        persist_job(&mut tx, &job).await?;
        tx.commit().await.map_err(StoreError::sql("update_job"))?;
        info!("job {} moved to {}", job.id, job.state);
        Ok(job)
    }

    /// Apply one typed transition per job, all in a single transaction.
    /// Every transition is validated against the freshly-read row, so a
    /// stale plan (for example a launch racing with a kill) aborts the
    /// whole batch instead of clobbering the newer state.
    pub async fn transition_jobs(
        &self,
        transitions: &[(i64, JobTransition)],
    ) -> Result<Vec<Job>> {
        let mut tx = self.begin("transition_jobs").await?;
        let now = Utc::now();
        let mut updated = Vec::with_capacity(transitions.len());
        for (id, transition) in transitions {
            let row = sqlx::query("SELECT id, taskid, state, json FROM jobs WHERE id = $1")
                .bind(*id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(StoreError::sql("transition_jobs"))?;
            let Some(row) = row else {
                return Err(StoreError::JobNotFound(*id));
            };
            let mut job = decode_job_row("transition_jobs", &row)?;
            transition.apply(&mut job, now)?;
            persist_job(&mut tx, &job).await?;
            updated.push(job);
        }
        tx.commit()
            .await
            .map_err(StoreError::sql("transition_jobs"))?;
        Ok(updated)
    }

    /// Persist a batch of already-mutated jobs in one transaction.
    pub async fn update_jobs(&self, jobs: &[Job]) -> Result<()> {
        let mut tx = self.begin("update_jobs").await?;
        for job in jobs {
            persist_job(&mut tx, job).await?;
        }
        tx.commit().await.map_err(StoreError::sql("update_jobs"))?;
        Ok(())
    }

    /// Re-queue a batch of terminal jobs in one transaction. Jobs that are
    /// not terminal are skipped with a warning; a missing id aborts the
    /// whole batch.
    pub async fn retry_jobs(&self, ids: &[i64]) -> Result<()> {
        let mut tx = self.begin("retry_jobs").await?;
        for &id in ids {
            let row = sqlx::query("SELECT id, taskid, state, json FROM jobs WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(StoreError::sql("retry_jobs"))?;
            let Some(row) = row else {
                return Err(StoreError::JobNotFound(id));
            };
            let mut job = decode_job_row("retry_jobs", &row)?;
            if !job.is_terminal() {
                warn!("job {} is {}, not retryable; skipping", job.id, job.state);
                continue;
            }
            job.retried()?;
            persist_job(&mut tx, &job).await?;
        }
        tx.commit().await.map_err(StoreError::sql("retry_jobs"))?;
        Ok(())
    }

    pub async fn count_jobs(&self) -> Result<i64> {
        self.count("count_jobs", "SELECT count(id) FROM jobs", None)
            .await
    }

    pub async fn count_queued(&self) -> Result<i64> {
        self.count(
            "count_queued",
            "SELECT count(id) FROM jobs WHERE state = $1",
            Some(JobState::Queued.as_str()),
        )
        .await
    }

    pub async fn count_running(&self) -> Result<i64> {
        self.count(
            "count_running",
            "SELECT count(id) FROM jobs WHERE state IN ('STARTING', 'STARTED')",
            None,
        )
        .await
    }

    async fn count(
        &self,
        op: &'static str,
        sql: &'static str,
        bind: Option<&str>,
    ) -> Result<i64> {
        let mut query = sqlx::query(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let row = query
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::sql(op))?;
        row.try_get(0).map_err(StoreError::sql(op))
    }

    /// Highest job id ever assigned, or 0 on an empty table. New jobs are
    /// enqueued with an id above this.
    pub async fn get_latest_job_id(&self) -> Result<i64> {
        let row = sqlx::query("SELECT id FROM jobs ORDER BY id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::sql("get_latest_job_id"))?;
        match row {
            Some(row) => row.try_get(0).map_err(StoreError::sql("get_latest_job_id")),
            None => Ok(0),
        }
    }

    /// Purge terminal jobs whose `finished` timestamp is older than
    /// `now - leeway`. Non-terminal jobs are never eligible, whatever
    /// their age. Returns the number of rows removed.
    pub async fn delete_old_jobs(&self, leeway: Duration) -> Result<u64> {
        let leeway = chrono::Duration::from_std(leeway).map_err(|_| {
            StoreError::InvariantViolation("retention leeway out of range".to_string())
        })?;
        let cutoff = Utc::now() - leeway;

        let mut tx = self.begin("delete_old_jobs").await?;
        let result = sqlx::query(
            "DELETE FROM jobs WHERE state IN ('FINISHED', 'KILLED') \
             AND finished IS NOT NULL AND finished < $1",
        )
        .bind(format_ts(&cutoff))
        .execute(&mut *tx)
        .await
        .map_err(StoreError::sql("delete_old_jobs"))?;
        tx.commit()
            .await
            .map_err(StoreError::sql("delete_old_jobs"))?;
        Ok(result.rows_affected())
    }

    /// Administrative purge of every job below an id watermark.
    pub async fn delete_jobs_before(&self, max_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE id < $1")
            .bind(max_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::sql("delete_jobs_before"))?;
        Ok(result.rows_affected())
    }
}

/// The single insert path: indexed columns and JSON are written from the
/// same `Job` value so they cannot diverge.
async fn insert_job(conn: &mut AnyConnection, job: &Job) -> Result<()> {
    let json = serde_json::to_string(job).map_err(StoreError::json("insert_job"))?;
    sqlx::query(
        "INSERT INTO jobs (id, name, appid, cmd, priority, taskid, state, finished, json) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(job.id)
    .bind(&job.name)
    .bind(&job.appid)
    .bind(&job.cmd)
    .bind(i64::from(job.priority))
    .bind(job.task_id.as_deref())
    .bind(job.state.as_str())
    .bind(job.finished.as_ref().map(format_ts))
    .bind(json)
    .execute(conn)
    .await
    .map_err(StoreError::sql("insert_job"))?;
    Ok(())
}

/// The single update path, mirror of [`insert_job`].
async fn persist_job(conn: &mut AnyConnection, job: &Job) -> Result<()> {
    let json = serde_json::to_string(job).map_err(StoreError::json("persist_job"))?;
    sqlx::query(
        "UPDATE jobs SET name = $1, appid = $2, cmd = $3, priority = $4, \
         taskid = $5, state = $6, finished = $7, json = $8 WHERE id = $9",
    )
    .bind(&job.name)
    .bind(&job.appid)
    .bind(&job.cmd)
    .bind(i64::from(job.priority))
    .bind(job.task_id.as_deref())
    .bind(job.state.as_str())
    .bind(job.finished.as_ref().map(format_ts))
    .bind(json)
    .bind(job.id)
    .execute(conn)
    .await
    .map_err(StoreError::sql("persist_job"))?;
    Ok(())
}

/// Hydrate a job from its JSON document, rejecting rows whose indexed
/// columns disagree with it.
fn decode_job_row(op: &'static str, row: &AnyRow) -> Result<Job> {
    let json: String = row.try_get("json").map_err(StoreError::sql(op))?;
    let job: Job = serde_json::from_str(&json).map_err(StoreError::json(op))?;

    let id: i64 = row.try_get("id").map_err(StoreError::sql(op))?;
    let taskid: Option<String> = row.try_get("taskid").map_err(StoreError::sql(op))?;
    let state: String = row.try_get("state").map_err(StoreError::sql(op))?;
    if id != job.id || taskid != job.task_id || state != job.state.as_str() {
        return Err(StoreError::InvariantViolation(format!(
            "jobs row {id} (state {state}) disagrees with its JSON document"
        )));
    }
    Ok(job)
}

/// Fixed-width ISO-8601 with millisecond precision, so lexicographic
/// comparison of the `finished` column equals chronological comparison.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
