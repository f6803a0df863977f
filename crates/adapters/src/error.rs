//! Store error types

use retz_core::DomainError;
use thiserror::Error;

/// Failures surfaced by the persistence layer. SQL errors always carry the
/// name of the store operation that issued them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{op} failed: {source}")]
    Sql {
        op: &'static str,
        source: sqlx::Error,
    },

    #[error("{op}: entity JSON could not be encoded or decoded: {source}")]
    Json {
        op: &'static str,
        source: serde_json::Error,
    },

    #[error("job {0} not found")]
    JobNotFound(i64),

    #[error("no such application: {0}")]
    ApplicationNotFound(String),

    #[error("application {appid} still has {count} non-finished jobs")]
    ApplicationInUse { appid: String, count: i64 },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("database schema is partially initialized; refusing to operate")]
    SchemaPartial,

    #[error("database backend does not provide serializable isolation")]
    IsolationUnsupported,

    #[error("store invariant violated: {0}")]
    InvariantViolation(String),
}

impl StoreError {
    pub(crate) fn sql(op: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
        move |source| StoreError::Sql { op, source }
    }

    pub(crate) fn json(op: &'static str) -> impl FnOnce(serde_json::Error) -> StoreError {
        move |source| StoreError::Json { op, source }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
