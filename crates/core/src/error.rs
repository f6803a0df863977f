//! Error types shared across the system

use thiserror::Error;

/// Base error type for domain-level failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("illegal state transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },
}

impl DomainError {
    pub fn illegal_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::IllegalTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DomainError>;
