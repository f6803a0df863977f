//! Persistence adapters for the Retz scheduler.
//!
//! The [`Store`] owns every persistent entity; all other components read
//! through it and propose mutations that it applies inside serializable
//! transactions.

pub mod error;
pub mod store;

pub use crate::error::{Result, StoreError};
pub use crate::store::Store;
