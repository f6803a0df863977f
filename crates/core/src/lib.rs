//! Domain core for the Retz scheduler.
//!
//! This crate contains the persistent entities (users, applications, jobs),
//! the job lifecycle state machine, and the value objects shared by the
//! store, planner and dispatcher. It has no persistence or I/O dependencies.

pub mod application;
pub mod error;
pub mod job;
pub mod offer;
pub mod resources;
pub mod user;

pub use crate::application::Application;
pub use crate::error::{DomainError, Result};
pub use crate::job::{Job, JobState, JobTransition};
pub use crate::offer::Offer;
pub use crate::resources::ResourceQuantity;
pub use crate::user::User;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
