//! The Retz scheduler server.
//!
//! Event-driven core: resource offers and task status updates arrive from
//! the [`broker::ResourceBroker`], the [`dispatcher::Dispatcher`] turns them
//! into store transactions via the configured planner, and the
//! [`status::StatusReporter`] and [`gc::RetentionGc`] provide the
//! surrounding operational loop.

pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod gc;
pub mod status;

pub use crate::broker::{BrokerError, ResourceBroker, TaskLaunch, TaskStatus};
pub use crate::config::ServerConfig;
pub use crate::dispatcher::{DispatchError, Dispatcher};
pub use crate::gc::RetentionGc;
pub use crate::status::{OfferSnapshot, StatusReporter, StatusSummary};
