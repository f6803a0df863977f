//! Abstract resource broker: the cluster side of the scheduler.
//!
//! The concrete driver (Mesos or a test double) delivers offers and task
//! status callbacks into the dispatcher and accepts launches, declines and
//! kills through this trait.

use async_trait::async_trait;
use retz_core::{Offer, ResourceQuantity};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker rejected launch of task {task_id}: {reason}")]
    LaunchRejected { task_id: String, reason: String },

    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// Everything the broker needs to start one task inside an offer.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskLaunch {
    pub task_id: String,
    pub job_id: i64,
    pub appid: String,
    pub cmd: String,
    pub resources: ResourceQuantity,
}

/// Task status as delivered by broker callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskStatus {
    Starting,
    Started { url: Option<String> },
    Finished { exit_code: i32 },
    Failed { reason: Option<String> },
    Lost { reason: Option<String> },
    Killed { reason: Option<String> },
}

#[async_trait]
pub trait ResourceBroker: Send + Sync {
    /// Launch a task against an offer. May fail; the dispatcher compensates.
    async fn launch(&self, launch: &TaskLaunch, offer: &Offer) -> Result<(), BrokerError>;

    /// Return an unused offer to the broker.
    async fn decline(&self, offer_id: &str) -> Result<(), BrokerError>;

    /// Ask the broker to kill a running task.
    async fn kill(&self, task_id: &str) -> Result<(), BrokerError>;

    /// Request fresh status updates for the given tasks.
    async fn reconcile(&self, task_ids: &[String]) -> Result<(), BrokerError>;
}
