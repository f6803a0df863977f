//! The dispatcher: turns broker events into store transactions.
//!
//! Single writer for broker-driven job transitions; client calls (kill,
//! retry) may race with it, and the store's serializable isolation decides
//! the order. No in-process locks are held around store calls.

use std::sync::Arc;

use retz_adapters::{Store, StoreError};
use retz_core::{DomainError, Job, JobState, JobTransition, Offer};
use retz_planner::Planner;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerError, ResourceBroker, TaskLaunch, TaskStatus};
use crate::status::OfferSnapshot;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The broker handed us a different framework id than the one we
    /// persisted. Continuing would adopt another framework's tasks, so
    /// this is fatal.
    #[error("framework id mismatch: stored {stored}, broker reregistered {reregistered}")]
    FrameworkIdMismatch {
        stored: String,
        reregistered: String,
    },
}

pub struct Dispatcher {
    store: Store,
    planner: Arc<dyn Planner>,
    broker: Arc<dyn ResourceBroker>,
    offers: OfferSnapshot,
}

impl Dispatcher {
    pub fn new(
        store: Store,
        planner: Arc<dyn Planner>,
        broker: Arc<dyn ResourceBroker>,
        offers: OfferSnapshot,
    ) -> Self {
        Self {
            store,
            planner,
            broker,
            offers,
        }
    }

    /// New offers arrived: plan, persist the STARTING transitions in one
    /// transaction, then launch. A launch the broker rejects is compensated
    /// by returning the job to the queue.
    pub async fn on_offers(&self, offers: Vec<Offer>) -> Result<(), DispatchError> {
        self.offers.replace(&offers).await;
        let plan = self.planner.plan(&self.store, &offers).await?;
        debug!(
            "planned {} launches and {} declines from {} offers",
            plan.launches.len(),
            plan.to_cancel.len(),
            offers.len()
        );

        let mut staged: Vec<(TaskLaunch, Offer)> = Vec::with_capacity(plan.launches.len());
        let mut transitions: Vec<(i64, JobTransition)> = Vec::with_capacity(plan.launches.len());
        for launch in plan.launches {
            let Some(offer) = offers.iter().find(|offer| offer.id == launch.offer_id) else {
                warn!(
                    "planner assigned job {} to unknown offer {}; skipping",
                    launch.job.id, launch.offer_id
                );
                continue;
            };
            let task_id = new_task_id(&launch.job);
            transitions.push((
                launch.job.id,
                JobTransition::Starting {
                    task_id: task_id.clone(),
                    url: None,
                },
            ));
            staged.push((
                TaskLaunch {
                    task_id,
                    job_id: launch.job.id,
                    appid: launch.job.appid.clone(),
                    cmd: launch.job.cmd.clone(),
                    resources: launch.job.resources,
                },
                offer.clone(),
            ));
        }

        // Every STARTING transition is re-validated against the current row
        // inside one transaction; a plan that raced with a concurrent kill
        // aborts here and the offers are simply returned.
        match self.store.transition_jobs(&transitions).await {
            Ok(_) => {}
            Err(StoreError::Domain(DomainError::IllegalTransition { from, to })) => {
                warn!(
                    "planned launches raced with a concurrent transition ({} -> {}); \
                     declining this offer round",
                    from, to
                );
                for offer in &offers {
                    if let Err(err) = self.broker.decline(&offer.id).await {
                        warn!("failed to decline offer {}: {}", offer.id, err);
                    }
                }
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        for (launch, offer) in staged {
            match self.broker.launch(&launch, &offer).await {
                Ok(()) => {
                    info!(
                        "task {} launched for job {} on agent {}",
                        launch.task_id, launch.job_id, offer.agent_id
                    );
                    self.offers.remove(&offer.id).await;
                }
                Err(err) => {
                    warn!(
                        "broker rejected launch of job {}: {}; returning it to the queue",
                        launch.job_id, err
                    );
                    self.store
                        .update_job(launch.job_id, &JobTransition::RevertLaunch)
                        .await?;
                }
            }
        }

        for offer_id in &plan.to_cancel {
            if let Err(err) = self.broker.decline(offer_id).await {
                warn!("failed to decline offer {}: {}", offer_id, err);
            }
        }
        Ok(())
    }

    /// A task status update arrived. Unknown tasks and stale transitions
    /// are logged and dropped; the broker re-delivers anything that still
    /// matters via reconciliation.
    pub async fn on_status_update(
        &self,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<(), DispatchError> {
        let Some(job) = self.store.get_job_from_task_id(task_id).await? else {
            warn!("status update for unknown task {}; dropping", task_id);
            return Ok(());
        };

        let transition = match status {
            TaskStatus::Starting => {
                debug!("task {} confirmed starting", task_id);
                return Ok(());
            }
            TaskStatus::Started { url } => JobTransition::Started { url },
            TaskStatus::Finished { exit_code } => JobTransition::Finished { exit_code },
            TaskStatus::Failed { reason } => JobTransition::Killed {
                reason: reason.or_else(|| Some("task failed".to_string())),
            },
            TaskStatus::Lost { reason } => JobTransition::Killed {
                reason: reason.or_else(|| Some("task lost".to_string())),
            },
            TaskStatus::Killed { reason } => JobTransition::Killed { reason },
        };

        match self.store.update_job(job.id, &transition).await {
            Ok(updated) => {
                if updated.state.is_terminal() {
                    info!("job {} reached {} (task {})", updated.id, updated.state, task_id);
                }
                Ok(())
            }
            Err(StoreError::Domain(DomainError::IllegalTransition { from, to })) => {
                warn!(
                    "stale status update for job {} dropped ({} -> {})",
                    job.id, from, to
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The broker connection dropped. Nothing to mutate; state converges
    /// again after reregistration and reconciliation.
    pub fn on_disconnected(&self) {
        warn!("broker disconnected; waiting for reregistration");
    }

    /// The broker reregistered us. The framework id must match whatever we
    /// persisted earlier; a different id means we would be adopting someone
    /// else's tasks.
    pub async fn on_reregistered(&self, framework_id: &str) -> Result<(), DispatchError> {
        if let Some(stored) = self.store.get_framework_id().await? {
            if stored != framework_id {
                return Err(DispatchError::FrameworkIdMismatch {
                    stored,
                    reregistered: framework_id.to_string(),
                });
            }
        }
        let inserted = self.store.set_framework_id(framework_id).await?;
        info!(
            "framework {} registered ({})",
            framework_id,
            if inserted { "new" } else { "resumed" }
        );
        Ok(())
    }

    /// Client-requested kill. A queued job dies immediately; a launched job
    /// is killed through the broker, and the terminal transition lands when
    /// the broker confirms it via a status update.
    pub async fn kill_job(&self, id: i64, reason: Option<String>) -> Result<Job, DispatchError> {
        let Some(job) = self.store.get_job(id).await? else {
            return Err(StoreError::JobNotFound(id).into());
        };
        if job.state.is_terminal() {
            return Err(StoreError::from(DomainError::illegal_transition(
                job.state,
                JobState::Killed,
            ))
            .into());
        }
        match &job.task_id {
            Some(task_id) => {
                info!("asking broker to kill task {} (job {})", task_id, id);
                self.broker.kill(task_id).await?;
                Ok(job)
            }
            None => {
                let updated = self
                    .store
                    .update_job(id, &JobTransition::Killed { reason })
                    .await?;
                Ok(updated)
            }
        }
    }

    /// Ask the broker for fresh status of everything we believe is running.
    pub async fn reconcile(&self) -> Result<(), DispatchError> {
        let running = self.store.get_running().await?;
        let task_ids: Vec<String> = running
            .iter()
            .filter_map(|job| job.task_id.clone())
            .collect();
        if task_ids.is_empty() {
            return Ok(());
        }
        info!("reconciling {} running tasks", task_ids.len());
        self.broker.reconcile(&task_ids).await?;
        Ok(())
    }
}

fn new_task_id(job: &Job) -> String {
    format!("retz-{}-{}", job.id, Uuid::new_v4().simple())
}
