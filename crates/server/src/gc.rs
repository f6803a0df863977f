//! Retention GC: purges terminal jobs past the leeway window.

use std::time::Duration;

use retz_adapters::{Result, Store};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

pub struct RetentionGc {
    store: Store,
    leeway: Duration,
    interval: Duration,
}

impl RetentionGc {
    pub fn new(store: Store, leeway: Duration, interval: Duration) -> Self {
        Self {
            store,
            leeway,
            interval,
        }
    }

    /// One collection pass in its own transaction. Active jobs are never
    /// touched.
    pub async fn run_once(&self) -> Result<u64> {
        let purged = self.store.delete_old_jobs(self.leeway).await?;
        if purged > 0 {
            info!("retention gc removed {} finished jobs", purged);
        } else {
            debug!("retention gc found nothing to remove");
        }
        Ok(purged)
    }

    /// Periodic loop. A failed pass is logged and the next tick proceeds.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!("retention gc pass failed: {}", err);
            }
        }
    }
}
