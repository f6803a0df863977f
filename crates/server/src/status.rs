//! Aggregate scheduler status for external endpoints.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use retz_adapters::{Result, Store};
use retz_core::{Offer, ResourceQuantity};
use serde::Serialize;
use tokio::sync::RwLock;

/// Shared cache of the last offer round, kept by the dispatcher. Status
/// reads may be stale; that is acceptable by contract.
#[derive(Clone, Default)]
pub struct OfferSnapshot {
    inner: Arc<RwLock<HashMap<String, Offer>>>,
}

impl OfferSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot with a fresh offer round.
    pub async fn replace(&self, offers: &[Offer]) {
        let mut inner = self.inner.write().await;
        inner.clear();
        for offer in offers {
            inner.insert(offer.id.clone(), offer.clone());
        }
    }

    /// Drop an offer that was launched against.
    pub async fn remove(&self, offer_id: &str) {
        self.inner.write().await.remove(offer_id);
    }

    /// (offer count, distinct agents, summed resources).
    pub async fn totals(&self) -> (usize, usize, ResourceQuantity) {
        let inner = self.inner.read().await;
        let mut agents: HashSet<&str> = HashSet::new();
        let mut total = ResourceQuantity::default();
        for offer in inner.values() {
            agents.insert(offer.agent_id.as_str());
            total.add(&offer.resources);
        }
        (inner.len(), agents.len(), total)
    }
}

/// Snapshot of queue depth, running load and offered capacity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub queue_length: i64,
    pub running_length: i64,
    pub total_used: ResourceQuantity,
    pub num_slaves: usize,
    pub offers: usize,
    pub total_offered: ResourceQuantity,
    pub version: String,
}

/// Computes [`StatusSummary`] on demand from store counters and the offer
/// snapshot. Never heavier than a couple of indexed count queries.
pub struct StatusReporter {
    store: Store,
    offers: OfferSnapshot,
    version: String,
}

impl StatusReporter {
    pub fn new(store: Store, offers: OfferSnapshot) -> Self {
        Self {
            store,
            offers,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub async fn report(&self) -> Result<StatusSummary> {
        let queue_length = self.store.count_queued().await?;
        let running_length = self.store.count_running().await?;
        let mut total_used = ResourceQuantity::default();
        for job in self.store.get_running().await? {
            total_used.add(&job.resources);
        }
        let (offers, num_slaves, total_offered) = self.offers.totals().await;

        Ok(StatusSummary {
            queue_length,
            running_length,
            total_used,
            num_slaves,
            offers,
            total_offered,
            version: self.version.clone(),
        })
    }
}
