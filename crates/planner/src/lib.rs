//! Planning strategies: given the current resource offers and the queue of
//! pending jobs, choose which jobs to launch where.
//!
//! Planners are pure readers. They query the store for the queue prefix
//! that fits the offered totals and pack it into individual offers; the
//! dispatcher persists the resulting transitions and talks to the broker.

pub mod builtin;
pub mod plan;

pub use crate::builtin::{FifoPlanner, PriorityPlanner};
pub use crate::plan::{Launch, Plan};

use async_trait::async_trait;
use retz_adapters::{Result, Store};
use retz_core::{Offer, ResourceQuantity};

/// Strategy that selects which queued jobs to launch against the current
/// offers. Built-in strategies differ only in their order column list.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Columns passed to `Store::find_fit`; earlier columns dominate, all
    /// ascending.
    fn order_by(&self) -> &[&str];

    /// Compute a launch plan. The default covers both built-in strategies:
    /// take the queue prefix that fits the summed offer resources, then
    /// first-fit pack it into single offers.
    async fn plan(&self, store: &Store, offers: &[Offer]) -> Result<Plan> {
        let mut total = ResourceQuantity::default();
        for offer in offers {
            total.add(&offer.resources);
        }
        let candidates = store
            .find_fit(self.order_by(), total.cpu, total.mem_mb)
            .await?;
        Ok(Plan::pack(candidates, offers))
    }
}
