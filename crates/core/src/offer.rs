//! Resource offers delivered by the broker.

use serde::{Deserialize, Serialize};

use crate::resources::ResourceQuantity;

/// A quantum of cluster resources on one agent, valid until it is either
/// launched against or declined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offer {
    pub id: String,
    pub agent_id: String,
    pub resources: ResourceQuantity,
}

impl Offer {
    pub fn new(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        resources: ResourceQuantity,
    ) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            resources,
        }
    }
}
