//! User principal owning applications.

use serde::{Deserialize, Serialize};

/// A user is identified by an opaque `key_id` and authenticates with a
/// shared secret. Users are never deleted; revoking access flips `enabled`.
///
/// Unknown JSON fields survive a round-trip through `extra` so older rows
/// stay readable after schema evolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub key_id: String,
    pub secret: String,
    pub enabled: bool,
    #[serde(default)]
    pub info: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl User {
    pub fn new(
        key_id: impl Into<String>,
        secret: impl Into<String>,
        enabled: bool,
        info: impl Into<String>,
    ) -> Self {
        Self {
            key_id: key_id.into(),
            secret: secret.into(),
            enabled,
            info: info.into(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn enable(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}
