//! Application entity: a reusable execution environment for jobs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// An application bundles everything a job needs to run: a container image,
/// files fetched into the sandbox, and environment variables. The scheduler
/// treats the definition as opaque; only `appid` and `owner` matter to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub appid: String,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Application {
    pub fn new(appid: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            appid: appid.into(),
            owner: owner.into(),
            container_image: None,
            files: Vec::new(),
            env: BTreeMap::new(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_container_image(mut self, image: impl Into<String>) -> Self {
        self.container_image = Some(image.into());
        self
    }
}
