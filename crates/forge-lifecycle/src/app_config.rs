//! Declared application intent and the per-invocation placement settings

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// One service binding, shaped like an entry of `VCAP_SERVICES`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub plan: String,
    #[serde(default)]
    pub credentials: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syslog_drain_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default)]
    pub volume_mounts: Vec<String>,
}

/// Service bindings grouped by service label
pub type Services = BTreeMap<String, Vec<Service>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub buildpack: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buildpacks: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub disk_quota: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub memory: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub staging_env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub running_env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Services>,
}

impl AppConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Fill an empty memory or disk quota
    pub fn with_defaults(mut self, memory: &str, disk_quota: &str) -> Self {
        if self.memory.is_empty() {
            self.memory = memory.to_string();
        }
        if self.disk_quota.is_empty() {
            self.disk_quota = disk_quota.to_string();
        }
        self
    }
}

/// Where a running app is reachable from the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub host_ip: String,
    pub host_port: String,
    /// Share this container's network namespace instead of publishing a port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

impl NetworkConfig {
    pub fn published(host_ip: &str, host_port: &str) -> Self {
        Self {
            host_ip: host_ip.to_string(),
            host_port: host_port.to_string(),
            container_id: None,
        }
    }

    pub fn shared(container_id: &str) -> Self {
        Self {
            container_id: Some(container_id.to_string()),
            ..Default::default()
        }
    }

    pub fn peer(&self) -> Option<&str> {
        self.container_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// System buildpack baked into the staging image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buildpack {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Buildpacks(pub Vec<Buildpack>);

impl Buildpacks {
    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|b| b.name.clone()).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Buildpack> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Buildpack>> for Buildpacks {
    fn from(buildpacks: Vec<Buildpack>) -> Self {
        Self(buildpacks)
    }
}

/// Decorates the per-app log prefix, for example with terminal colors
pub type Colorizer = Arc<dyn Fn(&str) -> String + Send + Sync>;

pub fn plain() -> Colorizer {
    Arc::new(|s: &str| s.to_string())
}
