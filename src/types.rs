//! Data structures shared by the registry client, the snapshot builder and
//! the writer.
//!
//! [`Instance`] is deserialized straight from the Nacos instance list, while
//! [`Target`] and [`Snapshot`] serialize to the `file_sd_configs` target
//! group schema that Prometheus reads:
//!
//! ```json
//! [{"targets": ["10.0.0.1:9090"], "labels": {"instance": "10.0.0.1:9090", "job": "nacos-discovery", "service": "api"}}]
//! ```
//!
//! Labels are kept in a [`BTreeMap`] so two snapshots built from the same
//! registry state serialize to the same bytes.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer, Serialize};

pub type ServiceName = String;

/// One registered endpoint of a service, as reported by Nacos.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Instance {
    #[serde(rename = "ip")]
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub healthy: bool,
    /// Nacos lets operators take an instance out of rotation without
    /// deregistering it. Older servers omit the field.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub metadata: HashMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

// Some clients register instances with `"metadata": null`.
fn null_as_empty<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<HashMap<String, String>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl Instance {
    #[cfg(test)]
    pub fn new(host: impl Into<String>, port: u16, healthy: bool) -> Self {
        Self {
            host: host.into(),
            port,
            healthy,
            enabled: true,
            metadata: HashMap::new(),
        }
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Whether this instance should be scraped at all.
    pub fn is_routable(&self) -> bool {
        self.healthy && self.enabled
    }
}

/// A single Prometheus target group holding exactly one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub targets: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

#[cfg(test)]
impl Target {
    pub fn address(&self) -> &str {
        self.targets.first().map(String::as_str).unwrap_or_default()
    }
}

/// Every target computed in one reconciliation cycle. Serializes as a bare
/// JSON array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Snapshot {
    targets: Vec<Target>,
}

impl Snapshot {
    pub fn new(targets: Vec<Target>) -> Self {
        Self { targets }
    }

    #[cfg(test)]
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Canonical on-disk form: two-space indented JSON plus a trailing newline.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}
