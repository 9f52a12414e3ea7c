use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Instance, ServiceName};

#[cfg(test)]
pub mod memory;
pub mod nacos;
pub use nacos::NacosRegistry;

#[async_trait]
pub trait Registry: Send + Sync {
    /// List every service registered under `namespace` and `group`.
    async fn list_services(&self, namespace: &str, group: &str) -> Result<BTreeSet<ServiceName>>;

    /// List all instances of one service, healthy or not.
    async fn list_instances(
        &self,
        service: &str,
        namespace: &str,
        group: &str,
    ) -> Result<Vec<Instance>>;
}
