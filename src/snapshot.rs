//! Turns per-service instance lists into a [`Snapshot`].

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use futures_util::stream::{self, StreamExt};
use log::warn;

use crate::error::{Error, Result};
use crate::types::{Instance, ServiceName, Snapshot, Target};

const RESERVED_LABELS: [&str; 3] = ["job", "instance", "service"];

pub struct SnapshotBuilder {
    job: String,
    concurrency: usize,
    passthrough_metadata: bool,
}

/// A built snapshot plus the services that had to be left out of it.
#[derive(Debug)]
pub struct BuildReport {
    pub snapshot: Snapshot,
    pub omitted: Vec<(ServiceName, Error)>,
}

impl SnapshotBuilder {
    pub fn new(job: impl Into<String>, concurrency: usize) -> Self {
        Self {
            job: job.into(),
            concurrency: concurrency.max(1),
            passthrough_metadata: false,
        }
    }

    pub fn with_metadata(mut self, passthrough: bool) -> Self {
        self.passthrough_metadata = passthrough;
        self
    }

    /// Fetch instances for every service (at most `concurrency` at a time)
    /// and assemble the snapshot in lexical service order.
    ///
    /// A service whose fetch fails is omitted and reported; the build itself
    /// never fails. If every fetch fails the snapshot is empty.
    pub async fn build<F, Fut>(&self, services: &BTreeSet<ServiceName>, fetch: F) -> BuildReport
    where
        F: Fn(ServiceName) -> Fut,
        Fut: Future<Output = Result<Vec<Instance>>>,
    {
        // `buffered` yields in input order, so the BTreeSet order survives.
        let results: Vec<(ServiceName, Result<Vec<Instance>>)> =
            stream::iter(services.iter().cloned())
                .map(|service| {
                    let pending = fetch(service.clone());
                    async move { (service, pending.await) }
                })
                .buffered(self.concurrency)
                .collect()
                .await;

        let mut targets = Vec::new();
        let mut omitted = Vec::new();
        for (service, result) in results {
            match result {
                Ok(instances) => targets.extend(self.targets_for(&service, instances)),
                Err(e) => {
                    warn!("Omitting service {} from this cycle: {}", service, e);
                    omitted.push((service, e));
                }
            }
        }

        BuildReport {
            snapshot: Snapshot::new(targets),
            omitted,
        }
    }

    fn targets_for(&self, service: &str, instances: Vec<Instance>) -> Vec<Target> {
        let mut routable: Vec<Instance> = instances
            .into_iter()
            .filter(Instance::is_routable)
            .filter(|instance| {
                let valid = !instance.host.is_empty() && instance.port != 0;
                if !valid {
                    warn!(
                        "Dropping instance of {} with unusable address {:?}:{}",
                        service, instance.host, instance.port
                    );
                }
                valid
            })
            .collect();
        routable.sort_by_key(Instance::address);

        routable
            .into_iter()
            .map(|instance| self.target(service, &instance))
            .collect()
    }

    fn target(&self, service: &str, instance: &Instance) -> Target {
        let address = instance.address();
        let mut labels = BTreeMap::new();

        if self.passthrough_metadata {
            for (key, value) in &instance.metadata {
                let name = sanitize_label_name(key);
                if name.starts_with("__") || RESERVED_LABELS.contains(&name.as_str()) {
                    continue;
                }
                labels.insert(name, value.clone());
            }
        }

        labels.insert("job".to_string(), self.job.clone());
        labels.insert("instance".to_string(), address.clone());
        labels.insert("service".to_string(), service.to_string());

        Target {
            targets: vec![address],
            labels,
        }
    }
}

/// Coerce an arbitrary metadata key into a Prometheus label name
/// (`[a-zA-Z_][a-zA-Z0-9_]*`).
fn sanitize_label_name(key: &str) -> String {
    let mut name: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}
