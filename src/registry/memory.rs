//! In-memory registry used to drive the builder and the loop in tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::Registry;
use crate::error::{Error, Result};
use crate::types::{Instance, ServiceName};

#[derive(Default)]
pub struct MemoryRegistry {
    services: Mutex<BTreeMap<ServiceName, Vec<Instance>>>,
    failing: Mutex<BTreeSet<ServiceName>>,
    unreachable: AtomicBool,
    instance_queries: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(self, name: &str, instances: Vec<Instance>) -> Self {
        self.set_service(name, instances);
        self
    }

    pub fn set_service(&self, name: &str, instances: Vec<Instance>) {
        self.services
            .lock()
            .unwrap()
            .insert(name.to_string(), instances);
    }

    /// Listed, but every instance query for it fails.
    pub fn fail_service(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn instance_queries(&self) -> usize {
        self.instance_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn list_services(&self, _namespace: &str, _group: &str) -> Result<BTreeSet<ServiceName>> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::unreachable("connection refused"));
        }
        Ok(self.services.lock().unwrap().keys().cloned().collect())
    }

    async fn list_instances(
        &self,
        service: &str,
        _namespace: &str,
        _group: &str,
    ) -> Result<Vec<Instance>> {
        self.instance_queries.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::unreachable("connection refused"));
        }
        if self.failing.lock().unwrap().contains(service) {
            return Err(Error::unreachable(format!("{} timed out", service)));
        }
        self.services
            .lock()
            .unwrap()
            .get(service)
            .cloned()
            .ok_or_else(|| Error::service_not_found(service))
    }
}
