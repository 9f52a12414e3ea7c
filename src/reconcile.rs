//! Reconciliation loop: fetch → build → write → sleep, until cancelled.
//!
//! A cycle that cannot list services leaves every target file untouched so
//! an outage of Nacos never blanks the targets Prometheus is scraping. A
//! cycle where only some services answered writes what it has.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Error;
use crate::registry::Registry;
use crate::snapshot::SnapshotBuilder;
use crate::types::{ServiceName, Snapshot};
use crate::writer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Fetching,
    Building,
    Writing,
    Sleeping,
}

/// Result of the most recent cycle, for logs, the status file and anyone
/// holding a [`watch::Receiver`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleStatus {
    pub healthy: bool,
    pub finished_at: u64,
    pub targets: usize,
    pub omitted_services: Vec<ServiceName>,
    pub failed_paths: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
pub enum CycleOutcome {
    /// The snapshot was written to at least one destination.
    Written(CycleStatus),
    /// Nothing was written; the previous files are still in place.
    Skipped(CycleStatus),
    Cancelled,
}

pub struct Reconciler {
    registry: Arc<dyn Registry>,
    builder: SnapshotBuilder,
    namespace: String,
    group: String,
    outputs: Vec<PathBuf>,
    status_path: Option<PathBuf>,
    interval: Duration,
    phase: Phase,
    last_written: Option<Snapshot>,
    status: watch::Sender<CycleStatus>,
}

impl Reconciler {
    pub fn new(config: &Config, registry: Arc<dyn Registry>) -> Self {
        let (status, _) = watch::channel(CycleStatus::default());
        Self {
            registry,
            builder: SnapshotBuilder::new(config.job_name.clone(), config.fetch_concurrency)
                .with_metadata(config.passthrough_metadata),
            namespace: config.namespace.clone(),
            group: config.group_name.clone(),
            outputs: config.output_paths.clone(),
            status_path: config.status_path.clone(),
            interval: config.poll_interval(),
            phase: Phase::Idle,
            last_written: None,
            status,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<CycleStatus> {
        self.status.subscribe()
    }

    /// Run cycles back to back, `interval` apart, until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Polling Nacos namespace {} group {} every {}s into {} destination(s)",
            self.namespace,
            self.group,
            self.interval.as_secs(),
            self.outputs.len()
        );

        loop {
            match self.run_cycle(&cancel).await {
                CycleOutcome::Cancelled => break,
                CycleOutcome::Written(status) | CycleOutcome::Skipped(status) => {
                    log_health(&status)
                }
            }

            self.enter(Phase::Sleeping);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        self.enter(Phase::Idle);
        info!("Reconciliation loop stopped");
    }

    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> CycleOutcome {
        if cancel.is_cancelled() {
            return CycleOutcome::Cancelled;
        }

        self.enter(Phase::Fetching);
        let listed = tokio::select! {
            _ = cancel.cancelled() => return CycleOutcome::Cancelled,
            listed = self.registry.list_services(&self.namespace, &self.group) => listed,
        };
        let services = match listed {
            Ok(services) => services,
            Err(e) => {
                error!(
                    "Skipping cycle, could not list services: {}. Keeping the previous target file.",
                    e
                );
                let status = CycleStatus {
                    finished_at: unix_now(),
                    error: Some(e.to_string()),
                    ..CycleStatus::default()
                };
                self.publish(&status).await;
                return CycleOutcome::Skipped(status);
            }
        };

        self.enter(Phase::Building);
        let registry = &*self.registry;
        let namespace = self.namespace.as_str();
        let group = self.group.as_str();
        let report = tokio::select! {
            _ = cancel.cancelled() => return CycleOutcome::Cancelled,
            report = self.builder.build(&services, move |service| async move {
                registry.list_instances(&service, namespace, group).await
            }) => report,
        };
        if cancel.is_cancelled() {
            return CycleOutcome::Cancelled;
        }

        self.enter(Phase::Writing);
        let snapshot = report.snapshot;
        let omitted_services: Vec<ServiceName> =
            report.omitted.into_iter().map(|(service, _)| service).collect();

        let failures = self.write_outputs(&snapshot).await;
        for (path, e) in &failures {
            error!("Failed to write targets to {}: {}", path.display(), e);
        }

        let written = self.outputs.len() - failures.len();
        let status = CycleStatus {
            healthy: written > 0,
            finished_at: unix_now(),
            targets: snapshot.len(),
            omitted_services,
            failed_paths: failures.iter().map(|(path, _)| path.clone()).collect(),
            error: failures.first().map(|(_, e)| e.to_string()),
        };

        if status.healthy {
            if snapshot.is_empty() && !services.is_empty() {
                warn!(
                    "{} services listed but none produced a target, writing an empty target list",
                    services.len()
                );
            }
            let changed = self.last_written.as_ref() != Some(&snapshot);
            info!(
                "Cycle complete: {} targets from {} services ({} omitted), written to {}/{} destinations{}",
                status.targets,
                services.len(),
                status.omitted_services.len(),
                written,
                self.outputs.len(),
                if changed { "" } else { " (unchanged)" }
            );
            self.last_written = Some(snapshot);
        } else {
            error!("Cycle failed: no destination could be written");
        }

        self.publish(&status).await;
        if status.healthy {
            CycleOutcome::Written(status)
        } else {
            CycleOutcome::Skipped(status)
        }
    }

    fn enter(&mut self, phase: Phase) {
        debug!("{:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    async fn write_outputs(&self, snapshot: &Snapshot) -> Vec<(PathBuf, Error)> {
        let outputs = self.outputs.clone();
        let snapshot = snapshot.clone();
        match tokio::task::spawn_blocking(move || writer::write_all(&outputs, &snapshot)).await {
            Ok(failures) => failures,
            Err(e) => self
                .outputs
                .iter()
                .map(|path| (path.clone(), Error::io(path, std::io::Error::other(e.to_string()))))
                .collect(),
        }
    }

    /// Status file first, so a subscriber woken by the channel can rely on it.
    async fn publish(&self, status: &CycleStatus) {
        if let Some(path) = self.status_path.clone() {
            match serde_json::to_vec(status) {
                Ok(bytes) => {
                    let result =
                        tokio::task::spawn_blocking(move || writer::write_bytes(&path, &bytes))
                            .await;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("Failed to write status file: {}", e),
                        Err(e) => warn!("Status writer task failed: {}", e),
                    }
                }
                Err(e) => warn!("Failed to serialize cycle status: {}", e),
            }
        }

        self.status.send_replace(status.clone());
    }
}

/// One line per cycle for orchestration that only scrapes logs.
fn log_health(status: &CycleStatus) {
    if status.healthy {
        debug!(
            "health=ok targets={} omitted={} failed_paths={}",
            status.targets,
            status.omitted_services.len(),
            status.failed_paths.len()
        );
    } else {
        warn!(
            "health=failed error={}",
            status.error.as_deref().unwrap_or("unknown")
        );
    }
}

/// Log whenever the outcome of the latest cycle flips between healthy and
/// failed. Returns once the loop that owns the sender is gone.
pub async fn log_health_transitions(mut status: watch::Receiver<CycleStatus>) {
    let mut healthy = None;
    while status.changed().await.is_ok() {
        let now = status.borrow_and_update().healthy;
        if healthy != Some(now) {
            if now {
                info!("Target discovery is healthy");
            } else {
                warn!("Target discovery is failing, Prometheus keeps the last written targets");
            }
            healthy = Some(now);
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
