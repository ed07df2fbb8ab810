//! Health aggregation
//!
//! Probes run concurrently, each under its own deadline. Only a failed
//! critical dependency makes the service unhealthy; anything else that is
//! not fully healthy is reported as degraded.

mod probe;

pub use probe::{BreakerProbe, CacheProbe, CompositeProbe, Probe, ProbeReport, TcpProbe};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::telemetry;

/// Health of a dependency or of the whole service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully functional
    Healthy,
    /// Serving with reduced capability
    Degraded,
    /// Not able to serve
    Unhealthy,
}

impl HealthStatus {
    /// The worse of two statuses
    #[must_use]
    pub fn worst(self, other: Self) -> Self {
        self.max(other)
    }

    /// Whether the service should receive traffic
    #[must_use]
    pub const fn is_ready(self) -> bool {
        !matches!(self, Self::Unhealthy)
    }

    /// Gauge value: 2 healthy, 1 degraded, 0 unhealthy
    #[must_use]
    pub const fn gauge_value(self) -> f64 {
        match self {
            Self::Healthy => 2.0,
            Self::Degraded => 1.0,
            Self::Unhealthy => 0.0,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        })
    }
}

/// Health of one dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyHealth {
    /// Probe verdict
    pub status: HealthStatus,
    /// Probe detail
    pub detail: String,
    /// Whether failure is fatal for readiness
    pub critical: bool,
    /// Probe duration
    pub latency_ms: u64,
}

/// Point-in-time health of the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    /// Overall verdict
    #[serde(rename = "status")]
    pub overall: HealthStatus,
    /// Per-dependency results
    pub dependencies: BTreeMap<String, DependencyHealth>,
    /// When the probes ran
    pub timestamp: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Classify a set of dependency results
    #[must_use]
    pub fn classify(dependencies: BTreeMap<String, DependencyHealth>) -> Self {
        let overall = dependencies
            .values()
            .map(|dep| match dep.status {
                HealthStatus::Unhealthy if dep.critical => HealthStatus::Unhealthy,
                HealthStatus::Healthy => HealthStatus::Healthy,
                _ => HealthStatus::Degraded,
            })
            .fold(HealthStatus::Healthy, HealthStatus::worst);
        Self {
            overall,
            dependencies,
            timestamp: Utc::now(),
        }
    }
}

/// Liveness report; never probes anything
#[derive(Debug, Clone, Serialize)]
pub struct Liveness {
    /// Always healthy while the process answers
    pub status: HealthStatus,
    /// Report time
    pub timestamp: DateTime<Utc>,
    /// Seconds since start
    pub uptime_secs: u64,
}

/// Runs probes and keeps the last snapshot
pub struct HealthAggregator {
    probes: RwLock<Vec<Arc<dyn Probe>>>,
    probe_timeout: Duration,
    last: RwLock<Option<HealthSnapshot>>,
    started: Instant,
}

impl HealthAggregator {
    /// Create an aggregator with no probes
    #[must_use]
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            probes: RwLock::new(Vec::new()),
            probe_timeout,
            last: RwLock::new(None),
            started: Instant::now(),
        }
    }

    /// Add a probe
    pub fn register(&self, probe: Arc<dyn Probe>) {
        self.probes.write().push(probe);
    }

    /// Replace every probe
    pub fn replace_probes(&self, probes: Vec<Arc<dyn Probe>>) {
        *self.probes.write() = probes;
    }

    /// Names of registered probes
    pub fn probe_names(&self) -> Vec<String> {
        self.probes.read().iter().map(|p| p.name().to_string()).collect()
    }

    /// Run every probe now and classify the results
    pub async fn snapshot(&self) -> HealthSnapshot {
        let probes = self.probes.read().clone();
        let timeout = self.probe_timeout;

        let results = join_all(probes.iter().map(|probe| async move {
            let started = Instant::now();
            let report = tokio::time::timeout(timeout, probe.check())
                .await
                .unwrap_or_else(|_| {
                    ProbeReport::unhealthy(format!("probe timed out after {}ms", timeout.as_millis()))
                });
            let health = DependencyHealth {
                status: report.status,
                detail: report.detail,
                critical: probe.critical(),
                latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            };
            (probe.name().to_string(), health)
        }))
        .await;

        let snapshot = HealthSnapshot::classify(results.into_iter().collect());
        debug!(status = %snapshot.overall, dependencies = snapshot.dependencies.len(), "Health snapshot");
        snapshot
    }

    /// Last snapshot taken by the poll loop
    pub fn last_snapshot(&self) -> Option<HealthSnapshot> {
        self.last.read().clone()
    }

    /// Liveness: process up, dependencies ignored
    #[must_use]
    pub fn liveness(&self) -> Liveness {
        Liveness {
            status: HealthStatus::Healthy,
            timestamp: Utc::now(),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }

    /// Take a snapshot, store it, and log a change of overall status
    pub async fn refresh(&self) -> HealthSnapshot {
        let snapshot = self.snapshot().await;
        let previous = self
            .last
            .write()
            .replace(snapshot.clone())
            .map(|s| s.overall);
        telemetry::set_health_status(snapshot.overall.gauge_value());

        match previous {
            Some(from) if from == snapshot.overall => {}
            Some(from) if snapshot.overall > from => {
                warn!(from = %from, to = %snapshot.overall, "Health status worsened");
            }
            Some(from) => info!(from = %from, to = %snapshot.overall, "Health status improved"),
            None => info!(status = %snapshot.overall, "Initial health status"),
        }
        snapshot
    }

    /// Poll every `interval` until `shutdown` fires
    pub fn spawn_poll(self: &Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        aggregator.refresh().await;
                    }
                    _ = shutdown.recv() => {
                        debug!("Health poll loop stopped");
                        break;
                    }
                }
            }
        })
    }
}
