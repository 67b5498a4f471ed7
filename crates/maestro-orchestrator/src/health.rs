//! Heartbeat classification and the background sweep that drives self-healing.

use crate::bus::{BusStatsSnapshot, CommunicationBus};
use crate::hierarchy::{HierarchyManager, HierarchyStatus};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Liveness derived from heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Heartbeat within half the timeout.
    Healthy,
    /// Heartbeat older than half the timeout.
    Degraded,
    /// Heartbeat timed out.
    Failed,
}

/// `Failed` at the timeout, `Degraded` from half of it.
pub fn classify_heartbeat(age: Duration, timeout: Duration) -> HealthState {
    if age >= timeout {
        HealthState::Failed
    } else if age >= timeout / 2 {
        HealthState::Degraded
    } else {
        HealthState::Healthy
    }
}

/// Point-in-time health of the whole core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Agent counts by layer, specialty and health.
    pub hierarchy: HierarchyStatus,
    /// Bus delivery counters.
    pub bus: BusStatsSnapshot,
    /// No degraded and no failed agents.
    pub healthy: bool,
}

impl HealthReport {
    /// Snapshot the hierarchy and bus.
    pub fn collect(hierarchy: &HierarchyManager, bus: &CommunicationBus) -> Self {
        let status = hierarchy.status();
        let healthy = status.by_health.degraded == 0 && status.by_health.failed == 0;
        Self {
            hierarchy: status,
            bus: bus.stats(),
            healthy,
        }
    }
}

/// Periodic heartbeat sweep over the hierarchy.
///
/// The sweep runs in its own task under a supervisor; a panic inside one
/// sweep restarts the loop instead of silently ending detection.
pub struct HealthMonitor {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl HealthMonitor {
    /// Start sweeping `hierarchy` every `interval`.
    pub fn spawn(hierarchy: HierarchyManager, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let join = tokio::spawn(supervise(hierarchy, interval, cancel.clone()));
        info!(interval_ms = interval.as_millis() as u64, "Health monitor started");
        Self { cancel, join }
    }

    /// Signal the loop to stop without waiting for it.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

async fn supervise(hierarchy: HierarchyManager, interval: Duration, cancel: CancellationToken) {
    loop {
        let worker = tokio::spawn(sweep_loop(hierarchy.clone(), interval, cancel.clone()));
        match worker.await {
            Ok(()) => break,
            Err(e) if e.is_panic() => {
                error!("Health sweep panicked, restarting");
                if cancel.is_cancelled() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    debug!("Health monitor stopped");
}

async fn sweep_loop(hierarchy: HierarchyManager, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match hierarchy.sweep().await {
            Ok(report) => {
                if !report.failed.is_empty() {
                    warn!(failed = ?report.failed, "Sweep healed failed agents");
                }
                if !report.retired.is_empty() || !report.spawned.is_empty() {
                    debug!(retired = ?report.retired, spawned = ?report.spawned, "Sweep resized pools");
                }
            }
            // hierarchy gone, nothing left to watch
            Err(_) => return,
        }
    }
}
