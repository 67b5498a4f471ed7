use maestro_core::{MaestroError, MaestroResult, Specialty};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Size bounds of one specialty pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolLimits {
    /// Agents kept alive even when idle.
    #[serde(default)]
    pub min: usize,
    /// Hard cap on live agents of the specialty.
    #[serde(default = "default_pool_max")]
    pub max: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            min: 0,
            max: default_pool_max(),
        }
    }
}

fn default_pool_max() -> usize {
    4
}

/// Delivery settings of the communication bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Delivery attempts into a full mailbox before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff step; doubles per retry.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Cap on a single backoff step.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// TTL for messages sent without an explicit one.
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
    /// Bound of every agent mailbox.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    /// Upper bound for one delivery attempt into a full mailbox.
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            default_ttl_ms: default_ttl_ms(),
            mailbox_capacity: default_mailbox_capacity(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    50
}
fn default_backoff_max_ms() -> u64 {
    2000
}
fn default_ttl_ms() -> u64 {
    30_000
}
fn default_mailbox_capacity() -> usize {
    256
}
fn default_delivery_timeout_ms() -> u64 {
    1000
}

impl BusConfig {
    /// `min(base * 2^attempt, max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        backoff_delay(self.backoff_base_ms, self.backoff_max_ms, attempt)
    }

    /// [`default_ttl_ms`](Self::default_ttl_ms) as a duration.
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    /// [`delivery_timeout_ms`](Self::delivery_timeout_ms) as a duration.
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

/// Exponential backoff capped at `max_ms`.
pub fn backoff_delay(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}

/// Tunables of the orchestration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Concurrent sub-tasks one agent may hold.
    #[serde(default = "default_max_tasks_per_agent")]
    pub max_tasks_per_agent: usize,
    /// Period between agent heartbeats and health sweeps.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Heartbeat age after which an agent counts as failed. Half of it marks
    /// the agent degraded.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Budget from failure detection to reassignment of all its tasks.
    #[serde(default = "default_recovery_window_ms")]
    pub recovery_window_ms: u64,
    /// Idle time after which a worker above its pool minimum retires.
    #[serde(default = "default_retirement_window_ms")]
    pub retirement_window_ms: u64,
    /// Budget for a single attempt.
    #[serde(default = "default_subtask_timeout_ms")]
    pub subtask_timeout_ms: u64,
    /// Upper bound on a whole workflow; preferences may shorten it.
    #[serde(default = "default_workflow_timeout_ms")]
    pub workflow_timeout_ms: u64,
    /// Minimum score in `[0, 1]` for a result to pass its gate.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    /// Total attempts (first run included) before a sub-task below the
    /// threshold goes to override review.
    #[serde(default = "default_max_quality_attempts")]
    pub max_quality_attempts: u32,
    /// Extra attempts after transient execution failures.
    #[serde(default = "default_max_execution_retries")]
    pub max_execution_retries: u32,
    /// Cost per estimated hour in plan estimates.
    #[serde(default = "default_hourly_rate")]
    pub hourly_rate: f64,
    /// Burst agents available to critical-urgency spawns.
    #[serde(default = "default_max_execution_agents")]
    pub max_execution_agents: usize,
    /// Terminal status reports held in memory; older ones are read back
    /// from the state store.
    #[serde(default = "default_archive_capacity")]
    pub archive_capacity: usize,
    /// Pool bounds per specialty.
    #[serde(default)]
    pub pools: HashMap<Specialty, PoolLimits>,
    /// Bounds for specialties without an entry in `pools`.
    #[serde(default)]
    pub default_pool: PoolLimits,
    /// Message bus settings.
    #[serde(default)]
    pub bus: BusConfig,
}

fn default_max_tasks_per_agent() -> usize {
    3
}
fn default_heartbeat_interval_ms() -> u64 {
    1000
}
fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}
fn default_recovery_window_ms() -> u64 {
    30_000
}
fn default_retirement_window_ms() -> u64 {
    300_000
}
fn default_subtask_timeout_ms() -> u64 {
    300_000
}
fn default_workflow_timeout_ms() -> u64 {
    3_600_000
}
fn default_quality_threshold() -> f64 {
    0.85
}
fn default_max_quality_attempts() -> u32 {
    2
}
fn default_max_execution_retries() -> u32 {
    2
}
fn default_hourly_rate() -> f64 {
    50.0
}
fn default_max_execution_agents() -> usize {
    2
}
fn default_archive_capacity() -> usize {
    1024
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_agent: default_max_tasks_per_agent(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            recovery_window_ms: default_recovery_window_ms(),
            retirement_window_ms: default_retirement_window_ms(),
            subtask_timeout_ms: default_subtask_timeout_ms(),
            workflow_timeout_ms: default_workflow_timeout_ms(),
            quality_threshold: default_quality_threshold(),
            max_quality_attempts: default_max_quality_attempts(),
            max_execution_retries: default_max_execution_retries(),
            hourly_rate: default_hourly_rate(),
            max_execution_agents: default_max_execution_agents(),
            archive_capacity: default_archive_capacity(),
            pools: HashMap::new(),
            default_pool: PoolLimits::default(),
            bus: BusConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Pool bounds for a specialty, falling back to `default_pool`.
    pub fn pool_limits(&self, specialty: &Specialty) -> PoolLimits {
        self.pools
            .get(specialty)
            .copied()
            .unwrap_or(self.default_pool)
    }

    /// Heartbeat period as a duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat age that marks an agent failed.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Recovery budget as a duration.
    pub fn recovery_window(&self) -> Duration {
        Duration::from_millis(self.recovery_window_ms)
    }

    /// Retirement window as a duration.
    pub fn retirement_window(&self) -> Duration {
        Duration::from_millis(self.retirement_window_ms)
    }

    /// Per-attempt budget as a duration.
    pub fn subtask_timeout(&self) -> Duration {
        Duration::from_millis(self.subtask_timeout_ms)
    }

    /// Workflow budget as a duration.
    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_millis(self.workflow_timeout_ms)
    }

    /// Backoff between transient execution retries, on the bus schedule.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.bus.backoff_delay(attempt)
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> MaestroResult<()> {
        if self.max_tasks_per_agent == 0 {
            return Err(MaestroError::Config(
                "max_tasks_per_agent must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(MaestroError::Config(format!(
                "quality_threshold must be within [0, 1], got {}",
                self.quality_threshold
            )));
        }
        if self.max_quality_attempts == 0 {
            return Err(MaestroError::Config(
                "max_quality_attempts must be at least 1".into(),
            ));
        }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(MaestroError::Config(format!(
                "heartbeat_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if self.hourly_rate < 0.0 {
            return Err(MaestroError::Config("hourly_rate must not be negative".into()));
        }
        if self.archive_capacity == 0 {
            return Err(MaestroError::Config("archive_capacity must be at least 1".into()));
        }
        if self.bus.mailbox_capacity == 0 {
            return Err(MaestroError::Config("bus.mailbox_capacity must be at least 1".into()));
        }
        for (specialty, limits) in self
            .pools
            .iter()
            .map(|(s, l)| (s.to_string(), l))
            .chain(std::iter::once(("default_pool".to_string(), &self.default_pool)))
        {
            if limits.max == 0 || limits.min > limits.max {
                return Err(MaestroError::Config(format!(
                    "pool '{specialty}' needs 0 <= min <= max and max >= 1 (min={}, max={})",
                    limits.min, limits.max
                )));
            }
        }
        Ok(())
    }
}
