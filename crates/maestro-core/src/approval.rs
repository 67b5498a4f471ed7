//! Manual override review for sub-tasks that exhausted their quality-gate
//! attempts.
//!
//! These types live in `maestro-core` so that the executor and any reviewer
//! front-end (CLI prompt, webhook callback) can share them.

use crate::{MaestroError, MaestroResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// How far accepting an output would lower the quality bar.
///
/// Graded from the relative shortfall against the threshold, one step
/// higher when the output sits on the plan's critical path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Shortfall under 10% of the threshold.
    Low,
    /// Shortfall under 25% of the threshold.
    Medium,
    /// Anything larger.
    High,
    /// A high shortfall on the critical path.
    Critical,
}

impl RiskLevel {
    /// Grade an override of `best_score` against `threshold`.
    pub fn assess(best_score: f64, threshold: f64, on_critical_path: bool) -> Self {
        let shortfall = if threshold > 0.0 {
            (threshold - best_score) / threshold
        } else {
            0.0
        };
        let base = if shortfall < 0.10 {
            RiskLevel::Low
        } else if shortfall < 0.25 {
            RiskLevel::Medium
        } else {
            // NaN lands here too
            RiskLevel::High
        };
        if on_critical_path {
            base.raised()
        } else {
            base
        }
    }

    fn raised(self) -> Self {
        match self {
            RiskLevel::Low => RiskLevel::Medium,
            RiskLevel::Medium => RiskLevel::High,
            RiskLevel::High | RiskLevel::Critical => RiskLevel::Critical,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for RiskLevel {
    type Err = MaestroError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            other => Err(MaestroError::Config(format!("unknown risk level '{other}'"))),
        }
    }
}

/// A request sent to a reviewer to accept output below the quality threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideRequest {
    /// Execution the output belongs to.
    pub execution_id: Uuid,
    /// `None` for the workflow-level gate.
    pub task_id: Option<Uuid>,
    /// Sub-task description, or the original request at workflow level.
    pub description: String,
    /// Highest score any attempt reached.
    pub best_score: f64,
    /// Threshold the output failed to reach.
    pub threshold: f64,
    /// Graded with [`RiskLevel::assess`].
    pub risk_level: RiskLevel,
    /// Output of the best attempt.
    pub output: serde_json::Value,
}

/// The decision made by a reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideDecision {
    /// Whether the below-threshold output is accepted.
    pub approved: bool,
    /// Free-text justification, copied into the audit trail.
    pub reason: Option<String>,
    /// Who decided, for the audit trail.
    pub reviewer: String,
}

/// Channel through which override requests are sent and decisions received.
/// Implementations can be CLI prompts, webhook callbacks, ticket systems, etc.
#[async_trait]
pub trait OverrideReviewer: Send + Sync {
    /// Decide whether below-threshold output may stand.
    async fn review(&self, request: OverrideRequest) -> MaestroResult<OverrideDecision>;
}

/// Approves overrides up to a risk ceiling and rejects the rest.
#[derive(Debug, Clone, Copy)]
pub struct RiskCeilingReviewer {
    ceiling: RiskLevel,
}

impl RiskCeilingReviewer {
    /// Approve every request graded at or below `ceiling`.
    pub fn new(ceiling: RiskLevel) -> Self {
        Self { ceiling }
    }
}

#[async_trait]
impl OverrideReviewer for RiskCeilingReviewer {
    async fn review(&self, request: OverrideRequest) -> MaestroResult<OverrideDecision> {
        let approved = request.risk_level <= self.ceiling;
        Ok(OverrideDecision {
            approved,
            reason: Some(format!(
                "{} risk (score {:.2}, threshold {:.2}), ceiling {}",
                request.risk_level, request.best_score, request.threshold, self.ceiling
            )),
            reviewer: "risk_ceiling".into(),
        })
    }
}
