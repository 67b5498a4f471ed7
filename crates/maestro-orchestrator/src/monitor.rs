use crate::types::WorkflowStatus;
use maestro_core::Specialty;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Counters for one specialty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecialtyMetrics {
    /// Attempts handed to agents, retries included.
    pub attempts: u64,
    /// Sub-tasks that passed their gate.
    pub completed: u64,
    /// Sub-tasks that ended failed.
    pub failed: u64,
    /// Attempts beyond the first.
    pub retries: u64,
    /// Attempts scored below the threshold.
    pub quality_failures: u64,
    /// Attempts moved off a failed agent.
    pub reassignments: u64,
    /// Total wall time of finished sub-tasks.
    pub duration_ms: u64,
    /// Sum of final quality scores of completed sub-tasks.
    score_sum: f64,
}

impl SpecialtyMetrics {
    /// Mean final score, once something completed.
    pub fn average_score(&self) -> Option<f64> {
        (self.completed > 0).then(|| self.score_sum / self.completed as f64)
    }
}

/// Workflow outcome counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowCounters {
    /// Workflows accepted by `execute`.
    pub submitted: u64,
    /// Workflows that completed.
    pub completed: u64,
    /// Workflows that failed.
    pub failed: u64,
    /// Workflows cancelled on request.
    pub cancelled: u64,
}

/// Execution metrics across all workflows, keyed by specialty.
#[derive(Clone, Default)]
pub struct ExecutionMonitor {
    specialties: Arc<RwLock<BTreeMap<Specialty, SpecialtyMetrics>>>,
    workflows: Arc<RwLock<WorkflowCounters>>,
}

impl ExecutionMonitor {
    /// Empty counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that an attempt was handed to an agent.
    pub async fn attempt_started(&self, specialty: &Specialty, retry: bool) {
        let mut map = self.specialties.write().await;
        let m = map.entry(specialty.clone()).or_default();
        m.attempts += 1;
        if retry {
            m.retries += 1;
        }
    }

    /// Record a sub-task that passed its gate.
    pub async fn task_completed(&self, specialty: &Specialty, score: f64, duration_ms: u64) {
        let mut map = self.specialties.write().await;
        let m = map.entry(specialty.clone()).or_default();
        m.completed += 1;
        m.score_sum += score;
        m.duration_ms += duration_ms;
    }

    /// Record a sub-task that ended failed.
    pub async fn task_failed(&self, specialty: &Specialty, duration_ms: u64) {
        let mut map = self.specialties.write().await;
        let m = map.entry(specialty.clone()).or_default();
        m.failed += 1;
        m.duration_ms += duration_ms;
    }

    /// Record an attempt scored below the threshold.
    pub async fn quality_failure(&self, specialty: &Specialty) {
        let mut map = self.specialties.write().await;
        map.entry(specialty.clone()).or_default().quality_failures += 1;
    }

    /// Record attempts moved off a failed agent.
    pub async fn reassigned(&self, specialty: &Specialty, count: u32) {
        let mut map = self.specialties.write().await;
        map.entry(specialty.clone()).or_default().reassignments += u64::from(count);
    }

    /// Record an accepted workflow.
    pub async fn workflow_submitted(&self) {
        self.workflows.write().await.submitted += 1;
    }

    /// Record a terminal workflow status.
    pub async fn workflow_finished(&self, status: WorkflowStatus) {
        let mut w = self.workflows.write().await;
        match status {
            WorkflowStatus::Completed => w.completed += 1,
            WorkflowStatus::Failed => w.failed += 1,
            WorkflowStatus::Cancelled => w.cancelled += 1,
            WorkflowStatus::Pending | WorkflowStatus::Running => {}
        }
    }

    /// Counters of one specialty.
    pub async fn get(&self, specialty: &Specialty) -> Option<SpecialtyMetrics> {
        self.specialties.read().await.get(specialty).cloned()
    }

    /// Counters of every specialty seen so far.
    pub async fn snapshot(&self) -> BTreeMap<Specialty, SpecialtyMetrics> {
        self.specialties.read().await.clone()
    }

    /// Workflow outcome counters.
    pub async fn workflows(&self) -> WorkflowCounters {
        self.workflows.read().await.clone()
    }

    /// Totals across every specialty.
    pub async fn aggregate(&self) -> SpecialtyMetrics {
        let map = self.specialties.read().await;
        let mut total = SpecialtyMetrics::default();
        for m in map.values() {
            total.attempts += m.attempts;
            total.completed += m.completed;
            total.failed += m.failed;
            total.retries += m.retries;
            total.quality_failures += m.quality_failures;
            total.reassignments += m.reassignments;
            total.duration_ms += m.duration_ms;
            total.score_sum += m.score_sum;
        }
        total
    }

    /// Serialize everything as one JSON document.
    pub async fn to_json(&self) -> serde_json::Value {
        let specialties: BTreeMap<String, serde_json::Value> = self
            .snapshot()
            .await
            .into_iter()
            .map(|(s, m)| {
                let avg = m.average_score();
                let mut value = serde_json::to_value(&m).unwrap_or_default();
                value["average_score"] = serde_json::json!(avg);
                (s.to_string(), value)
            })
            .collect();
        let aggregate = self.aggregate().await;
        serde_json::json!({
            "specialties": specialties,
            "aggregate": aggregate,
            "average_score": aggregate.average_score(),
            "workflows": self.workflows().await,
        })
    }
}
