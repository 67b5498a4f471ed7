use chrono::{DateTime, Utc};
use maestro_core::{AgentId, AgentLayer, Priority, Specialty};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// Outcomes kept per agent for the success rate.
pub const HISTORY_WINDOW: usize = 20;

/// Coarse size of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityTier {
    /// Short, single-specialty request.
    Simple,
    /// A few clauses or specialties.
    Moderate,
    /// Long or multi-domain request.
    Complex,
    /// Broad scope with scale markers.
    Enterprise,
}

impl ComplexityTier {
    /// Effort multiplier applied to per-specialty base estimates.
    pub fn effort_multiplier(self) -> f64 {
        match self {
            ComplexityTier::Simple => 1.0,
            ComplexityTier::Moderate => 1.5,
            ComplexityTier::Complex => 2.5,
            ComplexityTier::Enterprise => 4.0,
        }
    }

    /// Whether plans of this tier get an oversight review step.
    pub fn needs_oversight(self) -> bool {
        matches!(self, ComplexityTier::Complex | ComplexityTier::Enterprise)
    }
}

impl std::fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComplexityTier::Simple => write!(f, "simple"),
            ComplexityTier::Moderate => write!(f, "moderate"),
            ComplexityTier::Complex => write!(f, "complex"),
            ComplexityTier::Enterprise => write!(f, "enterprise"),
        }
    }
}

/// Status of a sub-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    /// Waiting on dependencies or an agent.
    Pending,
    /// Attempt in flight.
    Running,
    /// Passed its gate or was overridden.
    Completed,
    /// Out of attempts, or blocked upstream.
    Failed,
}

impl SubTaskStatus {
    /// Completed or failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, SubTaskStatus::Completed | SubTaskStatus::Failed)
    }
}

/// One node of a workflow's dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    /// Unique sub-task id.
    pub id: Uuid,
    /// What the specialist should do.
    pub description: String,
    /// Specialty that must run it.
    pub specialty: Specialty,
    /// Sub-tasks that must complete first.
    pub dependencies: Vec<Uuid>,
    /// Agent holding the latest attempt.
    pub assigned_agent: Option<AgentId>,
    /// Lifecycle status.
    pub status: SubTaskStatus,
    /// Output of the passing (or best failing) attempt.
    pub result: Option<serde_json::Value>,
    /// Score of `result`.
    pub quality_score: Option<f64>,
    /// Effort estimate used for the critical path and cost.
    pub estimated_hours: f64,
    /// Attempts started so far.
    pub attempts: u32,
    /// Dispatch priority; raised to the workflow's priority when lower.
    #[serde(default)]
    pub priority: Priority,
    /// Lies on the longest weighted path of the plan.
    #[serde(default)]
    pub critical: bool,
    /// Why the sub-task failed, when it did.
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// When the sub-task was planned.
    pub created_at: DateTime<Utc>,
    /// When the first attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl SubTask {
    /// A pending sub-task with no dependencies.
    pub fn new(description: impl Into<String>, specialty: Specialty, estimated_hours: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            specialty,
            dependencies: Vec::new(),
            assigned_agent: None,
            status: SubTaskStatus::Pending,
            result: None,
            quality_score: None,
            estimated_hours,
            attempts: 0,
            priority: Priority::Normal,
            critical: false,
            failure_reason: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Replace the dependency list.
    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Set the dispatch priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Pending with every dependency completed.
    pub fn is_ready(&self, completed: &HashSet<Uuid>) -> bool {
        self.status == SubTaskStatus::Pending
            && self.dependencies.iter().all(|dep| completed.contains(dep))
    }
}

/// Overall status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Planned, not yet dispatched.
    Pending,
    /// Sub-tasks in flight.
    Running,
    /// Every sub-task completed and the final gate passed.
    Completed,
    /// A sub-task or the final gate failed.
    Failed,
    /// Cancelled by the caller or the timeout.
    Cancelled,
}

impl WorkflowStatus {
    /// Completed, failed or cancelled.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A decomposed request: a DAG of sub-tasks plus estimates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPlan {
    /// Also the execution id.
    pub id: Uuid,
    /// The natural-language request as submitted.
    pub request: String,
    /// Complexity grade of the request.
    pub tier: ComplexityTier,
    /// Decomposer confidence in `[0, 1]`.
    pub confidence: f64,
    /// Sub-tasks in topological order.
    pub subtasks: Vec<SubTask>,
    /// Specialties the plan needs handlers for.
    pub required_specialties: BTreeSet<Specialty>,
    /// Longest weighted dependency chain.
    pub critical_path: Vec<Uuid>,
    /// Hours along the critical path.
    pub estimated_hours: f64,
    /// `estimated_hours` at the configured hourly rate.
    pub estimated_cost: f64,
    /// Current workflow status.
    pub status: WorkflowStatus,
    /// When the plan was produced.
    pub created_at: DateTime<Utc>,
}

impl WorkflowPlan {
    /// Placeholder plan for a request that could not be decomposed.
    pub fn rejected(id: Uuid, request: impl Into<String>) -> Self {
        Self {
            id,
            request: request.into(),
            tier: ComplexityTier::Simple,
            confidence: 0.0,
            subtasks: Vec::new(),
            required_specialties: BTreeSet::new(),
            critical_path: Vec::new(),
            estimated_hours: 0.0,
            estimated_cost: 0.0,
            status: WorkflowStatus::Failed,
            created_at: Utc::now(),
        }
    }

    /// Look up a sub-task by id.
    pub fn subtask(&self, id: Uuid) -> Option<&SubTask> {
        self.subtasks.iter().find(|t| t.id == id)
    }

    /// Ids of completed sub-tasks.
    pub fn completed_ids(&self) -> HashSet<Uuid> {
        self.subtasks
            .iter()
            .filter(|t| t.status == SubTaskStatus::Completed)
            .map(|t| t.id)
            .collect()
    }

    /// Sub-tasks whose dependencies are satisfied and that nobody holds yet.
    pub fn ready_unassigned(&self) -> Vec<&SubTask> {
        let completed = self.completed_ids();
        self.subtasks
            .iter()
            .filter(|t| t.is_ready(&completed) && t.assigned_agent.is_none())
            .collect()
    }

    /// Number of completed sub-tasks.
    pub fn completed_count(&self) -> usize {
        self.subtasks
            .iter()
            .filter(|t| t.status == SubTaskStatus::Completed)
            .count()
    }

    /// Completed share of sub-tasks, 0 for an empty plan.
    pub fn progress_percentage(&self) -> f64 {
        if self.subtasks.is_empty() {
            return 0.0;
        }
        self.completed_count() as f64 * 100.0 / self.subtasks.len() as f64
    }
}

/// Per-task preferences accepted at submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionPreferences {
    /// Overrides the configured threshold; must lie in `[0, 1]`.
    pub quality_threshold: Option<f64>,
    /// Overrides the configured attempts per sub-task.
    pub max_quality_attempts: Option<u32>,
    /// Shortens the workflow timeout; never lengthens it.
    pub deadline_ms: Option<u64>,
    /// Floor for every sub-task's dispatch priority.
    #[serde(default)]
    pub priority: Priority,
}

impl ExecutionPreferences {
    /// Read preferences from a loose key/value map. Unknown keys are ignored.
    pub fn from_map(map: &HashMap<String, serde_json::Value>) -> Self {
        Self {
            quality_threshold: map.get("quality_threshold").and_then(serde_json::Value::as_f64),
            max_quality_attempts: map
                .get("max_quality_attempts")
                .and_then(serde_json::Value::as_u64)
                .and_then(|v| u32::try_from(v).ok()),
            deadline_ms: map.get("deadline_ms").and_then(serde_json::Value::as_u64),
            priority: map
                .get("priority")
                .and_then(serde_json::Value::as_str)
                .map(Priority::parse_level)
                .unwrap_or_default(),
        }
    }
}

// --- Agents ---

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Waiting for work.
    Idle,
    /// Holds reserved slots but runs nothing yet.
    Assigned,
    /// Running a sub-task.
    Busy,
    /// Heartbeat older than half the timeout.
    Degraded,
    /// Missed heartbeats; awaiting purge.
    Failed,
}

impl AgentStatus {
    /// Anything but failed.
    pub fn is_live(self) -> bool {
        !matches!(self, AgentStatus::Failed)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Assigned => write!(f, "assigned"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Degraded => write!(f, "degraded"),
            AgentStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Rolling window of recent task outcomes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceHistory {
    outcomes: VecDeque<bool>,
}

impl PerformanceHistory {
    /// Append an outcome, dropping the oldest past the window.
    pub fn record(&mut self, success: bool) {
        if self.outcomes.len() == HISTORY_WINDOW {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    /// Laplace-smoothed success rate, 0.5 for an agent with no history.
    pub fn success_rate(&self) -> f64 {
        let successes = self.outcomes.iter().filter(|ok| **ok).count();
        (successes as f64 + 1.0) / (self.outcomes.len() as f64 + 2.0)
    }

    /// Outcomes in the window.
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Whether nothing was recorded yet.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// Registry view of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Registry id.
    pub id: AgentId,
    /// Layer in the hierarchy.
    pub layer: AgentLayer,
    /// Specialty served; `executive` and `management` for the upper layers.
    pub specialty: Specialty,
    /// Lifecycle status.
    pub status: AgentStatus,
    /// Reserved and running sub-tasks.
    pub current_tasks: BTreeSet<Uuid>,
    /// Recent outcomes, used to break selection ties.
    pub history: PerformanceHistory,
    /// Workflow coordinated by a management-layer agent.
    #[serde(default)]
    pub execution_id: Option<Uuid>,
    /// When the agent was registered.
    pub created_at: DateTime<Utc>,
    /// Last reservation or finished attempt.
    pub last_active: DateTime<Utc>,
    /// Last heartbeat seen by a sweep.
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentRecord {
    /// An idle agent with no history.
    pub fn new(id: AgentId, layer: AgentLayer, specialty: Specialty) -> Self {
        let now = Utc::now();
        Self {
            id,
            layer,
            specialty,
            status: AgentStatus::Idle,
            current_tasks: BTreeSet::new(),
            history: PerformanceHistory::default(),
            execution_id: None,
            created_at: now,
            last_active: now,
            last_heartbeat: now,
        }
    }

    /// Number of reserved and running sub-tasks.
    pub fn load(&self) -> usize {
        self.current_tasks.len()
    }
}

// --- Execution record ---

/// Kinds of timeline events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    /// Plan accepted.
    WorkflowStarted,
    /// Sub-task reserved on an agent.
    Assigned,
    /// Agent began an attempt.
    Started,
    /// Sub-task passed.
    Completed,
    /// Attempt scheduled again.
    Retried,
    /// Attempt scored below threshold.
    QualityGateFailed,
    /// Sub-task moved to another agent.
    Reassigned,
    /// Issue raised to the executive layer.
    Escalated,
    /// Below-threshold output approved.
    Overridden,
    /// Sub-task failed.
    Failed,
    /// Sub-task will not run.
    Cancelled,
    /// Terminal: completed.
    WorkflowCompleted,
    /// Terminal: failed.
    WorkflowFailed,
    /// Terminal: cancelled.
    WorkflowCancelled,
}

/// One entry of an execution's timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// When it happened.
    pub at: DateTime<Utc>,
    /// What happened.
    pub kind: TimelineKind,
    /// Sub-task involved, if any.
    pub task_id: Option<Uuid>,
    /// Agent involved, if any.
    pub agent_id: Option<AgentId>,
    /// Human-readable detail.
    pub detail: String,
}

/// Result of one quality checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGateOutcome {
    /// `None` for the workflow-level gate.
    pub task_id: Option<Uuid>,
    /// Attempt number that was scored.
    pub attempt: u32,
    /// Score the attempt received.
    pub score: f64,
    /// Threshold in force.
    pub threshold: f64,
    /// `score >= threshold`.
    pub passed: bool,
    /// When the gate ran.
    pub at: DateTime<Utc>,
}

/// An error captured in the audit trail of an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// When the error was recorded.
    pub at: DateTime<Utc>,
    /// Sub-task involved, if any.
    pub task_id: Option<Uuid>,
    /// Taxonomy class, see `MaestroError::category`.
    pub category: String,
    /// Rendered error message.
    pub message: String,
}

/// Final sign-off state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    /// Not reviewed yet.
    Pending,
    /// Final gate passed.
    Approved,
    /// Below threshold but approved by a reviewer.
    Overridden,
    /// Rejected by the gate and any reviewer.
    Rejected,
}

/// Append-only history of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Execution this record belongs to.
    pub execution_id: Uuid,
    /// Events in the order they happened.
    pub timeline: Vec<TimelineEvent>,
    /// Every gate evaluation, sub-task and workflow level.
    pub quality_gates: Vec<QualityGateOutcome>,
    /// Errors in the order they were recorded.
    pub errors: Vec<ErrorEntry>,
    /// Final sign-off state.
    pub approval: ApprovalStatus,
    /// When the execution was submitted.
    pub started_at: DateTime<Utc>,
    /// When it reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    /// Why the execution ended the way it did.
    pub outcome: Option<String>,
}

impl ExecutionRecord {
    /// An empty record started now.
    pub fn new(execution_id: Uuid) -> Self {
        Self {
            execution_id,
            timeline: Vec::new(),
            quality_gates: Vec::new(),
            errors: Vec::new(),
            approval: ApprovalStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
        }
    }

    /// Append a timeline event stamped now.
    pub fn push(
        &mut self,
        kind: TimelineKind,
        task_id: Option<Uuid>,
        agent_id: Option<AgentId>,
        detail: impl Into<String>,
    ) {
        self.timeline.push(TimelineEvent {
            at: Utc::now(),
            kind,
            task_id,
            agent_id,
            detail: detail.into(),
        });
    }

    /// Append an error under its taxonomy category.
    pub fn record_error(&mut self, task_id: Option<Uuid>, error: &maestro_core::MaestroError) {
        self.errors.push(ErrorEntry {
            at: Utc::now(),
            task_id,
            category: error.category().to_string(),
            message: error.to_string(),
        });
    }

    /// Record a gate evaluation. Returns whether it passed.
    pub fn record_gate(&mut self, task_id: Option<Uuid>, attempt: u32, score: f64, threshold: f64) -> bool {
        let passed = score >= threshold;
        self.quality_gates.push(QualityGateOutcome {
            task_id,
            attempt,
            score,
            threshold,
            passed,
            at: Utc::now(),
        });
        passed
    }

    /// Number of timeline events of `kind`.
    pub fn count(&self, kind: TimelineKind) -> usize {
        self.timeline.iter().filter(|e| e.kind == kind).count()
    }
}

// --- Status reporting ---

/// Quality figures of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitySummary {
    /// Threshold the execution runs against.
    pub threshold: f64,
    /// Mean final score of completed sub-tasks.
    pub average_score: Option<f64>,
    /// Lowest final score of completed sub-tasks.
    pub min_score: Option<f64>,
    /// Gate evaluations that passed.
    pub gates_passed: usize,
    /// Gate evaluations that failed.
    pub gates_failed: usize,
}

impl QualitySummary {
    /// Summarize completed sub-tasks of `plan` and the gates in `record`.
    pub fn from_parts(plan: &WorkflowPlan, record: &ExecutionRecord, threshold: f64) -> Self {
        let scores: Vec<f64> = plan
            .subtasks
            .iter()
            .filter(|t| t.status == SubTaskStatus::Completed)
            .filter_map(|t| t.quality_score)
            .collect();
        let average_score = if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        };
        let min_score = scores.iter().copied().reduce(f64::min);
        let gates_passed = record.quality_gates.iter().filter(|g| g.passed).count();
        Self {
            threshold,
            average_score,
            min_score,
            gates_passed,
            gates_failed: record.quality_gates.len() - gates_passed,
        }
    }
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Execution the report describes.
    pub execution_id: Uuid,
    /// Current workflow status.
    pub status: WorkflowStatus,
    /// Completed share of sub-tasks; 100 once completed.
    pub progress_percentage: f64,
    /// Sub-tasks that passed their gate.
    pub completed_tasks: usize,
    /// Sub-tasks in the plan.
    pub total_tasks: usize,
    /// Quality figures.
    pub quality_summary: QualitySummary,
    /// Final sign-off state.
    pub approval: ApprovalStatus,
    /// Why the workflow did not complete, once it ended.
    pub failure_reason: Option<String>,
}
