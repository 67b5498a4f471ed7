//! Workflow executor: the top-level driver of a request.
//!
//! `execute` decomposes the request, registers a management-layer
//! coordinator for it and spawns a driver task. The driver owns nothing but
//! its in-flight set: sub-task state lives in a [`TaskQueue`] behind the
//! workflow's lock so status queries see every milestone. Each ready
//! sub-task runs in its own task that dispatches attempts through the
//! hierarchy and applies the quality gate.

use crate::agent::TaskEnvelope;
use crate::bus::{CommunicationBus, Mailbox, MessageKind, SYSTEM_SENDER};
use crate::config::OrchestratorConfig;
use crate::decomposer::{Decompose, HeuristicDecomposer};
use crate::health::{HealthMonitor, HealthReport};
use crate::hierarchy::{AssignRequest, HierarchyManager, TaskOutcome};
use crate::monitor::ExecutionMonitor;
use crate::specialists::SpecialistRegistry;
use crate::task_queue::TaskQueue;
use crate::types::{
    ApprovalStatus, ExecutionPreferences, ExecutionRecord, QualitySummary, StatusReport, SubTask,
    TimelineKind, WorkflowPlan, WorkflowStatus,
};
use chrono::Utc;
use maestro_channels::NotifierManager;
use maestro_core::{
    AgentId, MaestroError, MaestroResult, NotificationEvent, OutputStatus, OverrideRequest,
    OverrideReviewer, Priority, RiskLevel, SpecialistInput, SpecialistOutput,
};
use maestro_security::{AuditLog, AuditOutcome};
use maestro_session::{MemoryStateStore, StateStore};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Turns a specialist output into the score checked by the quality gate.
pub trait QualityScorer: Send + Sync {
    /// Score an attempt in `[0, 1]`.
    fn score(&self, task: &SubTask, output: &SpecialistOutput) -> f64;
}

/// Trusts the specialist's own score, clamped to `[0, 1]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultScorer;

impl QualityScorer for DefaultScorer {
    fn score(&self, _task: &SubTask, output: &SpecialistOutput) -> f64 {
        if output.quality_score.is_nan() {
            0.0
        } else {
            output.quality_score.clamp(0.0, 1.0)
        }
    }
}

/// Persisted form of an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredExecution {
    /// Plan with every sub-task's latest state.
    pub plan: WorkflowPlan,
    /// Timeline, gates and errors.
    pub record: ExecutionRecord,
    /// Report as of the last save.
    pub report: StatusReport,
}

// --- Builder ---

/// Assembles a [`WorkflowExecutor`]. Must be built inside a tokio runtime.
pub struct ExecutorBuilder {
    config: OrchestratorConfig,
    specialists: SpecialistRegistry,
    decomposer: Option<Arc<dyn Decompose>>,
    store: Option<Arc<dyn StateStore>>,
    audit: Option<AuditLog>,
    notifier: NotifierManager,
    reviewer: Option<Arc<dyn OverrideReviewer>>,
    scorer: Arc<dyn QualityScorer>,
    health_monitor: bool,
}

impl ExecutorBuilder {
    /// A builder with in-memory storage, no notifiers and no reviewer.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            specialists: SpecialistRegistry::new(),
            decomposer: None,
            store: None,
            audit: None,
            notifier: NotifierManager::new(),
            reviewer: None,
            scorer: Arc::new(DefaultScorer),
            health_monitor: true,
        }
    }

    /// Handlers available to the hierarchy's agents.
    pub fn specialists(mut self, specialists: SpecialistRegistry) -> Self {
        self.specialists = specialists;
        self
    }

    /// Replace the heuristic decomposer.
    pub fn decomposer(mut self, decomposer: Arc<dyn Decompose>) -> Self {
        self.decomposer = Some(decomposer);
        self
    }

    /// Where execution state is persisted. Defaults to memory.
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Audit trail shared by the bus, hierarchy and executor.
    pub fn audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Destinations for workflow and escalation events.
    pub fn notifier(mut self, notifier: NotifierManager) -> Self {
        self.notifier = notifier;
        self
    }

    /// Consulted when a result stays below the threshold.
    pub fn reviewer(mut self, reviewer: Arc<dyn OverrideReviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    /// Replace the default self-reported scorer.
    pub fn scorer(mut self, scorer: Arc<dyn QualityScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Disable the background heartbeat sweep. Sweeps then only happen
    /// through [`HierarchyManager::sweep`].
    pub fn without_health_monitor(mut self) -> Self {
        self.health_monitor = false;
        self
    }

    /// Validate the config, start the hierarchy and return the executor.
    pub fn build(self) -> MaestroResult<WorkflowExecutor> {
        self.config.validate()?;
        let decomposer = match self.decomposer {
            Some(d) => d,
            None => Arc::new(HeuristicDecomposer::new(self.config.hourly_rate)?),
        };
        let audit = self.audit.unwrap_or_else(AuditLog::in_memory);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStateStore::new()));
        let notifier = Arc::new(self.notifier);
        let specialties = self.specialists.specialties();

        let bus = CommunicationBus::new(self.config.bus.clone(), audit.clone());
        let hierarchy = HierarchyManager::start(
            self.config.clone(),
            self.specialists,
            bus.clone(),
            audit.clone(),
            Arc::clone(&notifier),
        );
        bus.set_help_router(Arc::new(hierarchy.clone()));
        let health = self
            .health_monitor
            .then(|| HealthMonitor::spawn(hierarchy.clone(), self.config.heartbeat_interval()));

        info!(
            specialists = ?specialties,
            threshold = self.config.quality_threshold,
            "Workflow executor ready"
        );

        Ok(WorkflowExecutor {
            inner: Arc::new(Inner {
                config: self.config,
                decomposer,
                hierarchy,
                bus,
                store,
                audit,
                notifier,
                reviewer: self.reviewer,
                scorer: self.scorer,
                monitor: ExecutionMonitor::new(),
                health: Mutex::new(health),
                live: RwLock::new(HashMap::new()),
                archived: RwLock::new(Archive::default()),
            }),
        })
    }
}

// --- Executor ---

struct Inner {
    config: OrchestratorConfig,
    decomposer: Arc<dyn Decompose>,
    hierarchy: HierarchyManager,
    bus: CommunicationBus,
    store: Arc<dyn StateStore>,
    audit: AuditLog,
    notifier: Arc<NotifierManager>,
    reviewer: Option<Arc<dyn OverrideReviewer>>,
    scorer: Arc<dyn QualityScorer>,
    monitor: ExecutionMonitor,
    health: Mutex<Option<HealthMonitor>>,
    live: RwLock<HashMap<Uuid, Arc<Workflow>>>,
    archived: RwLock<Archive>,
}

/// Frozen reports of finished executions, oldest evicted first.
#[derive(Default)]
struct Archive {
    reports: HashMap<Uuid, StatusReport>,
    order: VecDeque<Uuid>,
}

impl Archive {
    fn insert(&mut self, report: StatusReport, capacity: usize) {
        let id = report.execution_id;
        if self.reports.insert(id, report).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.reports.remove(&oldest);
            }
        }
    }

    fn get(&self, id: &Uuid) -> Option<&StatusReport> {
        self.reports.get(id)
    }
}

struct WorkflowState {
    plan: WorkflowPlan,
    queue: TaskQueue,
    record: ExecutionRecord,
    overridden: bool,
}

impl WorkflowState {
    fn plan_snapshot(&self) -> WorkflowPlan {
        let mut plan = self.plan.clone();
        plan.subtasks = self.queue.snapshot();
        plan
    }
}

struct Workflow {
    id: Uuid,
    threshold: f64,
    max_quality_attempts: u32,
    priority: Priority,
    deadline: Duration,
    cancel: CancellationToken,
    state: Mutex<WorkflowState>,
    done: watch::Sender<Option<StatusReport>>,
}

impl Workflow {
    fn report(&self) -> StatusReport {
        if let Some(report) = self.done.borrow().clone() {
            return report;
        }
        let state = self.state.lock();
        build_report(&state, self.threshold)
    }

    fn push(&self, kind: TimelineKind, task_id: Option<Uuid>, agent: Option<AgentId>, detail: impl Into<String>) {
        self.state.lock().record.push(kind, task_id, agent, detail);
    }
}

fn build_report(state: &WorkflowState, threshold: f64) -> StatusReport {
    let plan = state.plan_snapshot();
    let total_tasks = plan.subtasks.len();
    let completed_tasks = plan.completed_count();
    let progress_percentage = if state.plan.status == WorkflowStatus::Completed {
        100.0
    } else {
        plan.progress_percentage()
    };
    StatusReport {
        execution_id: plan.id,
        status: state.plan.status,
        progress_percentage,
        completed_tasks,
        total_tasks,
        quality_summary: QualitySummary::from_parts(&plan, &state.record, threshold),
        approval: state.record.approval,
        failure_reason: state.record.outcome.clone().filter(|_| state.plan.status != WorkflowStatus::Completed),
    }
}

/// Runs workflows end to end. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowExecutor {
    inner: Arc<Inner>,
}

impl WorkflowExecutor {
    /// Start assembling an executor.
    pub fn builder(config: OrchestratorConfig) -> ExecutorBuilder {
        ExecutorBuilder::new(config)
    }

    /// Start a workflow and return its execution id.
    ///
    /// A request that cannot be decomposed still gets an id; its status is
    /// `failed` from the start with the reason in the execution record.
    pub async fn execute(&self, request: &str, preferences: ExecutionPreferences) -> MaestroResult<Uuid> {
        let execution_id = Uuid::new_v4();
        let threshold = preferences
            .quality_threshold
            .unwrap_or(self.inner.config.quality_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(MaestroError::Config(format!(
                "quality_threshold must be within [0, 1], got {threshold}"
            )));
        }
        self.inner.monitor.workflow_submitted().await;
        self.inner.audit.log_action(
            Some(execution_id),
            None,
            "workflow_submitted",
            serde_json::json!({ "request": request }),
            AuditOutcome::Success,
        );

        let (plan, failure) = match self.inner.decomposer.decompose(request).await {
            Ok(mut plan) => {
                plan.id = execution_id;
                (plan, None)
            }
            Err(e) => (WorkflowPlan::rejected(execution_id, request), Some(e)),
        };

        let configured = self.inner.config.workflow_timeout();
        let deadline = preferences
            .deadline_ms
            .map(Duration::from_millis)
            .map_or(configured, |d| d.min(configured));
        let (done, _) = watch::channel(None);
        let mut record = ExecutionRecord::new(execution_id);
        record.push(
            TimelineKind::WorkflowStarted,
            None,
            None,
            format!("{} sub-tasks, tier {}", plan.subtasks.len(), plan.tier),
        );
        let queue = TaskQueue::from_subtasks(plan.subtasks.clone());
        let workflow = Arc::new(Workflow {
            id: execution_id,
            threshold,
            max_quality_attempts: preferences
                .max_quality_attempts
                .unwrap_or(self.inner.config.max_quality_attempts)
                .max(1),
            priority: preferences.priority,
            deadline,
            cancel: CancellationToken::new(),
            state: Mutex::new(WorkflowState {
                plan,
                queue,
                record,
                overridden: false,
            }),
            done,
        });
        self.inner
            .live
            .write()
            .insert(execution_id, Arc::clone(&workflow));

        if let Some(e) = failure {
            warn!(execution_id = %execution_id, error = %e, "Request rejected");
            workflow.state.lock().record.record_error(None, &e);
            let data = serde_json::json!({ "error": e.to_string() });
            escalate(&self.inner, &workflow, SYSTEM_SENDER, "decomposition_failure", None, data).await;
            finish(&self.inner, &workflow, WorkflowStatus::Failed, e.to_string(), None).await;
            return Ok(execution_id);
        }

        let manager = match self.inner.hierarchy.register_manager(execution_id).await {
            Ok(manager) => manager,
            Err(e) => {
                workflow.state.lock().record.record_error(None, &e);
                let data = serde_json::json!({ "error": e.to_string() });
                escalate(&self.inner, &workflow, SYSTEM_SENDER, e.category(), None, data).await;
                finish(&self.inner, &workflow, WorkflowStatus::Failed, e.to_string(), None).await;
                return Ok(execution_id);
            }
        };
        {
            let mut state = workflow.state.lock();
            state.plan.status = WorkflowStatus::Running;
        }
        persist(&self.inner, &workflow).await;
        info!(execution_id = %execution_id, manager = %manager.0, "Workflow started");

        tokio::spawn(drive(Arc::clone(&self.inner), workflow, manager));
        Ok(execution_id)
    }

    /// Submit with loosely typed preferences (`quality_threshold`,
    /// `max_quality_attempts`, `deadline_ms`, `priority`).
    pub async fn submit(
        &self,
        request: &str,
        preferences: &HashMap<String, serde_json::Value>,
    ) -> MaestroResult<Uuid> {
        self.execute(request, ExecutionPreferences::from_map(preferences))
            .await
    }

    /// Execute and wait for the terminal report.
    pub async fn run(&self, request: &str, preferences: ExecutionPreferences) -> MaestroResult<StatusReport> {
        let id = self.execute(request, preferences).await?;
        self.wait(id).await
    }

    /// Current report of a live, finished or persisted execution.
    pub async fn status(&self, execution_id: Uuid) -> MaestroResult<StatusReport> {
        if let Some(report) = self.inner.archived.read().get(&execution_id) {
            return Ok(report.clone());
        }
        let live = self.inner.live.read().get(&execution_id).cloned();
        if let Some(workflow) = live {
            return Ok(workflow.report());
        }
        Ok(self.load(execution_id).await?.report)
    }

    /// Alias of [`status`](Self::status) for callers polling by id.
    pub async fn get_status(&self, execution_id: Uuid) -> MaestroResult<StatusReport> {
        self.status(execution_id).await
    }

    /// Resolve once the execution reaches a terminal status.
    pub async fn wait(&self, execution_id: Uuid) -> MaestroResult<StatusReport> {
        let live = self.inner.live.read().get(&execution_id).cloned();
        let Some(workflow) = live else {
            return self.status(execution_id).await;
        };
        let mut rx = workflow.done.subscribe();
        let report = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| MaestroError::Cancelled(format!("execution {execution_id} dropped")))?
            .clone();
        report.ok_or_else(|| MaestroError::NotFound(format!("execution {execution_id}")))
    }

    /// Cancel a running execution. Returns false when it already finished.
    pub async fn cancel(&self, execution_id: Uuid) -> MaestroResult<bool> {
        let live = self.inner.live.read().get(&execution_id).cloned();
        match live {
            Some(workflow) if workflow.done.borrow().is_none() => {
                info!(execution_id = %execution_id, "Cancelling workflow");
                workflow.cancel.cancel();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                self.status(execution_id).await?;
                Ok(false)
            }
        }
    }

    /// Plan with the latest sub-task state.
    pub async fn plan(&self, execution_id: Uuid) -> MaestroResult<WorkflowPlan> {
        let live = self.inner.live.read().get(&execution_id).cloned();
        match live {
            Some(workflow) => Ok(workflow.state.lock().plan_snapshot()),
            None => Ok(self.load(execution_id).await?.plan),
        }
    }

    /// Timeline, quality gates and errors of an execution.
    pub async fn record(&self, execution_id: Uuid) -> MaestroResult<ExecutionRecord> {
        let live = self.inner.live.read().get(&execution_id).cloned();
        match live {
            Some(workflow) => Ok(workflow.state.lock().record.clone()),
            None => Ok(self.load(execution_id).await?.record),
        }
    }

    async fn load(&self, execution_id: Uuid) -> MaestroResult<StoredExecution> {
        let state = self
            .inner
            .store
            .load_state(execution_id)
            .await?
            .ok_or_else(|| MaestroError::NotFound(format!("execution {execution_id}")))?;
        Ok(serde_json::from_value(state)?)
    }

    /// Executions still in the live set.
    pub fn live_executions(&self) -> Vec<Uuid> {
        self.inner.live.read().keys().copied().collect()
    }

    /// Health snapshot of the hierarchy and bus.
    pub fn health_report(&self) -> HealthReport {
        HealthReport::collect(&self.inner.hierarchy, &self.inner.bus)
    }

    /// Per-specialty and per-workflow counters.
    pub fn metrics(&self) -> &ExecutionMonitor {
        &self.inner.monitor
    }

    /// The agent hierarchy driving sub-tasks.
    pub fn hierarchy(&self) -> &HierarchyManager {
        &self.inner.hierarchy
    }

    /// The bus agents communicate over.
    pub fn bus(&self) -> &CommunicationBus {
        &self.inner.bus
    }

    /// The shared audit trail.
    pub fn audit(&self) -> &AuditLog {
        &self.inner.audit
    }

    /// Settings the executor was built with.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Cancel live workflows, wait for them to settle, then stop the
    /// hierarchy and flush the audit trail.
    pub async fn shutdown(&self) {
        let live: Vec<Arc<Workflow>> = self.inner.live.read().values().cloned().collect();
        for workflow in &live {
            workflow.cancel.cancel();
        }
        for workflow in live {
            let mut rx = workflow.done.subscribe();
            let _ = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(Option::is_some)).await;
        }
        let health = self.inner.health.lock().take();
        if let Some(health) = health {
            health.shutdown().await;
        }
        self.inner.bus.clear_help_router();
        self.inner.hierarchy.shutdown().await;
        self.inner.audit.flush().await;
        info!("Workflow executor shut down");
    }
}

// --- Driver ---

enum TaskResult {
    Completed {
        payload: serde_json::Value,
        score: f64,
        agent: AgentId,
        attempts: u32,
        duration_ms: u64,
        overridden: bool,
    },
    Failed {
        error: MaestroError,
        partial: Option<(serde_json::Value, f64)>,
        attempts: u32,
        duration_ms: u64,
        /// Already escalated by the sub-task runner.
        escalated: bool,
    },
    Cancelled {
        attempts: u32,
    },
}

async fn drive(inner: Arc<Inner>, workflow: Arc<Workflow>, manager: (AgentId, Mailbox)) {
    let (manager_id, mut mailbox) = manager;
    let id = workflow.id;
    let work = workflow.cancel.child_token();
    let deadline = tokio::time::sleep(workflow.deadline);
    tokio::pin!(deadline);

    let mut running: JoinSet<(Uuid, TaskResult)> = JoinSet::new();
    let mut launched: HashSet<Uuid> = HashSet::new();
    let mut critical_of: HashMap<Uuid, bool> = HashMap::new();
    let mut failure: Option<String> = None;
    let mut mailbox_open = true;

    let outcome = loop {
        if failure.is_none() {
            if let Err(e) = launch_ready(&inner, &workflow, manager_id, &work, &mut running, &mut launched, &mut critical_of).await {
                error!(execution_id = %id, error = %e, "Assignment failed");
                workflow.state.lock().record.record_error(None, &e);
                escalate(&inner, &workflow, manager_id, "assignment_failure", None, serde_json::json!({ "error": e.to_string() })).await;
                failure = Some(e.to_string());
            }
        }

        if running.is_empty() {
            let state = workflow.state.lock();
            if let Some(reason) = failure.clone() {
                break (WorkflowStatus::Failed, reason);
            }
            if state.queue.all_completed() {
                break (WorkflowStatus::Completed, String::new());
            }
            if state.queue.all_ready().is_empty() {
                break (WorkflowStatus::Failed, "workflow stalled with unreachable sub-tasks".to_string());
            }
            // ready work exists but nothing launched; loop back to retry after the next event
        }

        tokio::select! {
            _ = workflow.cancel.cancelled() => {
                break (WorkflowStatus::Cancelled, "cancelled by request".to_string());
            }
            _ = &mut deadline => {
                let e = MaestroError::Timeout(format!("workflow deadline of {} ms exceeded", workflow.deadline.as_millis()));
                workflow.state.lock().record.record_error(None, &e);
                break (WorkflowStatus::Failed, e.to_string());
            }
            joined = running.join_next(), if !running.is_empty() => {
                let Some(joined) = joined else { continue };
                let (task_id, result) = match joined {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(execution_id = %id, error = %e, "Sub-task runner crashed");
                        let e = MaestroError::permanent(format!("sub-task runner crashed: {e}"));
                        workflow.state.lock().record.record_error(None, &e);
                        failure.get_or_insert(e.to_string());
                        continue;
                    }
                };
                let critical = critical_of.get(&task_id).copied().unwrap_or(false);
                if let Some(reason) = settle(&inner, &workflow, manager_id, task_id, result).await {
                    if critical {
                        warn!(execution_id = %id, task_id = %task_id, "Critical sub-task failed, failing workflow");
                        break (WorkflowStatus::Failed, reason);
                    }
                    info!(execution_id = %id, task_id = %task_id, "Sub-task failed, draining in-flight work");
                    failure.get_or_insert(reason);
                }
                persist(&inner, &workflow).await;
            }
            message = mailbox.recv(), if mailbox_open => match message {
                Some(msg) => match msg.kind {
                    MessageKind::DeliveryFailure { message_id, reason } => {
                        warn!(execution_id = %id, message_id = %message_id, reason = %reason, "Coordinator message undeliverable");
                    }
                    other => debug!(execution_id = %id, kind = other.name(), "Coordinator message"),
                },
                None => mailbox_open = false,
            },
        }
    };

    // stop whatever is still in flight
    work.cancel();
    let in_flight = workflow.state.lock().queue.running_ids();
    if !in_flight.is_empty() {
        let _ = inner.hierarchy.cancel_tasks(in_flight).await;
    }
    running.abort_all();
    while running.join_next().await.is_some() {}
    {
        let mut state = workflow.state.lock();
        for task_id in state.queue.running_ids() {
            state.queue.mark_failed(task_id, "cancelled before completion".to_string(), None);
        }
    }

    let (status, reason) = outcome;
    let (status, reason) = if status == WorkflowStatus::Completed {
        final_gate(&inner, &workflow, manager_id).await
    } else {
        (status, reason)
    };
    finish(&inner, &workflow, status, reason, Some(manager_id)).await;
}

/// Dispatch every ready sub-task that is not yet launched.
#[allow(clippy::too_many_arguments)]
async fn launch_ready(
    inner: &Arc<Inner>,
    workflow: &Arc<Workflow>,
    manager_id: AgentId,
    work: &CancellationToken,
    running: &mut JoinSet<(Uuid, TaskResult)>,
    launched: &mut HashSet<Uuid>,
    critical_of: &mut HashMap<Uuid, bool>,
) -> MaestroResult<()> {
    let ready: Vec<SubTask> = workflow
        .state
        .lock()
        .queue
        .all_ready()
        .into_iter()
        .filter(|t| !launched.contains(&t.id))
        .cloned()
        .collect();
    if ready.is_empty() {
        return Ok(());
    }

    let requests = ready
        .iter()
        .map(|t| AssignRequest {
            task_id: t.id,
            specialty: t.specialty.clone(),
            priority: t.priority.max(workflow.priority),
        })
        .collect();
    let assigned = inner.hierarchy.assign_ready(requests).await?;

    for task in ready {
        let agent = assigned.get(&task.id).copied();
        let input = {
            let mut state = workflow.state.lock();
            state.queue.mark_running(task.id)?;
            if let Some(agent) = agent {
                state.queue.assign(task.id, agent);
                state.record.push(TimelineKind::Assigned, Some(task.id), Some(agent), task.specialty.to_string());
            }
            SpecialistInput {
                description: task.description.clone(),
                request: state.plan.request.clone(),
                upstream: state.queue.upstream_results(task.id),
                context: serde_json::json!({
                    "execution_id": workflow.id,
                    "coordinator": manager_id,
                }),
            }
        };
        debug!(execution_id = %workflow.id, task_id = %task.id, specialty = %task.specialty, "Sub-task launched");
        launched.insert(task.id);
        critical_of.insert(task.id, task.critical);
        running.spawn(run_subtask(
            Arc::clone(inner),
            Arc::clone(workflow),
            manager_id,
            task,
            input,
            work.clone(),
        ));
    }
    Ok(())
}

/// Apply a finished sub-task to the queue. Returns the failure reason when
/// the sub-task did not complete.
async fn settle(
    inner: &Arc<Inner>,
    workflow: &Arc<Workflow>,
    manager_id: AgentId,
    task_id: Uuid,
    result: TaskResult,
) -> Option<String> {
    let specialty = workflow
        .state
        .lock()
        .queue
        .get(task_id)
        .map(|t| t.specialty.clone())?;
    match result {
        TaskResult::Completed {
            payload,
            score,
            agent,
            attempts,
            duration_ms,
            overridden,
        } => {
            {
                let mut state = workflow.state.lock();
                if let Some(task) = state.queue.get_mut(task_id) {
                    task.attempts = attempts;
                    task.assigned_agent = Some(agent);
                }
                state.queue.mark_completed(task_id, payload, score);
                state.overridden |= overridden;
                state.record.push(
                    TimelineKind::Completed,
                    Some(task_id),
                    Some(agent),
                    format!("score {score:.2}"),
                );
            }
            inner.monitor.task_completed(&specialty, score, duration_ms).await;
            info!(execution_id = %workflow.id, task_id = %task_id, score, "Sub-task completed");
            None
        }
        TaskResult::Failed {
            error,
            partial,
            attempts,
            duration_ms,
            escalated,
        } => {
            let reason = error.to_string();
            {
                let mut state = workflow.state.lock();
                if let Some(task) = state.queue.get_mut(task_id) {
                    task.attempts = attempts;
                }
                state.queue.mark_failed(task_id, reason.clone(), partial);
                state.record.record_error(Some(task_id), &error);
                state.record.push(TimelineKind::Failed, Some(task_id), None, reason.clone());
                for blocked in state.queue.block_downstream(task_id) {
                    state.record.push(
                        TimelineKind::Cancelled,
                        Some(blocked),
                        None,
                        format!("upstream {task_id} failed"),
                    );
                }
            }
            inner.monitor.task_failed(&specialty, duration_ms).await;
            warn!(execution_id = %workflow.id, task_id = %task_id, error = %reason, "Sub-task failed");
            if !escalated {
                escalate(
                    inner,
                    workflow,
                    manager_id,
                    error.category(),
                    Some(task_id),
                    serde_json::json!({ "error": reason }),
                )
                .await;
            }
            Some(reason)
        }
        TaskResult::Cancelled { attempts } => {
            let mut state = workflow.state.lock();
            if let Some(task) = state.queue.get_mut(task_id) {
                task.attempts = attempts;
            }
            state.queue.mark_failed(task_id, "cancelled".to_string(), None);
            state.record.push(TimelineKind::Cancelled, Some(task_id), None, "cancelled");
            Some("sub-task cancelled".to_string())
        }
    }
}

/// Drive one sub-task through its attempts: transient retries with backoff,
/// then the quality gate, then escalation and override review.
async fn run_subtask(
    inner: Arc<Inner>,
    workflow: Arc<Workflow>,
    manager_id: AgentId,
    task: SubTask,
    input: SpecialistInput,
    work: CancellationToken,
) -> (Uuid, TaskResult) {
    let task_id = task.id;
    let started = tokio::time::Instant::now();
    let elapsed = |s: tokio::time::Instant| u64::try_from(s.elapsed().as_millis()).unwrap_or(u64::MAX);
    let mut attempt: u32 = 0;
    let mut quality_attempts: u32 = 0;
    let mut transient_retries: u32 = 0;
    let mut best: Option<(serde_json::Value, f64)> = None;

    loop {
        attempt += 1;
        if work.is_cancelled() {
            return (task_id, TaskResult::Cancelled { attempts: attempt - 1 });
        }
        inner.monitor.attempt_started(&task.specialty, attempt > 1).await;
        let envelope = TaskEnvelope {
            execution_id: workflow.id,
            task_id,
            specialty: task.specialty.clone(),
            priority: task.priority.max(workflow.priority),
            input: input.clone(),
            attempt,
            cancel: work.child_token(),
            timeout: inner.config.subtask_timeout(),
        };
        let outcome = match dispatch(&inner, envelope).await {
            Ok(outcome) => outcome,
            Err(error) => {
                return (
                    task_id,
                    TaskResult::Failed {
                        error,
                        partial: best,
                        attempts: attempt,
                        duration_ms: elapsed(started),
                        escalated: false,
                    },
                )
            }
        };
        record_attempt(&inner, &workflow, &task, &outcome).await;

        let error = match outcome.result {
            Ok(output) if output.status == OutputStatus::Completed => {
                quality_attempts += 1;
                let score = inner.scorer.score(&task, &output);
                let passed = workflow.state.lock().record.record_gate(
                    Some(task_id),
                    attempt,
                    score,
                    workflow.threshold,
                );
                if passed {
                    return (
                        task_id,
                        TaskResult::Completed {
                            payload: output.payload,
                            score,
                            agent: outcome.agent_id,
                            attempts: attempt,
                            duration_ms: elapsed(started),
                            overridden: false,
                        },
                    );
                }
                inner.monitor.quality_failure(&task.specialty).await;
                workflow.push(
                    TimelineKind::QualityGateFailed,
                    Some(task_id),
                    Some(outcome.agent_id),
                    format!("score {score:.2} below {:.2}", workflow.threshold),
                );
                if best.as_ref().map_or(true, |(_, b)| score > *b) {
                    best = Some((output.payload, score));
                }
                if quality_attempts < workflow.max_quality_attempts {
                    workflow.push(TimelineKind::Retried, Some(task_id), None, "quality gate");
                    continue;
                }
                break;
            }
            Ok(output) => {
                let reason = output
                    .payload
                    .get("error")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("specialist reported failure")
                    .to_string();
                if output.status == OutputStatus::TransientFailure {
                    MaestroError::transient(reason)
                } else {
                    MaestroError::permanent(reason)
                }
            }
            Err(MaestroError::Cancelled(_)) => {
                return (task_id, TaskResult::Cancelled { attempts: attempt });
            }
            Err(e) => e,
        };

        if error.is_transient() && transient_retries < inner.config.max_execution_retries {
            let delay = inner.config.retry_delay(transient_retries);
            transient_retries += 1;
            workflow.state.lock().record.record_error(Some(task_id), &error);
            workflow.push(TimelineKind::Retried, Some(task_id), None, error.to_string());
            debug!(task_id = %task_id, delay_ms = delay.as_millis() as u64, "Retrying after transient failure");
            tokio::select! {
                _ = work.cancelled() => return (task_id, TaskResult::Cancelled { attempts: attempt }),
                _ = tokio::time::sleep(delay) => continue,
            }
        }
        return (
            task_id,
            TaskResult::Failed {
                error,
                partial: best,
                attempts: attempt,
                duration_ms: elapsed(started),
                escalated: false,
            },
        );
    }

    // quality attempts exhausted
    let (payload, score) = best.unwrap_or((serde_json::Value::Null, 0.0));
    escalate(
        &inner,
        &workflow,
        manager_id,
        "quality_gate_failure",
        Some(task_id),
        serde_json::json!({
            "best_score": score,
            "threshold": workflow.threshold,
            "attempts": quality_attempts,
        }),
    )
    .await;

    let request = OverrideRequest {
        execution_id: workflow.id,
        task_id: Some(task_id),
        description: task.description.clone(),
        best_score: score,
        threshold: workflow.threshold,
        risk_level: RiskLevel::assess(score, workflow.threshold, task.critical),
        output: payload.clone(),
    };
    if review(&inner, &workflow, request).await {
        return (
            task_id,
            TaskResult::Completed {
                payload,
                score,
                agent: task.assigned_agent.unwrap_or(manager_id),
                attempts: attempt,
                duration_ms: elapsed(started),
                overridden: true,
            },
        );
    }
    (
        task_id,
        TaskResult::Failed {
            error: MaestroError::QualityGate {
                task_id,
                score,
                threshold: workflow.threshold,
            },
            partial: Some((payload, score)),
            attempts: attempt,
            duration_ms: elapsed(started),
            escalated: true,
        },
    )
}

async fn dispatch(inner: &Inner, envelope: TaskEnvelope) -> MaestroResult<TaskOutcome> {
    let task_id = envelope.task_id;
    let rx = inner.hierarchy.dispatch(envelope).await?;
    rx.await
        .map_err(|_| MaestroError::transient(format!("outcome of sub-task {task_id} was dropped")))
}

async fn record_attempt(inner: &Inner, workflow: &Workflow, task: &SubTask, outcome: &TaskOutcome) {
    if outcome.reassignments > 0 {
        inner.monitor.reassigned(&task.specialty, outcome.reassignments).await;
        workflow.push(
            TimelineKind::Reassigned,
            Some(task.id),
            Some(outcome.agent_id),
            format!("{} reassignment(s) after agent failure", outcome.reassignments),
        );
    }
    let mut state = workflow.state.lock();
    for failed in &outcome.failed_agents {
        state
            .record
            .record_error(Some(task.id), &MaestroError::AgentFailure(*failed));
    }
    if let Some(t) = state.queue.get_mut(task.id) {
        t.assigned_agent = Some(outcome.agent_id);
        t.attempts = outcome.attempt;
    }
    state.record.push(
        TimelineKind::Started,
        Some(task.id),
        Some(outcome.agent_id),
        format!("attempt {} in {} ms", outcome.attempt, outcome.duration_ms),
    );
}

/// Ask the reviewer to accept output below the threshold. No reviewer, a
/// reviewer error or a rejection all mean no.
async fn review(inner: &Inner, workflow: &Workflow, request: OverrideRequest) -> bool {
    let Some(reviewer) = inner.reviewer.as_ref() else {
        debug!(execution_id = %workflow.id, "No override reviewer configured");
        return false;
    };
    let task_id = request.task_id;
    let best_score = request.best_score;
    let risk_level = request.risk_level;
    match reviewer.review(request).await {
        Ok(decision) => {
            let detail = decision.reason.clone().unwrap_or_default();
            inner.audit.log_action(
                Some(workflow.id),
                None,
                "quality_override",
                serde_json::json!({
                    "task_id": task_id,
                    "approved": decision.approved,
                    "reviewer": decision.reviewer,
                    "best_score": best_score,
                    "risk_level": risk_level,
                    "reason": decision.reason,
                }),
                if decision.approved {
                    AuditOutcome::Success
                } else {
                    AuditOutcome::Failure
                },
            );
            if decision.approved {
                workflow.push(TimelineKind::Overridden, task_id, None, format!("approved by {}: {detail}", decision.reviewer));
            }
            decision.approved
        }
        Err(e) => {
            warn!(execution_id = %workflow.id, error = %e, "Override review failed");
            workflow.state.lock().record.record_error(task_id, &e);
            false
        }
    }
}

/// Raise an issue to the executive layer on behalf of `sender`, which is the
/// workflow's coordinator or [`SYSTEM_SENDER`] before one exists.
async fn escalate(
    inner: &Inner,
    workflow: &Workflow,
    sender: AgentId,
    issue_type: &str,
    task_id: Option<Uuid>,
    mut data: serde_json::Value,
) {
    data["execution_id"] = serde_json::json!(workflow.id);
    data["task_id"] = serde_json::json!(task_id);
    workflow.push(TimelineKind::Escalated, task_id, Some(sender), issue_type);
    if let Err(e) = inner.bus.escalate(sender, issue_type, data).await {
        warn!(execution_id = %workflow.id, error = %e, "Escalation undeliverable");
    }
}

/// Workflow-level gate over the mean score of all sub-tasks.
async fn final_gate(inner: &Inner, workflow: &Workflow, manager_id: AgentId) -> (WorkflowStatus, String) {
    let (mean, output) = {
        let mut state = workflow.state.lock();
        let plan = state.plan_snapshot();
        let summary = QualitySummary::from_parts(&plan, &state.record, workflow.threshold);
        let mean = summary.average_score.unwrap_or(1.0);
        let output: serde_json::Map<String, serde_json::Value> = plan
            .subtasks
            .iter()
            .filter_map(|t| t.result.clone().map(|r| (t.id.to_string(), r)))
            .collect();
        if state.record.record_gate(None, 1, mean, workflow.threshold) {
            return (WorkflowStatus::Completed, String::new());
        }
        (mean, output)
    };
    escalate(
        inner,
        workflow,
        manager_id,
        "quality_gate_failure",
        None,
        serde_json::json!({ "mean_score": mean, "threshold": workflow.threshold }),
    )
    .await;
    let request = OverrideRequest {
        execution_id: workflow.id,
        task_id: None,
        description: workflow.state.lock().plan.request.clone(),
        best_score: mean,
        threshold: workflow.threshold,
        risk_level: RiskLevel::assess(mean, workflow.threshold, true),
        output: serde_json::Value::Object(output),
    };
    if review(inner, workflow, request).await {
        workflow.state.lock().overridden = true;
        (WorkflowStatus::Completed, String::new())
    } else {
        (
            WorkflowStatus::Failed,
            format!(
                "workflow quality {mean:.2} below threshold {:.2}",
                workflow.threshold
            ),
        )
    }
}

/// Freeze the terminal report, persist, notify and archive.
async fn finish(
    inner: &Inner,
    workflow: &Arc<Workflow>,
    status: WorkflowStatus,
    reason: String,
    manager: Option<AgentId>,
) {
    let (report, total_tasks, completed_tasks) = {
        let mut state = workflow.state.lock();
        state.plan.status = status;
        let kind = match status {
            WorkflowStatus::Completed => TimelineKind::WorkflowCompleted,
            WorkflowStatus::Cancelled => TimelineKind::WorkflowCancelled,
            _ => TimelineKind::WorkflowFailed,
        };
        state.record.approval = match status {
            WorkflowStatus::Completed if state.overridden => ApprovalStatus::Overridden,
            WorkflowStatus::Completed => ApprovalStatus::Approved,
            _ => ApprovalStatus::Rejected,
        };
        let outcome = if status == WorkflowStatus::Completed {
            "all sub-tasks passed the quality gate".to_string()
        } else {
            reason.clone()
        };
        state.record.push(kind, None, manager, outcome.clone());
        state.record.outcome = Some(outcome);
        state.record.finished_at = Some(Utc::now());
        let report = build_report(&state, workflow.threshold);
        (report, state.queue.total_count(), state.queue.completed_count())
    };

    inner
        .archived
        .write()
        .insert(report.clone(), inner.config.archive_capacity);
    persist(inner, workflow).await;
    inner.monitor.workflow_finished(status).await;
    inner.audit.log_action(
        Some(workflow.id),
        manager,
        "workflow_finished",
        serde_json::json!({
            "status": status,
            "completed_tasks": completed_tasks,
            "total_tasks": total_tasks,
            "reason": reason,
        }),
        match status {
            WorkflowStatus::Completed => AuditOutcome::Success,
            _ => AuditOutcome::Failure,
        },
    );

    let event = match status {
        WorkflowStatus::Completed => Some(NotificationEvent::WorkflowCompleted {
            execution_id: workflow.id,
            total_tasks,
            at: Utc::now(),
        }),
        WorkflowStatus::Failed => Some(NotificationEvent::WorkflowFailed {
            execution_id: workflow.id,
            reason: reason.clone(),
            completed_tasks,
            total_tasks,
            at: Utc::now(),
        }),
        _ => None,
    };
    if let Some(event) = event {
        inner.notifier.broadcast(&event).await;
    }
    if let Some(manager) = manager {
        inner.hierarchy.release_manager(manager);
    }

    match status {
        WorkflowStatus::Completed => info!(execution_id = %workflow.id, total_tasks, "Workflow completed"),
        _ => warn!(execution_id = %workflow.id, status = %status, reason = %reason, completed_tasks, total_tasks, "Workflow ended"),
    }
    workflow.done.send_replace(Some(report));
    inner.live.write().remove(&workflow.id);
}

async fn persist(inner: &Inner, workflow: &Workflow) {
    let stored = {
        let state = workflow.state.lock();
        StoredExecution {
            plan: state.plan_snapshot(),
            record: state.record.clone(),
            report: build_report(&state, workflow.threshold),
        }
    };
    let value = match serde_json::to_value(&stored) {
        Ok(value) => value,
        Err(e) => {
            error!(execution_id = %workflow.id, error = %e, "Failed to serialize execution");
            return;
        }
    };
    if let Err(e) = inner.store.save_state(workflow.id, &value).await {
        warn!(execution_id = %workflow.id, error = %e, "Failed to persist execution");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use maestro_core::{OverrideDecision, RiskCeilingReviewer, SpecialistHandler, Specialty, TaskContext};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        specialty: Specialty,
        scores: Vec<f64>,
        calls: AtomicU32,
        delay_ms: u64,
    }

    impl Scripted {
        fn new(specialty: Specialty, scores: Vec<f64>) -> Arc<Self> {
            Arc::new(Self {
                specialty,
                scores,
                calls: AtomicU32::new(0),
                delay_ms: 1,
            })
        }
    }

    #[async_trait]
    impl SpecialistHandler for Scripted {
        fn specialty(&self) -> Specialty {
            self.specialty.clone()
        }

        async fn execute(&self, ctx: &TaskContext, input: SpecialistInput) -> MaestroResult<SpecialistOutput> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            ctx.checkpoint()?;
            let score = self.scores.get(n).or(self.scores.last()).copied().unwrap_or(1.0);
            Ok(SpecialistOutput::completed(
                serde_json::json!({ "text": input.description, "upstream": input.upstream.len() }),
                score,
            ))
        }
    }

    struct Flaky {
        failures: AtomicU32,
    }

    #[async_trait]
    impl SpecialistHandler for Flaky {
        fn specialty(&self) -> Specialty {
            Specialty::Research
        }

        async fn execute(&self, _ctx: &TaskContext, _input: SpecialistInput) -> MaestroResult<SpecialistOutput> {
            if self.failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Ok(SpecialistOutput::failed("upstream busy", true));
            }
            Ok(SpecialistOutput::completed(serde_json::json!("ok"), 0.95))
        }
    }

    struct Approve(bool);

    #[async_trait]
    impl OverrideReviewer for Approve {
        async fn review(&self, _request: OverrideRequest) -> MaestroResult<OverrideDecision> {
            Ok(OverrideDecision {
                approved: self.0,
                reason: Some("checked by hand".into()),
                reviewer: "tester".into(),
            })
        }
    }

    fn config() -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.bus.backoff_base_ms = 1;
        config
    }

    fn executor(registry: SpecialistRegistry) -> WorkflowExecutor {
        WorkflowExecutor::builder(config())
            .specialists(registry)
            .without_health_monitor()
            .build()
            .unwrap()
    }

    fn research_and_write(research: Vec<f64>, writing: Vec<f64>) -> SpecialistRegistry {
        SpecialistRegistry::new()
            .with(Scripted::new(Specialty::Research, research))
            .with(Scripted::new(Specialty::Writing, writing))
    }

    const REQUEST: &str = "Research renewable energy trends and write a two-paragraph summary";

    #[tokio::test]
    async fn test_happy_path_completes() {
        let exec = executor(research_and_write(vec![0.9], vec![0.95]));
        let report = exec.run(REQUEST, ExecutionPreferences::default()).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(report.total_tasks, 2);
        assert_eq!(report.completed_tasks, 2);
        assert_eq!(report.progress_percentage, 100.0);
        assert_eq!(report.approval, ApprovalStatus::Approved);

        let plan = exec.plan(report.execution_id).await.unwrap();
        let writing = plan.subtasks.iter().find(|t| t.specialty == Specialty::Writing).unwrap();
        assert_eq!(writing.result.as_ref().unwrap()["upstream"], 1);
        assert!(exec.live_executions().is_empty());
    }

    #[tokio::test]
    async fn test_empty_request_fails_immediately() {
        let exec = executor(research_and_write(vec![0.9], vec![0.9]));
        let id = exec.execute("", ExecutionPreferences::default()).await.unwrap();
        let report = exec.status(id).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Failed);
        assert_eq!(report.failure_reason.as_deref(), Some("Decomposition error: empty_request"));
        let record = exec.record(id).await.unwrap();
        assert_eq!(record.errors[0].category, "decomposition");
        assert_eq!(record.count(TimelineKind::Escalated), 1);
        let escalation = exec
            .audit()
            .entries_for(id)
            .into_iter()
            .find(|e| e.action == "escalation")
            .unwrap();
        assert_eq!(escalation.details["issue_type"], "decomposition_failure");
    }

    #[tokio::test]
    async fn test_quality_gate_exhaustion_fails_workflow() {
        let exec = executor(research_and_write(vec![0.9], vec![0.7, 0.7]));
        let report = exec.run(REQUEST, ExecutionPreferences::default()).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Failed);
        assert_eq!(report.completed_tasks, 1);
        assert!(report.failure_reason.unwrap().starts_with("Quality gate failure"));

        let record = exec.record(report.execution_id).await.unwrap();
        assert_eq!(record.count(TimelineKind::QualityGateFailed), 2);
        assert_eq!(record.count(TimelineKind::Escalated), 1);
        assert!(exec
            .audit()
            .entries_for(report.execution_id)
            .iter()
            .any(|e| e.action == "escalation"));
    }

    #[tokio::test]
    async fn test_override_approval_completes_workflow() {
        let exec = WorkflowExecutor::builder(config())
            .specialists(research_and_write(vec![0.9], vec![0.6]))
            .reviewer(Arc::new(Approve(true)))
            .without_health_monitor()
            .build()
            .unwrap();
        let report = exec.run(REQUEST, ExecutionPreferences::default()).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(report.approval, ApprovalStatus::Overridden);
    }

    #[tokio::test]
    async fn test_risk_ceiling_bounds_overrides() {
        let run = |writing: f64| async move {
            let exec = WorkflowExecutor::builder(config())
                .specialists(research_and_write(vec![0.95], vec![writing]))
                .reviewer(Arc::new(RiskCeilingReviewer::new(RiskLevel::Medium)))
                .without_health_monitor()
                .build()
                .unwrap();
            let report = exec.run(REQUEST, ExecutionPreferences::default()).await.unwrap();
            let reviews: Vec<_> = exec
                .audit()
                .entries_for(report.execution_id)
                .into_iter()
                .filter(|e| e.action == "quality_override")
                .collect();
            (report, reviews)
        };

        // small shortfall on the critical path grades medium
        let (report, reviews) = run(0.80).await;
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(report.approval, ApprovalStatus::Overridden);
        assert_eq!(reviews[0].details["risk_level"], "medium");

        let (report, reviews) = run(0.50).await;
        assert_eq!(report.status, WorkflowStatus::Failed);
        assert_eq!(reviews[0].details["risk_level"], "critical");
        assert_eq!(reviews[0].details["approved"], false);
    }

    #[tokio::test]
    async fn test_retry_recovers_quality() {
        let exec = executor(research_and_write(vec![0.5, 0.9], vec![0.9]));
        let report = exec.run(REQUEST, ExecutionPreferences::default()).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(report.quality_summary.gates_failed, 1);
        let research = exec.metrics().get(&Specialty::Research).await.unwrap();
        assert_eq!(research.attempts, 2);
        assert_eq!(research.retries, 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let registry = SpecialistRegistry::new().with(Arc::new(Flaky {
            failures: AtomicU32::new(2),
        }));
        let exec = executor(registry);
        let report = exec
            .run("Research the market", ExecutionPreferences::default())
            .await
            .unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
        let plan = exec.plan(report.execution_id).await.unwrap();
        assert_eq!(plan.subtasks[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_missing_specialist_fails_assignment() {
        let registry = SpecialistRegistry::new().with(Scripted::new(Specialty::Research, vec![0.9]));
        let exec = executor(registry);
        let report = exec.run(REQUEST, ExecutionPreferences::default()).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Failed);
        assert!(report.failure_reason.unwrap().contains("no_capable_agent"));
    }

    #[tokio::test]
    async fn test_threshold_preference_applies() {
        let exec = executor(research_and_write(vec![0.7], vec![0.7]));
        let prefs = ExecutionPreferences {
            quality_threshold: Some(0.6),
            ..Default::default()
        };
        let report = exec.run(REQUEST, prefs).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(report.quality_summary.threshold, 0.6);
    }

    #[tokio::test]
    async fn test_unknown_execution_is_not_found() {
        let exec = executor(SpecialistRegistry::new());
        let err = exec.status(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, MaestroError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_status_falls_back_to_store() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let exec = WorkflowExecutor::builder(config())
            .specialists(research_and_write(vec![0.9], vec![0.9]))
            .store(Arc::clone(&store))
            .without_health_monitor()
            .build()
            .unwrap();
        let report = exec.run(REQUEST, ExecutionPreferences::default()).await.unwrap();

        let fresh = WorkflowExecutor::builder(config())
            .store(store)
            .without_health_monitor()
            .build()
            .unwrap();
        let loaded = fresh.status(report.execution_id).await.unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Completed);
        assert_eq!(loaded.total_tasks, 2);
    }

    #[tokio::test]
    async fn test_archive_is_bounded_and_evicted_reports_load_from_store() {
        let mut config = config();
        config.archive_capacity = 2;
        let exec = WorkflowExecutor::builder(config)
            .without_health_monitor()
            .build()
            .unwrap();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(exec.execute("", ExecutionPreferences::default()).await.unwrap());
        }

        {
            let archived = exec.inner.archived.read();
            assert_eq!(archived.reports.len(), 2);
            assert_eq!(archived.order.len(), 2);
            assert!(archived.get(&ids[0]).is_none());
            assert!(archived.get(&ids[4]).is_some());
        }
        let evicted = exec.status(ids[0]).await.unwrap();
        assert_eq!(evicted.status, WorkflowStatus::Failed);
        assert!(exec.live_executions().is_empty());
    }

    #[test]
    fn test_default_scorer_clamps() {
        let task = SubTask::new("x", Specialty::Research, 1.0);
        let scorer = DefaultScorer;
        assert_eq!(scorer.score(&task, &SpecialistOutput::completed(serde_json::Value::Null, 1.4)), 1.0);
        assert_eq!(scorer.score(&task, &SpecialistOutput::completed(serde_json::Value::Null, f64::NAN)), 0.0);
    }
}
