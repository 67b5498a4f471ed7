//! End-to-end orchestration tests.
//!
//! Drives full workflows through the executor with scripted specialists:
//! dependency ordering, parallel fan-out, agent loss mid-task, rejected
//! requests, quality-gate exhaustion, cancellation and message expiry.
//! Each failure class is checked to land in the execution record under its
//! own error category.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use maestro_core::{
    AgentId, MaestroError, MaestroResult, Priority, SpecialistHandler, SpecialistInput,
    SpecialistOutput, Specialty, TaskContext,
};
use maestro_orchestrator::*;
use maestro_security::AuditLog;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Mock specialists
// ---------------------------------------------------------------------------

/// Sleeps, then returns the next scripted score (the last one repeats).
struct MockSpecialist {
    specialty: Specialty,
    delay: Duration,
    scores: Vec<f64>,
    calls: AtomicU32,
}

impl MockSpecialist {
    fn new(specialty: Specialty, delay_ms: u64, scores: &[f64]) -> Arc<Self> {
        Arc::new(Self {
            specialty,
            delay: Duration::from_millis(delay_ms),
            scores: scores.to_vec(),
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpecialistHandler for MockSpecialist {
    fn specialty(&self) -> Specialty {
        self.specialty.clone()
    }

    async fn execute(&self, ctx: &TaskContext, input: SpecialistInput) -> MaestroResult<SpecialistOutput> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        tokio::select! {
            _ = ctx.cancellation().cancelled() => {
                return Err(MaestroError::Cancelled(format!("task {}", ctx.task_id)));
            }
            _ = tokio::time::sleep(self.delay) => {}
        }
        let score = self.scores.get(n).or(self.scores.last()).copied().unwrap_or(1.0);
        Ok(SpecialistOutput::completed(
            serde_json::json!({
                "specialty": self.specialty,
                "text": format!("{} done", input.description),
                "inputs": input.upstream.len(),
            }),
            score,
        ))
    }
}

/// Reports a permanent failure on every call.
struct BrokenSpecialist {
    specialty: Specialty,
    calls: AtomicU32,
}

#[async_trait]
impl SpecialistHandler for BrokenSpecialist {
    fn specialty(&self) -> Specialty {
        self.specialty.clone()
    }

    async fn execute(&self, _ctx: &TaskContext, _input: SpecialistInput) -> MaestroResult<SpecialistOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SpecialistOutput::failed("malformed source data", false))
    }
}

fn categories(record: &ExecutionRecord) -> Vec<&str> {
    record.errors.iter().map(|e| e.category.as_str()).collect()
}

fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.bus.backoff_base_ms = 1;
    config
}

fn executor(config: OrchestratorConfig, handlers: Vec<Arc<MockSpecialist>>) -> WorkflowExecutor {
    let mut registry = SpecialistRegistry::new();
    for handler in handlers {
        registry.register(handler);
    }
    WorkflowExecutor::builder(config)
        .specialists(registry)
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_research_then_write() {
    let research = MockSpecialist::new(Specialty::Research, 30, &[0.9]);
    let writing = MockSpecialist::new(Specialty::Writing, 10, &[0.92]);
    let exec = executor(fast_config(), vec![research, writing]);

    let report = exec
        .run(
            "Research X and write a two-paragraph summary",
            ExecutionPreferences::default(),
        )
        .await
        .unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(report.total_tasks, 2);

    let plan = exec.plan(report.execution_id).await.unwrap();
    let research = plan.subtasks.iter().find(|t| t.specialty == Specialty::Research).unwrap();
    let writing = plan.subtasks.iter().find(|t| t.specialty == Specialty::Writing).unwrap();
    assert_eq!(writing.dependencies, vec![research.id]);
    assert!(research.completed_at.unwrap() <= writing.started_at.unwrap());
    assert_eq!(writing.result.as_ref().unwrap()["inputs"], 1);
}

#[tokio::test]
async fn test_independent_subtasks_run_concurrently() {
    let research = MockSpecialist::new(Specialty::Research, 300, &[0.9]);
    let exec = executor(fast_config(), vec![research.clone()]);

    let started = Instant::now();
    let report = exec
        .run(
            "Research cats; research dogs; research birds",
            ExecutionPreferences::default(),
        )
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(report.total_tasks, 3);
    assert_eq!(research.calls(), 3);
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(700), "ran sequentially: {elapsed:?}");
}

#[tokio::test]
async fn test_killed_agent_task_is_reassigned() {
    let mut config = fast_config();
    config.heartbeat_interval_ms = 20;
    config.heartbeat_timeout_ms = 200;
    config.recovery_window_ms = 2_000;
    let research = MockSpecialist::new(Specialty::Research, 400, &[0.9]);
    let exec = executor(config, vec![research.clone()]);

    let id = exec
        .execute("Research the market", ExecutionPreferences::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let victim = exec
        .hierarchy()
        .agents()
        .into_iter()
        .find(|a| a.specialty == Specialty::Research && !a.current_tasks.is_empty())
        .unwrap()
        .id;
    assert!(exec.hierarchy().kill_agent(victim).await.unwrap());

    let report = tokio::time::timeout(Duration::from_secs(5), exec.wait(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(report.total_tasks, 1);
    assert_eq!(research.calls(), 2);

    let plan = exec.plan(id).await.unwrap();
    assert_ne!(plan.subtasks[0].assigned_agent, Some(victim));
    let record = exec.record(id).await.unwrap();
    assert_eq!(record.count(TimelineKind::Reassigned), 1);

    let failure = record.errors.iter().find(|e| e.category == "agent_failure").unwrap();
    assert_eq!(failure.task_id, Some(plan.subtasks[0].id));
    assert!(failure.message.contains(&victim.to_string()));

    let scoped = exec.audit().entries_for(id);
    assert!(scoped.iter().any(|e| e.action == "self_heal" && e.agent_id == Some(victim)));
    let audit = exec.audit().entries();
    assert!(!audit.iter().any(|e| e.action == "recovery_window_exceeded"));
    assert_eq!(exec.hierarchy().agent(victim).unwrap().status, AgentStatus::Failed);
    exec.shutdown().await;
}

#[tokio::test]
async fn test_empty_request_fails() {
    let exec = executor(fast_config(), vec![]);
    let id = exec.execute("", ExecutionPreferences::default()).await.unwrap();
    let report = exec.status(id).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(report.total_tasks, 0);
    assert!(report.failure_reason.unwrap().contains("empty_request"));

    let record = exec.record(id).await.unwrap();
    assert_eq!(categories(&record), vec!["decomposition"]);
    assert_eq!(record.count(TimelineKind::Escalated), 1);
    assert!(exec
        .audit()
        .entries_for(id)
        .iter()
        .any(|e| e.action == "escalation" && e.details["issue_type"] == "decomposition_failure"));
}

#[tokio::test]
async fn test_quality_gate_failure_keeps_earlier_results() {
    let research = MockSpecialist::new(Specialty::Research, 5, &[0.95]);
    let writing = MockSpecialist::new(Specialty::Writing, 5, &[0.70, 0.70]);
    let exec = executor(fast_config(), vec![research, writing.clone()]);

    let prefs = ExecutionPreferences {
        quality_threshold: Some(0.85),
        max_quality_attempts: Some(2),
        ..Default::default()
    };
    let report = exec
        .run("Research X and write a two-paragraph summary", prefs)
        .await
        .unwrap();

    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(writing.calls(), 2);
    assert_eq!(report.completed_tasks, 1);
    assert_eq!(report.approval, ApprovalStatus::Rejected);

    let plan = exec.plan(report.execution_id).await.unwrap();
    let research = plan.subtasks.iter().find(|t| t.specialty == Specialty::Research).unwrap();
    assert_eq!(research.status, SubTaskStatus::Completed);
    assert!(research.result.is_some());

    let record = exec.record(report.execution_id).await.unwrap();
    assert_eq!(record.count(TimelineKind::Escalated), 1);
    assert!(record.errors.iter().any(|e| e.category == "quality_gate"));
    assert!(exec
        .audit()
        .entries_for(report.execution_id)
        .iter()
        .any(|e| e.action == "escalation"));
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unhandled_specialty_fails_assignment_and_escalates() {
    let research = MockSpecialist::new(Specialty::Research, 5, &[0.9]);
    let exec = executor(fast_config(), vec![research.clone()]);
    let report = exec
        .run(
            "Research X and write a two-paragraph summary",
            ExecutionPreferences::default(),
        )
        .await
        .unwrap();

    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(report.completed_tasks, 1);
    assert_eq!(research.calls(), 1);
    assert!(report.failure_reason.unwrap().contains("no_capable_agent"));

    let record = exec.record(report.execution_id).await.unwrap();
    assert_eq!(categories(&record), vec!["assignment"]);
    assert!(record.errors[0].message.contains("no_capable_agent"));
    assert_eq!(record.count(TimelineKind::Escalated), 1);
    let escalation = exec
        .audit()
        .entries_for(report.execution_id)
        .into_iter()
        .find(|e| e.action == "escalation")
        .unwrap();
    assert_eq!(escalation.details["issue_type"], "assignment_failure");
}

#[tokio::test]
async fn test_help_from_saturated_pool_is_pool_exhausted() {
    let mut config = fast_config();
    config.pools.insert(Specialty::Research, PoolLimits { min: 1, max: 1 });
    let research = MockSpecialist::new(Specialty::Research, 5, &[0.9]);
    let exec = executor(config, vec![research]);

    let only = exec
        .hierarchy()
        .agents()
        .into_iter()
        .find(|a| a.specialty == Specialty::Research)
        .unwrap()
        .id;
    let err = exec
        .bus()
        .request_help(only, Specialty::Research, serde_json::Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err.category(), "assignment");
    assert!(err.to_string().contains("pool_exhausted"));
    exec.shutdown().await;
}

#[tokio::test]
async fn test_permanent_failure_is_execution_error_and_blocks_dependents() {
    let research = Arc::new(BrokenSpecialist {
        specialty: Specialty::Research,
        calls: AtomicU32::new(0),
    });
    let writing = MockSpecialist::new(Specialty::Writing, 5, &[0.9]);
    let mut registry = SpecialistRegistry::new();
    registry.register(research.clone());
    registry.register(writing.clone());
    let exec = WorkflowExecutor::builder(fast_config())
        .specialists(registry)
        .build()
        .unwrap();

    let report = exec
        .run(
            "Research X and write a two-paragraph summary",
            ExecutionPreferences::default(),
        )
        .await
        .unwrap();
    assert_eq!(report.status, WorkflowStatus::Failed);
    assert_eq!(research.calls.load(Ordering::SeqCst), 1);
    assert_eq!(writing.calls(), 0);

    let record = exec.record(report.execution_id).await.unwrap();
    assert_eq!(categories(&record), vec!["execution"]);
    assert!(record.errors[0].message.contains("malformed source data"));
    assert_eq!(record.count(TimelineKind::Escalated), 1);

    let plan = exec.plan(report.execution_id).await.unwrap();
    assert!(plan.subtasks.iter().all(|t| t.status == SubTaskStatus::Failed));
    let writing = plan.subtasks.iter().find(|t| t.specialty == Specialty::Writing).unwrap();
    assert!(writing.failure_reason.as_ref().unwrap().starts_with("blocked by failed upstream"));
    assert!(writing.started_at.is_none());
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_terminal_status_is_idempotent() {
    let research = MockSpecialist::new(Specialty::Research, 5, &[0.9]);
    let exec = executor(fast_config(), vec![research]);
    let report = exec
        .run("Research the market", ExecutionPreferences::default())
        .await
        .unwrap();

    let first = exec.status(report.execution_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = exec.get_status(report.execution_id).await.unwrap();
    assert_eq!(first, report);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_subtasks_never_start_before_dependencies() {
    let handlers = vec![
        MockSpecialist::new(Specialty::Research, 5, &[0.9]),
        MockSpecialist::new(Specialty::Analysis, 5, &[0.9]),
        MockSpecialist::new(Specialty::Writing, 5, &[0.9]),
        MockSpecialist::new(Specialty::Review, 5, &[0.9]),
    ];
    let exec = executor(fast_config(), handlers);
    let report = exec
        .run(
            "Gather the data, analyze trends, then write a report and review it",
            ExecutionPreferences::default(),
        )
        .await
        .unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);

    let plan = exec.plan(report.execution_id).await.unwrap();
    let by_id: HashMap<_, _> = plan.subtasks.iter().map(|t| (t.id, t)).collect();
    TaskGraph::build(&plan.subtasks).unwrap();
    for task in &plan.subtasks {
        for dep in &task.dependencies {
            assert!(by_id[dep].completed_at.unwrap() <= task.started_at.unwrap());
        }
    }
}

#[tokio::test]
async fn test_cancel_running_workflow() {
    let research = MockSpecialist::new(Specialty::Research, 5_000, &[0.9]);
    let exec = executor(fast_config(), vec![research]);
    let id = exec
        .execute("Research the market", ExecutionPreferences::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(exec.cancel(id).await.unwrap());
    let report = tokio::time::timeout(Duration::from_secs(2), exec.wait(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.status, WorkflowStatus::Cancelled);
    assert!(!exec.cancel(id).await.unwrap());

    // the agent is free again
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(exec.hierarchy().agents().iter().all(|a| a.current_tasks.is_empty()));
}

#[tokio::test]
async fn test_deadline_turns_stall_into_failure() {
    let research = MockSpecialist::new(Specialty::Research, 5_000, &[0.9]);
    let exec = executor(fast_config(), vec![research]);
    let prefs = ExecutionPreferences {
        deadline_ms: Some(100),
        ..Default::default()
    };
    let report = tokio::time::timeout(Duration::from_secs(2), exec.run("Research the market", prefs))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.status, WorkflowStatus::Failed);
    assert!(report.failure_reason.unwrap().starts_with("Timeout"));

    let record = exec.record(report.execution_id).await.unwrap();
    assert!(categories(&record).contains(&"timeout"));
}

#[tokio::test]
async fn test_submit_with_loose_preferences() {
    let research = MockSpecialist::new(Specialty::Research, 5, &[0.7]);
    let exec = executor(fast_config(), vec![research]);
    let mut prefs = HashMap::new();
    prefs.insert("quality_threshold".to_string(), serde_json::json!(0.6));
    let id = exec.submit("Research the market", &prefs).await.unwrap();
    let report = exec.wait(id).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);

    let metrics = exec.metrics().to_json().await;
    assert_eq!(metrics["workflows"]["completed"], 1);
    assert!(exec.health_report().healthy);
}

// ---------------------------------------------------------------------------
// Bus expiry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_message_never_delivered_after_ttl() {
    let config = BusConfig {
        mailbox_capacity: 1,
        backoff_base_ms: 5,
        max_retries: 10,
        ..Default::default()
    };
    let bus = CommunicationBus::new(config, AuditLog::in_memory());
    let sender = AgentId(1);
    let receiver = AgentId(2);
    let mut sender_box = bus.register(sender);
    let mut mailbox = bus.register(receiver);

    let direct = |n: u32| MessageKind::Direct {
        payload: serde_json::json!(n),
    };
    bus.send(sender, Recipient::Agent(receiver), direct(1), Priority::Normal)
        .await
        .unwrap();

    let started = Instant::now();
    let err = bus
        .send_with_ttl(
            sender,
            Recipient::Agent(receiver),
            direct(2),
            Priority::Normal,
            Duration::from_millis(80),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MaestroError::Delivery(_)));
    assert!(started.elapsed() < Duration::from_millis(500));

    let notice = sender_box.try_recv().unwrap();
    assert!(matches!(notice.kind, MessageKind::DeliveryFailure { .. }));

    let first = mailbox.recv().await.unwrap();
    assert!(matches!(first.kind, MessageKind::Direct { ref payload } if payload == &serde_json::json!(1)));
    assert!(mailbox.try_recv().is_none());
    let stats = bus.stats();
    assert_eq!(stats.expired + stats.failed, 1);
}
