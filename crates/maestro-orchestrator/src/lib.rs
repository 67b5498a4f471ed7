//! Hierarchical multi-agent orchestration core.
//!
//! Turns one natural-language request into a DAG of sub-tasks, places each
//! sub-task on a specialist agent, drives execution with quality gates and
//! heals the agent pools when workers stop answering.
//!
//! # Main types
//!
//! - [`WorkflowExecutor`]: top-level driver; submit, status, wait, cancel.
//! - [`HeuristicDecomposer`]: request to [`WorkflowPlan`] behind the [`Decompose`] trait.
//! - [`HierarchyManager`]: agent pools across the four layers, assignment and self-healing.
//! - [`CommunicationBus`]: typed messages with TTL, retries, topics and help requests.
//! - [`HealthMonitor`]: supervised heartbeat sweep.
//! - [`ExecutionMonitor`]: per-specialty execution metrics.

/// Agent actors.
pub mod agent;
/// Inter-agent message routing.
pub mod bus;
/// Runtime configuration.
pub mod config;
/// Request decomposition.
pub mod decomposer;
/// Workflow driver and quality gates.
pub mod executor;
/// Dependency graph of a plan.
pub mod graph;
/// Heartbeat classification and sweep.
pub mod health;
/// Agent registry, pools and self-healing.
pub mod hierarchy;
/// Execution metrics.
pub mod monitor;
/// Pool bounds and the spawn backlog.
pub mod spawner;
/// Specialty to handler registry.
pub mod specialists;
/// Sub-task state of one workflow.
pub mod task_queue;
/// Plans, agents and execution records.
pub mod types;

pub use bus::{
    BusMessage, BusStatsSnapshot, CommunicationBus, HelpRouter, HelpStatus, Mailbox, MessageKind,
    Recipient, EXECUTIVE_TOPIC,
};
pub use config::{BusConfig, OrchestratorConfig, PoolLimits};
pub use decomposer::{Decompose, HeuristicDecomposer};
pub use executor::{DefaultScorer, ExecutorBuilder, QualityScorer, StoredExecution, WorkflowExecutor};
pub use graph::TaskGraph;
pub use health::{classify_heartbeat, HealthMonitor, HealthReport, HealthState};
pub use hierarchy::{HealReport, HierarchyManager, HierarchyStatus, SpawnOutcome, SweepReport};
pub use monitor::{ExecutionMonitor, SpecialtyMetrics};
pub use specialists::SpecialistRegistry;
pub use task_queue::TaskQueue;
pub use types::{
    AgentRecord, AgentStatus, ApprovalStatus, ComplexityTier, ExecutionPreferences,
    ExecutionRecord, StatusReport, SubTask, SubTaskStatus, TimelineKind, WorkflowPlan,
    WorkflowStatus,
};
