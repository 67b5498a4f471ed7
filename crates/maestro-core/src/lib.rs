//! Core types and error definitions for the Maestro orchestration framework.
//!
//! This crate provides the foundational types shared across all Maestro crates:
//! the error taxonomy, agent and specialty identifiers, and the contracts that
//! external collaborators (specialist handlers, override reviewers) implement.
//!
//! # Main types
//!
//! - [`MaestroError`]: Unified error enum for all orchestration subsystems.
//! - [`MaestroResult`]: Convenience alias for `Result<T, MaestroError>`.
//! - [`AgentId`], [`AgentLayer`], [`Specialty`], [`Priority`]: Identity of workers.
//! - [`SpecialistHandler`]: Capability interface implemented by domain workers.
//! - [`OverrideReviewer`]: Manual review hook consulted after failed quality gates.
//! - [`NotificationEvent`]: Critical events dispatched to notifiers.

/// Manual override review for failed quality gates.
pub mod approval;
/// Notification events emitted by the orchestrator.
pub mod event;
/// Specialist execution contract.
pub mod specialist;
/// Agent identity types.
pub mod types;

pub use approval::{
    OverrideDecision, OverrideRequest, OverrideReviewer, RiskCeilingReviewer, RiskLevel,
};
pub use event::NotificationEvent;
pub use specialist::{
    OutputStatus, SpecialistHandler, SpecialistInput, SpecialistOutput, TaskContext,
};
pub use types::{AgentId, AgentLayer, Priority, Specialty};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Error reason codes ---

/// Why a request could not be turned into a workflow plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum DecompositionReason {
    /// The request was empty or whitespace only.
    #[error("empty_request")]
    EmptyRequest,
    /// The request contains no recognisable language.
    #[error("unintelligible")]
    Unintelligible,
    /// The request does not call for any known specialty.
    #[error("no_specialists")]
    NoSpecialists,
}

/// Why a set of sub-tasks does not form a valid dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum GraphReason {
    /// The dependency relation contains a cycle.
    #[error("cycle_detected")]
    CycleDetected,
    /// A dependency references a sub-task outside the plan.
    #[error("unknown_dependency")]
    UnknownDependency,
}

/// Why the hierarchy could not provide an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentReason {
    /// No agent exists and none can be created within pool limits.
    #[error("pool_exhausted")]
    PoolExhausted,
    /// No specialist handler is registered for the specialty.
    #[error("no_capable_agent")]
    NoCapableAgent,
}

// --- Error types ---

/// Top-level error type for the Maestro framework.
///
/// Each variant corresponds to one class of the orchestration error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum MaestroError {
    /// The request could not be decomposed.
    #[error("Decomposition error: {0}")]
    Decomposition(DecompositionReason),

    /// The sub-task dependency graph is invalid.
    #[error("Graph error: {0}")]
    Graph(GraphReason),

    /// No agent could be assigned.
    #[error("Assignment error: {reason} ({specialty})")]
    Assignment {
        /// Reason code.
        reason: AssignmentReason,
        /// Specialty that could not be served.
        specialty: Specialty,
    },

    /// A message could not be delivered.
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// A sub-task failed while executing.
    #[error("Execution error ({}): {reason}", transience(.transient))]
    Execution {
        /// Transient failures are retried locally.
        transient: bool,
        /// Human-readable cause.
        reason: String,
    },

    /// A sub-task stayed below the quality threshold after all attempts.
    #[error("Quality gate failure: task {task_id} scored {score:.2} (threshold {threshold:.2})")]
    QualityGate {
        /// The failing sub-task.
        task_id: Uuid,
        /// Best score achieved.
        score: f64,
        /// Required score.
        threshold: f64,
    },

    /// An agent missed its heartbeat deadline.
    #[error("Agent failure: {0} missed heartbeat")]
    AgentFailure(AgentId),

    /// The operation was cancelled cooperatively.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The operation exceeded its time budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A referenced entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from the state store.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// An error while dispatching a notification.
    #[error("Notification error: {0}")]
    Notification(String),

    /// An error from an outbound HTTP request.
    #[error("HTTP error: {0}")]
    Http(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MaestroError {
    /// Shorthand for a transient execution failure.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Execution {
            transient: true,
            reason: reason.into(),
        }
    }

    /// Shorthand for a permanent execution failure.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Execution {
            transient: false,
            reason: reason.into(),
        }
    }

    /// Whether the error is worth retrying locally with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            MaestroError::Execution { transient, .. } => *transient,
            MaestroError::Delivery(_)
            | MaestroError::Timeout(_)
            | MaestroError::AgentFailure(_)
            | MaestroError::Http(_) => true,
            _ => false,
        }
    }

    /// Short category name used in audit entries and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            MaestroError::Decomposition(_) => "decomposition",
            MaestroError::Graph(_) => "graph",
            MaestroError::Assignment { .. } => "assignment",
            MaestroError::Delivery(_) => "delivery",
            MaestroError::Execution { .. } => "execution",
            MaestroError::QualityGate { .. } => "quality_gate",
            MaestroError::AgentFailure(_) => "agent_failure",
            MaestroError::Cancelled(_) => "cancelled",
            MaestroError::Timeout(_) => "timeout",
            MaestroError::NotFound(_) => "not_found",
            MaestroError::Config(_) => "config",
            MaestroError::Persistence(_) => "persistence",
            MaestroError::Notification(_) => "notification",
            MaestroError::Http(_) => "http",
            MaestroError::Json(_) => "json",
            MaestroError::Io(_) => "io",
        }
    }
}

fn transience(transient: &bool) -> &'static str {
    if *transient {
        "transient"
    } else {
        "permanent"
    }
}

/// A convenience `Result` alias using [`MaestroError`].
pub type MaestroResult<T> = Result<T, MaestroError>;
