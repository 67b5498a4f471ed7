//! The boundary between the orchestration core and domain workers.
//!
//! The core never inspects how a handler produces its result: it hands over a
//! [`TaskContext`] plus a [`SpecialistInput`] and receives a
//! [`SpecialistOutput`] carrying the payload, a self-reported quality score
//! and a status.

use crate::{MaestroError, MaestroResult, Specialty};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Execution context handed to a specialist for one sub-task attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Sub-task this attempt belongs to.
    pub task_id: Uuid,
    /// Specialty of the agent running the attempt.
    pub specialty: Specialty,
    /// 1-based attempt number for this sub-task.
    pub attempt: u32,
    cancel: CancellationToken,
}

impl TaskContext {
    /// Context for one attempt, cancelled through `cancel`.
    pub fn new(task_id: Uuid, specialty: Specialty, attempt: u32, cancel: CancellationToken) -> Self {
        Self {
            task_id,
            specialty,
            attempt,
            cancel,
        }
    }

    /// Cooperative cancellation checkpoint.
    ///
    /// Handlers call this between units of work; it fails once the owning
    /// workflow (or this sub-task) has been cancelled.
    pub fn checkpoint(&self) -> MaestroResult<()> {
        if self.cancel.is_cancelled() {
            Err(MaestroError::Cancelled(format!("task {}", self.task_id)))
        } else {
            Ok(())
        }
    }

    /// Whether the attempt has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that resolves when the sub-task is cancelled.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Input payload for a sub-task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecialistInput {
    /// What the sub-task should accomplish.
    pub description: String,
    /// The original request the workflow was created from.
    pub request: String,
    /// Outputs of completed dependencies, keyed by sub-task id.
    #[serde(default)]
    pub upstream: HashMap<Uuid, serde_json::Value>,
    /// Free-form extra context (help requests, shared context).
    #[serde(default)]
    pub context: serde_json::Value,
}

/// Outcome status reported by a specialist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    /// The attempt produced output.
    Completed,
    /// The attempt failed but a retry may succeed.
    TransientFailure,
    /// The attempt failed and retrying is pointless.
    PermanentFailure,
}

/// What a specialist returns for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialistOutput {
    /// Result data, or `{"error": ..}` for failures.
    pub payload: serde_json::Value,
    /// Self-reported quality in `[0.0, 1.0]`.
    pub quality_score: f64,
    /// Whether the attempt succeeded and, if not, whether to retry.
    pub status: OutputStatus,
}

impl SpecialistOutput {
    /// A successful attempt.
    pub fn completed(payload: serde_json::Value, quality_score: f64) -> Self {
        Self {
            payload,
            quality_score,
            status: OutputStatus::Completed,
        }
    }

    /// A failed attempt; `transient` failures are retried with backoff.
    pub fn failed(reason: impl Into<String>, transient: bool) -> Self {
        Self {
            payload: serde_json::json!({ "error": reason.into() }),
            quality_score: 0.0,
            status: if transient {
                OutputStatus::TransientFailure
            } else {
                OutputStatus::PermanentFailure
            },
        }
    }
}

/// Capability interface implemented by every domain worker.
///
/// Handlers are registered per specialty; every agent of that specialty
/// shares the same handler instance.
#[async_trait]
pub trait SpecialistHandler: Send + Sync {
    /// The specialty this handler serves.
    fn specialty(&self) -> Specialty;

    /// Execute one attempt of a sub-task.
    async fn execute(
        &self,
        ctx: &TaskContext,
        input: SpecialistInput,
    ) -> MaestroResult<SpecialistOutput>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_honors_cancellation() {
        let token = CancellationToken::new();
        let ctx = TaskContext::new(Uuid::new_v4(), Specialty::Research, 1, token.child_token());
        assert!(ctx.checkpoint().is_ok());
        token.cancel();
        assert!(matches!(ctx.checkpoint(), Err(MaestroError::Cancelled(_))));
    }

    #[test]
    fn test_failed_output_status() {
        let out = SpecialistOutput::failed("rate limited", true);
        assert_eq!(out.status, OutputStatus::TransientFailure);
        assert_eq!(out.quality_score, 0.0);
        assert_eq!(out.payload["error"], "rate limited");
    }
}
