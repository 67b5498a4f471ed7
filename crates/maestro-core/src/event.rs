use crate::{AgentId, Specialty};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A critical event dispatched to notifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    /// An issue escalated to the executive layer.
    Escalation {
        escalation_id: Uuid,
        agent_id: AgentId,
        issue_type: String,
        data: serde_json::Value,
        at: DateTime<Utc>,
    },
    /// A workflow reached the `failed` state.
    WorkflowFailed {
        execution_id: Uuid,
        reason: String,
        completed_tasks: usize,
        total_tasks: usize,
        at: DateTime<Utc>,
    },
    /// A workflow completed successfully.
    WorkflowCompleted {
        execution_id: Uuid,
        total_tasks: usize,
        at: DateTime<Utc>,
    },
    /// An agent missed its heartbeat and was replaced.
    AgentFailed {
        agent_id: AgentId,
        specialty: Specialty,
        reassigned_tasks: usize,
        at: DateTime<Utc>,
    },
}

impl NotificationEvent {
    /// Short event name, matching the serialized `event` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationEvent::Escalation { .. } => "escalation",
            NotificationEvent::WorkflowFailed { .. } => "workflow_failed",
            NotificationEvent::WorkflowCompleted { .. } => "workflow_completed",
            NotificationEvent::AgentFailed { .. } => "agent_failed",
        }
    }

    /// Whether the event needs human attention.
    pub fn is_critical(&self) -> bool {
        !matches!(self, NotificationEvent::WorkflowCompleted { .. })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tag_matches_kind() {
        let event = NotificationEvent::WorkflowFailed {
            execution_id: Uuid::new_v4(),
            reason: "quality_gate".into(),
            completed_tasks: 1,
            total_tasks: 2,
            at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.kind());
        assert!(event.is_critical());
    }
}
