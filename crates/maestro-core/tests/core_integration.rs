#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use maestro_core::*;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 1. A handler implemented outside the crate honours the contract
// ---------------------------------------------------------------------------

struct Upper;

#[async_trait]
impl SpecialistHandler for Upper {
    fn specialty(&self) -> Specialty {
        Specialty::Writing
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        input: SpecialistInput,
    ) -> MaestroResult<SpecialistOutput> {
        ctx.checkpoint()?;
        Ok(SpecialistOutput::completed(
            serde_json::json!({ "text": input.description.to_uppercase() }),
            0.9,
        ))
    }
}

#[tokio::test]
async fn handler_returns_output_with_score() {
    let handler = Upper;
    let ctx = TaskContext::new(Uuid::new_v4(), handler.specialty(), 1, CancellationToken::new());
    let input = SpecialistInput {
        description: "summarize".into(),
        ..Default::default()
    };

    let out = handler.execute(&ctx, input).await.unwrap();
    assert_eq!(out.status, OutputStatus::Completed);
    assert_eq!(out.payload["text"], "SUMMARIZE");
    assert!((out.quality_score - 0.9).abs() < f64::EPSILON);
}

#[tokio::test]
async fn cancelled_handler_stops_at_checkpoint() {
    let token = CancellationToken::new();
    let ctx = TaskContext::new(Uuid::new_v4(), Specialty::Writing, 1, token.child_token());
    token.cancel();

    let err = Upper.execute(&ctx, SpecialistInput::default()).await.unwrap_err();
    assert_eq!(err.category(), "cancelled");
    assert!(!err.is_transient());
}

// ---------------------------------------------------------------------------
// 2. Error taxonomy
// ---------------------------------------------------------------------------

#[test]
fn assignment_error_names_reason_and_specialty() {
    let err = MaestroError::Assignment {
        reason: AssignmentReason::NoCapableAgent,
        specialty: Specialty::Custom("translation".into()),
    };
    assert_eq!(
        err.to_string(),
        "Assignment error: no_capable_agent (translation)"
    );
    assert_eq!(err.category(), "assignment");
}

#[test]
fn io_and_json_errors_convert() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let err: MaestroError = io.into();
    assert_eq!(err.category(), "io");

    let bad: Result<serde_json::Value, _> = serde_json::from_str("{");
    let err: MaestroError = bad.unwrap_err().into();
    assert_eq!(err.category(), "json");
}

#[test]
fn quality_gate_error_formats_scores() {
    let err = MaestroError::QualityGate {
        task_id: Uuid::nil(),
        score: 0.7,
        threshold: 0.85,
    };
    assert!(err.to_string().contains("scored 0.70 (threshold 0.85)"));
}

// ---------------------------------------------------------------------------
// 3. Override review contract
// ---------------------------------------------------------------------------

struct RejectAll;

#[async_trait]
impl OverrideReviewer for RejectAll {
    async fn review(&self, request: OverrideRequest) -> MaestroResult<OverrideDecision> {
        Ok(OverrideDecision {
            approved: request.best_score >= request.threshold,
            reason: Some("below threshold".into()),
            reviewer: "test".into(),
        })
    }
}

#[tokio::test]
async fn reviewer_decides_on_request() {
    let request = OverrideRequest {
        execution_id: Uuid::new_v4(),
        task_id: Some(Uuid::new_v4()),
        description: "write summary".into(),
        best_score: 0.7,
        threshold: 0.85,
        risk_level: RiskLevel::High,
        output: serde_json::Value::Null,
    };
    let decision = RejectAll.review(request).await.unwrap();
    assert!(!decision.approved);
}
