//! Stand-in specialists for running workflows without real domain logic.

use async_trait::async_trait;
use maestro_core::{
    MaestroResult, SpecialistHandler, SpecialistInput, SpecialistOutput, Specialty, TaskContext,
};
use maestro_orchestrator::SpecialistRegistry;
use std::sync::Arc;
use std::time::Duration;

/// Specialties covered by [`demo_registry`].
pub const DEMO_SPECIALTIES: [Specialty; 7] = [
    Specialty::Research,
    Specialty::Data,
    Specialty::Analysis,
    Specialty::Design,
    Specialty::Coding,
    Specialty::Writing,
    Specialty::Review,
];

/// Echoes its task back after a short pause, reporting a fixed score.
pub struct EchoSpecialist {
    specialty: Specialty,
    score: f64,
    delay: Duration,
}

impl EchoSpecialist {
    pub fn new(specialty: Specialty, score: f64) -> Self {
        Self {
            specialty,
            score,
            delay: Duration::from_millis(50),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl SpecialistHandler for EchoSpecialist {
    fn specialty(&self) -> Specialty {
        self.specialty.clone()
    }

    async fn execute(&self, ctx: &TaskContext, input: SpecialistInput) -> MaestroResult<SpecialistOutput> {
        tokio::select! {
            _ = ctx.cancellation().cancelled() => {}
            _ = tokio::time::sleep(self.delay) => {}
        }
        ctx.checkpoint()?;
        Ok(SpecialistOutput::completed(
            serde_json::json!({
                "specialty": self.specialty,
                "attempt": ctx.attempt,
                "summary": format!("[{}] {}", self.specialty, input.description),
                "upstream": input.upstream.len(),
            }),
            self.score,
        ))
    }
}

/// One [`EchoSpecialist`] per working specialty.
pub fn demo_registry(score: f64) -> SpecialistRegistry {
    let mut registry = SpecialistRegistry::new();
    for specialty in DEMO_SPECIALTIES {
        registry.register(Arc::new(EchoSpecialist::new(specialty, score)));
    }
    registry
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    #[test]
    fn test_registry_covers_working_specialties() {
        let registry = demo_registry(0.9);
        assert_eq!(registry.len(), DEMO_SPECIALTIES.len());
        assert!(registry.contains(&Specialty::Writing));
        assert!(!registry.contains(&Specialty::Executive));
    }

    #[tokio::test]
    async fn test_echo_output() {
        let echo = EchoSpecialist::new(Specialty::Research, 0.8).with_delay(Duration::ZERO);
        let ctx = TaskContext::new(Uuid::new_v4(), Specialty::Research, 1, CancellationToken::new());
        let input = SpecialistInput {
            description: "Research tides".into(),
            ..Default::default()
        };
        let out = echo.execute(&ctx, input).await.unwrap();
        assert_eq!(out.quality_score, 0.8);
        assert_eq!(out.payload["summary"], "[research] Research tides");
    }

    #[tokio::test]
    async fn test_cancelled_before_finish() {
        let echo = EchoSpecialist::new(Specialty::Coding, 0.9).with_delay(Duration::from_secs(30));
        let token = CancellationToken::new();
        let ctx = TaskContext::new(Uuid::new_v4(), Specialty::Coding, 1, token.clone());
        token.cancel();
        assert!(echo.execute(&ctx, SpecialistInput::default()).await.is_err());
    }
}
