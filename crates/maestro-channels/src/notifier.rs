use async_trait::async_trait;
use maestro_core::{MaestroResult, NotificationEvent};
use tracing::{info, warn};

/// A destination for notification events.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;
    /// Deliver one event.
    async fn notify(&self, event: &NotificationEvent) -> MaestroResult<()>;
}

/// Writes events to the tracing subscriber. Always succeeds.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, event: &NotificationEvent) -> MaestroResult<()> {
        let body = serde_json::to_string(event)?;
        if event.is_critical() {
            warn!(event = event.kind(), payload = %body, "Critical event");
        } else {
            info!(event = event.kind(), payload = %body, "Event");
        }
        Ok(())
    }
}
