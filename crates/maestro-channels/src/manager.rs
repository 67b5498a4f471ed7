use crate::notifier::Notifier;
use maestro_core::{MaestroError, NotificationEvent};

/// Fans notification events out to every registered notifier.
pub struct NotifierManager {
    notifiers: Vec<Box<dyn Notifier>>,
}

impl NotifierManager {
    /// An empty manager; broadcasts are no-ops until a notifier is added.
    pub fn new() -> Self {
        Self {
            notifiers: Vec::new(),
        }
    }

    /// Register a notifier. Delivery follows registration order.
    pub fn add_notifier(&mut self, notifier: Box<dyn Notifier>) {
        self.notifiers.push(notifier);
    }

    /// Deliver an event to every notifier.
    /// Errors from individual notifiers are collected and returned together.
    pub async fn broadcast(&self, event: &NotificationEvent) -> Vec<MaestroError> {
        let mut errors = Vec::new();
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(event).await {
                tracing::warn!(notifier = %notifier.name(), event = event.kind(), error = %e, "Notification failed");
                errors.push(e);
            }
        }
        errors
    }

    /// Names of the registered notifiers.
    pub fn notifier_names(&self) -> Vec<&str> {
        self.notifiers.iter().map(|n| n.name()).collect()
    }

    /// Number of registered notifiers.
    pub fn notifier_count(&self) -> usize {
        self.notifiers.len()
    }
}

impl Default for NotifierManager {
    fn default() -> Self {
        Self::new()
    }
}
