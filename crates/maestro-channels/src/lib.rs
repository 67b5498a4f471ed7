//! Notification channels for critical orchestration events.
//!
//! Escalations, workflow failures and agent replacements are pushed through
//! the narrow [`Notifier`] interface. A [`NotifierManager`] fans one event out
//! to every configured notifier.
//!
//! # Main types
//!
//! - [`Notifier`]: Trait implemented by every notification target.
//! - [`WebhookNotifier`]: POSTs events as JSON to an HTTP endpoint.
//! - [`LogNotifier`]: Emits events as structured tracing records.
//! - [`NotifierManager`]: Broadcasts events to all registered notifiers.

/// Fan-out manager for multiple notifiers.
pub mod manager;
/// Notifier trait and the tracing-backed notifier.
pub mod notifier;
/// HTTP webhook notifier.
pub mod webhook;

pub use manager::NotifierManager;
pub use notifier::{LogNotifier, Notifier};
pub use webhook::{WebhookConfig, WebhookNotifier};
