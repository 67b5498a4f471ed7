//! Audit trail for the Maestro framework.
//!
//! Every escalation, error and terminal workflow decision is appended to an
//! [`AuditLog`]. Entries are hash-chained so a truncated or edited trail can
//! be detected with [`AuditLog::verify_chain`].
//!
//! # Main types
//!
//! - [`AuditLog`]: Append-only audit trail, persisted as JSONL or kept in memory.
//! - [`AuditEntry`]: One recorded action.
//! - [`AuditOutcome`]: Result of the recorded action.

/// Audit logging module.
pub mod audit;

pub use audit::{AuditEntry, AuditLog, AuditOutcome};
