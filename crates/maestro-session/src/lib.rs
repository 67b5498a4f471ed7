//! Durable storage of execution state.
//!
//! The orchestrator treats the store as an opaque key-value interface: one
//! JSON document per execution id holding the workflow plan and its record.

/// State store trait and its backends.
pub mod store;

pub use store::{FileStateStore, MemoryStateStore, StateStore};
