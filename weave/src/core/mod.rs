//! Deterministic, pure logic shared by the weave core.
//!
//! Core modules must be free of I/O side effects (the backoff helper only
//! sleeps). They operate on in-memory data and return deterministic outputs
//! suitable for tests.

pub mod backoff;
pub mod checklist;
pub mod identity;
pub mod metadata;
pub mod reconcile;
pub mod scan;
pub mod types;
