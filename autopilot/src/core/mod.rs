//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests;
//! timestamps are passed in by callers.

pub mod classifier;
pub mod fields;
pub mod intent;
pub mod mode;
pub mod plan;
pub mod run;
pub mod selector;
pub mod status;
pub mod trigger;
pub mod types;
