//! Steerable run-cycle orchestrator for a long-running autonomous agent.
//!
//! A run advances one bounded cycle at a time: sync the plan document,
//! absorb operator directives, commit a mode, perform exactly one action.
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (mode machine, plan grammar,
//!   selection, classification). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting boundaries (filesystem, child processes,
//!   decision engine, capabilities, notifications). Behind traits so tests
//!   can swap in fakes.
//!
//! Orchestration modules ([`orchestrator`], [`cycle`], [`route`],
//! [`scheduler`], [`control`]) coordinate core logic with I/O.

pub mod control;
pub mod core;
pub mod cycle;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod orchestrator;
pub mod route;
pub mod scheduler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
