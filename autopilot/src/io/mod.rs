//! Side-effecting boundaries: filesystem, child processes, decision engine,
//! capabilities and notifications.

pub mod atomic;
pub mod capabilities;
pub mod config;
pub mod cycle_log;
pub mod decision;
pub mod init;
pub mod notifier;
pub mod plan_doc;
pub mod process;
pub mod prompt;
pub mod run_store;
