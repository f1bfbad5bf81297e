//! Stable exit codes for autopilot CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid workspace/config or other errors.
pub const INVALID: i32 = 1;
/// `autopilot status` found the run blocked on a pending approval.
pub const BLOCKED: i32 = 4;
