//! Stable exit codes for `privesc` commands.

/// The goal was reached, or the command succeeded.
pub const OK: i32 = 0;
/// The run failed, or config/arguments were invalid.
pub const FAILED: i32 = 1;
/// The turn budget ran out without reaching the goal.
pub const EXHAUSTED: i32 = 2;
