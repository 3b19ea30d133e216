//! Autonomous privilege-escalation agent over an interactive shell.
//!
//! The crate turns a streaming, echo-polluted shell session into a
//! request/response channel and drives a reasoning provider turn by turn until
//! the session runs as the target user. The architecture keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (framing parse, root detection,
//!   failure tracking, history, token budgets). No I/O.
//! - **[`io`]**: Side effects (transports, the framed channel, config, prompts,
//!   the reasoner backend, run artifacts).
//!
//! [`capabilities`] binds named actions to a session and [`agent`] runs the
//! turn loop on top of both.

pub mod agent;
pub mod capabilities;
pub mod core;
pub mod errors;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
