//! Deterministic, pure logic shared by the agent.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod budget;
pub mod dispatch;
pub mod failures;
pub mod framing;
pub mod history;
pub mod root_detect;
pub mod text;
pub mod types;
