//! Error types callers recognise with `anyhow::Error::downcast_ref`.
//!
//! Recoverable conditions (framing timeouts, parse failures, rejected
//! credentials) are reported as data and never appear here.

use thiserror::Error;

/// The transport could not be opened, or died during the startup window.
#[derive(Debug, Error)]
#[error("transport failed to start: {detail}")]
pub struct TransportStartupError {
    pub detail: String,
}

impl TransportStartupError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// Chain-of-thought mode requires at least one `<command>` block per completion.
#[derive(Debug, Error)]
#[error("completion contained no <command> block: {completion:?}")]
pub struct MissingCommandBlockError {
    pub completion: String,
}
