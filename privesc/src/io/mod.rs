//! Side-effecting adapters: transports, sessions, config, prompts, logs.

pub mod channel;
pub mod config;
pub mod hints;
pub mod process;
pub mod prompt;
pub mod reasoner;
pub mod run_log;
pub mod session;
pub mod transport;
