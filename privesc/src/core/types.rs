//! Shared deterministic types for the agent core.
//!
//! These types define stable contracts between the channel, the capabilities
//! and the turn loop. They carry no I/O handles.

use serde::{Deserialize, Serialize};

/// Return code reported when the real exit status is unknown.
pub const UNKNOWN_RETURN_CODE: i32 = -1;

/// Outcome of one framed command on a shell session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Command output with echo, markers and ANSI escapes removed.
    pub stdout: String,
    /// Diagnostic text synthesized by the channel (timeouts, dead sessions).
    pub stderr: String,
    /// Best-effort exit status; [`UNKNOWN_RETURN_CODE`] when not observed.
    pub return_code: i32,
    /// The end marker did not arrive before the deadline.
    pub timed_out: bool,
}

impl CommandResult {
    /// Result of an empty command: nothing was sent.
    pub fn empty() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            return_code: 0,
            timed_out: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.return_code == 0
    }
}

/// Identity used to authenticate a session and to evaluate root detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub hostname: String,
    pub username: String,
    pub password: String,
}

/// A parsed request to run one capability. Produced once per command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub capability: String,
    pub raw_args: String,
    pub raw_command: String,
}

/// One executed command inside a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Round {
    /// Turn number the command belongs to (1-indexed).
    pub index: u32,
    pub command: String,
    pub result: String,
    pub got_root: bool,
}

/// Mutable state threaded through every turn of a run.
///
/// `version` increases on every mutation so renderers can tell stale copies apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunState {
    pub turn: u32,
    pub max_turns: u32,
    pub success: bool,
    pub facts: String,
    pub analysis: Option<String>,
    pub failed_vectors: Vec<String>,
    pub version: u64,
}

impl RunState {
    pub fn new(max_turns: u32) -> Self {
        Self {
            turn: 1,
            max_turns,
            success: false,
            facts: String::new(),
            analysis: None,
            failed_vectors: Vec::new(),
            version: 0,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.turn > self.max_turns
    }

    pub(crate) fn bump(&mut self) {
        self.version += 1;
    }
}

/// Lifecycle phase of the turn loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentPhase {
    Init,
    Running,
    Succeeded,
    Exhausted,
    Failed,
}

impl AgentPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Exhausted | Self::Failed)
    }
}

/// Terminal reason reported for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Termination {
    /// The goal was reached.
    Succeeded,
    /// `max_turns` rounds ran without reaching the goal.
    Exhausted,
    /// An unhandled error aborted the run.
    Failed,
}

impl Termination {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "goal reached",
            Self::Exhausted => "maximum turn number reached",
            Self::Failed => "unhandled failure",
        }
    }
}
