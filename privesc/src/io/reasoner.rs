//! Reasoning provider abstraction.
//!
//! The [`Reasoner`] trait decouples the turn loop from whatever produces
//! completions. The shipped backend pipes the prompt into an external command
//! and reads the completion from its stdout; tests use scripted reasoners.

use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::budget::{ApproxTokenCounter, TokenCounter};
use crate::io::config::ReasonerConfig;
use crate::io::process::run_command_with_timeout;

/// One completion and what it cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// Turns a rendered prompt into a completion.
///
/// The same implementation counts tokens, so budgets match what the provider
/// will actually see.
pub trait Reasoner: TokenCounter {
    fn complete(&self, prompt: &str) -> Result<Completion>;

    /// Maximum number of tokens the provider accepts.
    fn context_size(&self) -> usize;
}

/// Reasoner that runs an external command per prompt.
pub struct CommandReasoner {
    command: Vec<String>,
    context_size: usize,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandReasoner {
    pub fn new(config: &ReasonerConfig) -> Self {
        Self {
            command: config.command.clone(),
            context_size: config.context_size,
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
        }
    }
}

impl TokenCounter for CommandReasoner {
    fn count_tokens(&self, text: &str) -> usize {
        ApproxTokenCounter.count_tokens(text)
    }
}

impl Reasoner for CommandReasoner {
    #[instrument(skip_all, fields(program = %self.command.first().map(String::as_str).unwrap_or(""), prompt_len = prompt.len()))]
    fn complete(&self, prompt: &str) -> Result<Completion> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("reasoner command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);

        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .map_err(|err| err.context(format!("run reasoner {program}")))?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "reasoner timed out");
            return Err(anyhow!("reasoner timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "reasoner failed");
            return Err(anyhow!(
                "reasoner failed with status {:?}: {}",
                output.status.code(),
                output.stderr_text().trim()
            ));
        }

        let text = output.stdout_text();
        let completion = Completion {
            prompt_tokens: self.count_tokens(prompt),
            completion_tokens: self.count_tokens(&text),
            text,
        };
        debug!(
            prompt_tokens = completion.prompt_tokens,
            completion_tokens = completion.completion_tokens,
            "completion received"
        );
        Ok(completion)
    }

    fn context_size(&self) -> usize {
        self.context_size
    }
}
