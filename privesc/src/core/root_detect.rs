//! Root detection on the last line of command output.
//!
//! Detection is a per-deployment strategy: the built-in rules recognise root
//! prompts and identity output, and deployments add their own patterns for
//! host-specific conventions. A bare `root` line is never enough, since plenty
//! of commands merely print that word.

use anyhow::{Context, Result};
use regex::Regex;

/// Decides whether a cleaned output line proves the acting identity is root.
pub trait RootDetector {
    fn got_root(&self, hostname: &str, last_line: &str) -> bool;
}

/// Prompt- and identity-based detector with optional extra patterns.
#[derive(Debug, Clone)]
pub struct ShellRootDetector {
    builtin: Vec<Regex>,
    extra: Vec<Regex>,
}

impl ShellRootDetector {
    pub fn new() -> Self {
        let builtin = [
            r"^# ?$",
            r"^bash-[0-9]+\.[0-9]+# ?$",
            r"^sh-[0-9]+\.[0-9]+# ?$",
            r"^uid=0\(",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect();
        Self {
            builtin,
            extra: Vec::new(),
        }
    }

    /// Add deployment-specific regexes, matched against the whole cleaned line.
    pub fn with_patterns<S: AsRef<str>>(mut self, patterns: &[S]) -> Result<Self> {
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let re = Regex::new(pattern)
                .with_context(|| format!("compile root detection pattern {pattern:?}"))?;
            self.extra.push(re);
        }
        Ok(self)
    }
}

impl Default for ShellRootDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl RootDetector for ShellRootDetector {
    fn got_root(&self, hostname: &str, last_line: &str) -> bool {
        let line = last_line.trim_end_matches(['\r', '\n']);
        if self.builtin.iter().any(|re| re.is_match(line)) {
            return true;
        }
        if !hostname.is_empty() && line.starts_with(&format!("root@{hostname}:")) {
            return true;
        }
        self.extra.iter().any(|re| re.is_match(line))
    }
}

impl<F> RootDetector for F
where
    F: Fn(&str, &str) -> bool,
{
    fn got_root(&self, hostname: &str, last_line: &str) -> bool {
        self(hostname, last_line)
    }
}
