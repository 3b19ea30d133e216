//! Detection of repeatedly failing escalation approaches.
//!
//! Each executed command is reduced to a coarse vector key. Results that look
//! like failures bump a per-key counter; once a key reaches the threshold it is
//! recorded once as a failed vector and surfaced to the reasoner as negative
//! guidance.

use std::collections::{HashMap, VecDeque};

use crate::core::text::truncate_chars;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 2;
pub const DEFAULT_MAX_FAILED_VECTORS: usize = 15;
pub const DEFAULT_RECENT_WINDOW: usize = 10;

const FAILURE_INDICATORS: &[&str] = &[
    "permission denied",
    "operation not permitted",
    "not allowed",
    "access denied",
    "cannot open",
    "no such file",
    "command not found",
    "not permitted",
    "authentication failure",
    "authentication error",
    "timed out",
    "timeout",
];

/// Coarse classification of a command for failure bookkeeping.
pub fn vector_key(cmd: &str) -> String {
    let lower = cmd.trim().to_lowercase();
    if lower.is_empty() {
        return "unknown".to_string();
    }
    if lower.contains("rootbash") || lower.contains("root_bash") {
        return "rootbash".to_string();
    }
    if lower.contains("/etc/shadow") {
        return "read_shadow".to_string();
    }
    if lower.contains("/etc/sudoers") {
        return "read_sudoers".to_string();
    }
    if lower.contains("docker") {
        return "docker".to_string();
    }
    if lower.contains("sudo ") {
        return "sudo".to_string();
    }

    let mut parts = lower.split_whitespace();
    let binary = parts.next().unwrap_or("unknown");
    let target = parts
        .find(|part| part.starts_with('/'))
        .and_then(|path| path.rsplit('/').next())
        .map(|name| format!("_{}", truncate_chars(name, 20)))
        .unwrap_or_default();
    format!("{binary}{target}")
}

/// True if the result text carries one of the known failure indicators.
pub fn looks_failed(result: &str) -> bool {
    let lower = result.to_lowercase();
    FAILURE_INDICATORS
        .iter()
        .any(|indicator| lower.contains(indicator))
}

#[derive(Debug, Clone)]
pub struct FailureTracker {
    threshold: u32,
    max_vectors: usize,
    window: usize,
    counts: HashMap<String, u32>,
    vectors: Vec<(String, String)>,
    recent: VecDeque<String>,
}

impl Default for FailureTracker {
    fn default() -> Self {
        Self::new(
            DEFAULT_FAILURE_THRESHOLD,
            DEFAULT_MAX_FAILED_VECTORS,
            DEFAULT_RECENT_WINDOW,
        )
    }
}

impl FailureTracker {
    pub fn new(threshold: u32, max_vectors: usize, window: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            max_vectors,
            window: window.max(1),
            counts: HashMap::new(),
            vectors: Vec::new(),
            recent: VecDeque::new(),
        }
    }

    /// Record one executed command. Returns the failed-vector description if
    /// this call newly crossed the threshold for its key.
    pub fn record(&mut self, cmd: &str, result: &str) -> Option<String> {
        self.remember(cmd);
        if !looks_failed(result) {
            return None;
        }

        let key = vector_key(cmd);
        let count = self.counts.entry(key.clone()).or_insert(0);
        *count += 1;
        let count = *count;

        if count < self.threshold
            || self.vectors.len() >= self.max_vectors
            || self.vectors.iter().any(|(existing, _)| *existing == key)
        {
            return None;
        }

        let description = format!(
            "{key}: failed {count}x (last: '{}')",
            truncate_chars(cmd.trim(), 100)
        );
        self.vectors.push((key, description.clone()));
        Some(description)
    }

    fn remember(&mut self, cmd: &str) {
        self.recent.push_back(cmd.to_string());
        while self.recent.len() > self.window {
            self.recent.pop_front();
        }
    }

    pub fn failed_vectors(&self) -> Vec<String> {
        self.vectors.iter().map(|(_, desc)| desc.clone()).collect()
    }

    pub fn failure_count(&self, key: &str) -> u32 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Most recent commands, oldest first.
    pub fn recent_commands(&self) -> impl Iterator<Item = &str> {
        self.recent.iter().map(String::as_str)
    }
}
