//! Bounded textual record of previous commands and their results.

use serde::{Deserialize, Serialize};

use crate::core::budget::{TokenCounter, trim_front};

/// How much of the transcript is kept and rendered into prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HistoryMode {
    /// Nothing is remembered.
    None,
    /// Every command with its full result.
    Full,
    /// Commands only, without results.
    Commands,
    /// Commands with results, trimmed from the front to the context size on every append.
    #[default]
    Sliding,
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    mode: HistoryMode,
    /// Full and commands modes only; results are empty in commands mode.
    entries: Vec<(String, String)>,
    sliding: String,
    appended: usize,
    capacity_tokens: usize,
}

impl HistoryStore {
    /// `capacity_tokens` bounds the sliding transcript; other modes ignore it.
    pub fn new(mode: HistoryMode, capacity_tokens: usize) -> Self {
        Self {
            mode,
            entries: Vec::new(),
            sliding: String::new(),
            appended: 0,
            capacity_tokens,
        }
    }

    pub fn mode(&self) -> HistoryMode {
        self.mode
    }

    /// Number of commands appended, including ones trimmed out of the text.
    pub fn len(&self) -> usize {
        self.appended
    }

    pub fn is_empty(&self) -> bool {
        self.appended == 0
    }

    pub fn append<C: TokenCounter + ?Sized>(&mut self, counter: &C, cmd: &str, result: &str) {
        match self.mode {
            HistoryMode::None => return,
            HistoryMode::Full => self.entries.push((cmd.to_string(), result.to_string())),
            HistoryMode::Commands => self.entries.push((cmd.to_string(), String::new())),
            HistoryMode::Sliding => {
                self.sliding.push_str(&render_entry(cmd, result));
                self.sliding = trim_front(counter, self.capacity_tokens, &self.sliding);
            }
        }
        self.appended += 1;
    }

    /// Full text representation, untrimmed.
    pub fn text(&self) -> String {
        match self.mode {
            HistoryMode::None => String::new(),
            HistoryMode::Full => self
                .entries
                .iter()
                .map(|(cmd, result)| render_entry(cmd, result))
                .collect::<Vec<_>>()
                .join("\n"),
            HistoryMode::Commands => self
                .entries
                .iter()
                .map(|(cmd, _)| format!("$ {cmd}\n"))
                .collect(),
            HistoryMode::Sliding => self.sliding.clone(),
        }
    }

    /// Text representation trimmed from the front to fit `budget` tokens.
    pub fn render<C: TokenCounter + ?Sized>(&self, counter: &C, budget: usize) -> String {
        let budget = match self.mode {
            HistoryMode::Sliding => budget.min(self.capacity_tokens),
            _ => budget,
        };
        trim_front(counter, budget, &self.text())
    }
}

fn render_entry(cmd: &str, result: &str) -> String {
    let mut entry = format!("$ {cmd}\n{result}");
    if !entry.ends_with('\n') {
        entry.push('\n');
    }
    entry
}
