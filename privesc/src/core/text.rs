//! Text clean-up shared by the channel, the capabilities and the turn loop.

use std::sync::LazyLock;

use regex::Regex;

static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("ansi regex is valid")
});

static FENCED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[^\n]*\n(.*?)\n?```\s*$").expect("fence regex is valid")
});

static COMMAND_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<command>([\s\S]*?)</command>").expect("command tag regex is valid")
});

/// Remove ANSI escape sequences (colors, cursor movement, OSC introducers).
pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}

/// Last line with visible content, ANSI-stripped and trimmed.
pub fn last_non_empty_line(text: &str) -> String {
    text.lines()
        .map(|line| strip_ansi(line).trim().to_string())
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or_default()
}

/// Undo the usual decorations a language model puts around a bare command.
///
/// Handles fenced code blocks, surrounding back-ticks, a leading `$ ` prompt
/// and surrounding quotes.
pub fn fix_command_output(raw: &str) -> String {
    let mut cmd = raw.trim_matches(|c| c == ' ' || c == '\n' || c == '\r').to_string();
    if cmd.len() < 2 {
        return cmd;
    }

    if let Some(caps) = FENCED_RE.captures(&cmd) {
        cmd = caps[1].trim().to_string();
    }
    if let Some(inner) = strip_pair(&cmd, '`') {
        cmd = inner.to_string();
    }
    if let Some(rest) = cmd.strip_prefix("$ ") {
        cmd = rest.to_string();
    }
    if let Some(inner) = strip_pair(&cmd, '\'') {
        cmd = inner.to_string();
    }
    if let Some(inner) = strip_pair(&cmd, '"') {
        cmd = inner.to_string();
    }
    cmd
}

fn strip_pair(text: &str, quote: char) -> Option<&str> {
    if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
        Some(&text[1..text.len() - 1])
    } else {
        None
    }
}

/// All `<command>...</command>` blocks in order, trimmed, empty blocks skipped.
pub fn extract_tagged_commands(text: &str) -> Vec<String> {
    COMMAND_TAG_RE
        .captures_iter(text)
        .map(|caps| caps[1].trim().to_string())
        .filter(|cmd| !cmd.is_empty())
        .collect()
}

/// Quote a value for POSIX shells using single quotes.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Truncate to at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
