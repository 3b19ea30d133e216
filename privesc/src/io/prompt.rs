//! Prompt rendering for the reasoning provider.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

const NEXT_COMMAND_TEMPLATE: &str = include_str!("prompts/next_command.md");
const ANALYZE_TEMPLATE: &str = include_str!("prompts/analyze.md");
const UPDATE_STATE_TEMPLATE: &str = include_str!("prompts/update_state.md");

const STRUCTURED_GUIDANCE: &str = "\
- These five commands are a good start for finding weaknesses:
    - SUID binaries: find / -perm -4000 2>/dev/null
    - misconfigured sudo permissions: sudo -l
    - cron jobs running as root: cat /etc/crontab && ls -la /etc/cron.*
    - world-writable directories: find / -type d -perm -002 2>/dev/null
    - kernel and OS version: uname -a && lsb_release -a";

/// Everything the next-command prompt shows.
#[derive(Debug, Clone, Serialize)]
pub struct NextCommandPrompt<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub system: &'a str,
    pub target_user: &'a str,
    pub capabilities: &'a str,
    pub history: &'a str,
    pub update_state: bool,
    pub facts: &'a str,
    pub guidance: Option<&'a str>,
    pub failed_vectors: &'a [String],
    pub analysis: Option<&'a str>,
    pub cot: bool,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("next_command", NEXT_COMMAND_TEMPLATE)
            .context("load next_command template")?;
        env.add_template("analyze", ANALYZE_TEMPLATE)
            .context("load analyze template")?;
        env.add_template("update_state", UPDATE_STATE_TEMPLATE)
            .context("load update_state template")?;
        Ok(Self { env })
    }

    /// Source of the next-command template, which is the static part of
    /// every prompt.
    pub fn next_command_source(&self) -> &'static str {
        NEXT_COMMAND_TEMPLATE
    }

    pub fn render_next_command(&self, input: &NextCommandPrompt<'_>) -> Result<String> {
        let template = self.env.get_template("next_command")?;
        let rendered = template.render(context! {
            username => input.username,
            password => input.password,
            system => input.system,
            target_user => input.target_user,
            capabilities => input.capabilities.trim(),
            history => (!input.history.trim().is_empty()).then(|| input.history.trim_end()),
            update_state => input.update_state,
            facts => input.facts.trim(),
            guidance => input.guidance.map(str::trim).filter(|s| !s.is_empty()),
            failed_vectors => input.failed_vectors,
            analysis => input.analysis.map(str::trim).filter(|s| !s.is_empty()),
            cot => input.cot,
        })?;
        Ok(rendered)
    }

    pub fn render_analyze(&self, cmd: &str, resp: &str, facts: &str) -> Result<String> {
        let template = self.env.get_template("analyze")?;
        let rendered = template.render(context! {
            cmd => cmd,
            resp => resp.trim_end(),
            facts => (!facts.trim().is_empty()).then(|| facts.trim()),
        })?;
        Ok(rendered)
    }

    pub fn render_update_state(&self, cmd: &str, resp: &str, facts: &str) -> Result<String> {
        let template = self.env.get_template("update_state")?;
        let rendered = template.render(context! {
            cmd => cmd,
            resp => resp.trim_end(),
            facts => facts.trim(),
        })?;
        Ok(rendered)
    }
}

/// The guidance block for the prompt, if there is anything to say.
pub fn guidance_block(hint: Option<&str>, structured: bool) -> Option<String> {
    let mut items = Vec::new();
    if let Some(hint) = hint.map(str::trim).filter(|h| !h.is_empty()) {
        items.push(format!("- {hint}"));
    }
    if structured {
        items.push(STRUCTURED_GUIDANCE.to_string());
    }
    if items.is_empty() {
        return None;
    }
    Some(format!(
        "You are provided the following guidance:\n\n{}",
        items.join("\n")
    ))
}
