//! Agent configuration stored in `privesc.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::SAFETY_MARGIN;
use crate::core::history::HistoryMode;
use crate::core::root_detect::ShellRootDetector;
use crate::core::types::Identity;

pub const DEFAULT_CONFIG_PATH: &str = "privesc.toml";

/// Agent configuration (TOML).
///
/// Every section and field is optional; missing values fall back to the
/// defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PrivescConfig {
    pub target: TargetConfig,
    pub transport: TransportConfig,
    pub channel: ChannelConfig,
    pub agent: AgentConfig,
    pub reasoner: ReasonerConfig,
    pub root_detection: RootDetectionConfig,
}

/// Who we are on the target and who we want to become.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TargetConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
    pub target_user: String,
    /// Operating system named in prompts.
    pub system: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            username: "lowpriv".to_string(),
            password: String::new(),
            target_user: "root".to_string(),
            system: "linux".to_string(),
        }
    }
}

impl TargetConfig {
    pub fn identity(&self) -> Identity {
        Identity {
            hostname: self.hostname.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

/// How the shell on the target is reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// A shell spawned on this machine.
    Local {
        #[serde(default = "default_shell")]
        shell: Vec<String>,
    },
    /// A gsocket relay reached through `gs-netcat`.
    Gsocket {
        #[serde(default)]
        secret: String,
        #[serde(default = "default_gs_netcat")]
        gs_netcat_path: String,
    },
    /// The system ssh client.
    Ssh {
        #[serde(default)]
        host: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
        #[serde(default)]
        keyfile: Option<String>,
        #[serde(default = "default_ssh")]
        ssh_path: String,
        #[serde(default = "default_sshpass")]
        sshpass_path: String,
    },
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Local {
            shell: default_shell(),
        }
    }
}

fn default_shell() -> Vec<String> {
    vec!["/bin/sh".to_string()]
}

fn default_gs_netcat() -> String {
    "gs-netcat".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh() -> String {
    "ssh".to_string()
}

fn default_sshpass() -> String {
    "sshpass".to_string()
}

/// Framed channel timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChannelConfig {
    /// Per-command deadline.
    pub timeout_secs: u64,
    /// Upper bound on a single readiness wait inside the read loop.
    pub poll_interval_ms: u64,
    /// How long to collect the startup banner after opening the transport.
    pub startup_grace_ms: u64,
    /// A drain ends after this long without new output.
    pub drain_quiet_ms: u64,
    /// Deadline for the sync echo after an interrupt.
    pub recovery_timeout_secs: u64,
    /// How long to wait for the transport to exit before killing it.
    pub close_timeout_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            poll_interval_ms: 500,
            startup_grace_ms: 2000,
            drain_quiet_ms: 1500,
            recovery_timeout_secs: 5,
            close_timeout_secs: 5,
        }
    }
}

impl ChannelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub max_turns: u32,
    pub history: HistoryMode,
    /// Ask for `<command>` blocks and run every one of them.
    pub enable_cot: bool,
    /// Keep a running fact list updated by the reasoner after every command.
    pub enable_update_state: bool,
    /// Ask the reasoner to analyse every command result.
    pub enable_explanation: bool,
    /// Add the enumeration checklist to the prompt.
    pub enable_structured_guidance: bool,
    /// `hint:<text>` or the path of a JSON file mapping hostnames to hints.
    pub hints: Option<String>,
    pub safety_margin: usize,
    pub strategy_overhead_tokens: usize,
    /// Per-run artifacts are written below this directory when set.
    pub log_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            history: HistoryMode::default(),
            enable_cot: false,
            enable_update_state: false,
            enable_explanation: false,
            enable_structured_guidance: false,
            hints: None,
            safety_margin: SAFETY_MARGIN,
            strategy_overhead_tokens: 0,
            log_dir: None,
        }
    }
}

/// External command that turns a prompt (stdin) into a completion (stdout).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReasonerConfig {
    pub command: Vec<String>,
    pub context_size: usize,
    pub timeout_secs: u64,
    /// Truncate reasoner stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            command: vec!["llm".to_string()],
            context_size: 8192,
            timeout_secs: 120,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RootDetectionConfig {
    /// Extra regexes matched against the last output line.
    pub extra_patterns: Vec<String>,
}

impl RootDetectionConfig {
    pub fn detector(&self) -> Result<ShellRootDetector> {
        ShellRootDetector::new().with_patterns(&self.extra_patterns)
    }
}

impl PrivescConfig {
    pub fn validate(&self) -> Result<()> {
        let channel = &self.channel;
        if channel.timeout_secs == 0 {
            return Err(anyhow!("channel.timeout_secs must be > 0"));
        }
        if channel.poll_interval_ms == 0 {
            return Err(anyhow!("channel.poll_interval_ms must be > 0"));
        }
        if channel.recovery_timeout_secs == 0 {
            return Err(anyhow!("channel.recovery_timeout_secs must be > 0"));
        }
        if self.agent.max_turns == 0 {
            return Err(anyhow!("agent.max_turns must be > 0"));
        }
        if self.reasoner.timeout_secs == 0 {
            return Err(anyhow!("reasoner.timeout_secs must be > 0"));
        }
        if self.reasoner.output_limit_bytes == 0 {
            return Err(anyhow!("reasoner.output_limit_bytes must be > 0"));
        }
        if self.reasoner.command.is_empty() || self.reasoner.command[0].trim().is_empty() {
            return Err(anyhow!("reasoner.command must be a non-empty array"));
        }
        if self.reasoner.context_size <= self.agent.safety_margin {
            return Err(anyhow!(
                "reasoner.context_size ({}) must exceed agent.safety_margin ({})",
                self.reasoner.context_size,
                self.agent.safety_margin
            ));
        }
        match &self.transport {
            TransportConfig::Local { shell } => {
                if shell.is_empty() || shell[0].trim().is_empty() {
                    return Err(anyhow!("transport.shell must be a non-empty array"));
                }
            }
            TransportConfig::Gsocket { secret, .. } => {
                if secret.trim().is_empty() {
                    return Err(anyhow!("transport.secret is required for gsocket"));
                }
            }
            TransportConfig::Ssh { host, .. } => {
                if host.trim().is_empty() {
                    return Err(anyhow!("transport.host is required for ssh"));
                }
            }
        }
        self.root_detection
            .detector()
            .context("root_detection.extra_patterns")?;
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PrivescConfig::default()`.
pub fn load_config(path: &Path) -> Result<PrivescConfig> {
    if !path.exists() {
        let cfg = PrivescConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PrivescConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PrivescConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
