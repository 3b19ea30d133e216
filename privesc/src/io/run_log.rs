//! Per-run artifacts under `<log_dir>/<run_id>/`.
//!
//! Each turn writes `rounds/<turn>.json`; the run ends with `run.json`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Serialize;
use tracing::debug;

use crate::core::types::Termination;

/// One dispatched command inside a turn.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CommandLog {
    /// Capability that ran, `None` when the text could not be dispatched.
    pub capability: Option<String>,
    pub arguments: String,
    pub output: String,
    pub got_root: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RoundLog {
    pub turn: u32,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub completion: String,
    pub commands: Vec<CommandLog>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub success: bool,
    pub termination: Termination,
    pub reason: String,
    pub turns: u32,
    pub failure: Option<String>,
}

/// Artifact writer for one run.
#[derive(Debug, Clone)]
pub struct RunLog {
    run_id: String,
    dir: PathBuf,
}

impl RunLog {
    /// Allocate a fresh run directory below `log_dir`.
    pub fn create(log_dir: &Path) -> Result<Self> {
        let base = format!("run-{}-{}", unix_secs(), random_suffix());
        for suffix in 1..=999u32 {
            let run_id = if suffix == 1 {
                base.clone()
            } else {
                format!("{base}-{suffix}")
            };
            let dir = log_dir.join(&run_id);
            if dir.exists() {
                continue;
            }
            fs::create_dir_all(dir.join("rounds"))
                .with_context(|| format!("create run log dir {}", dir.display()))?;
            debug!(run_id = %run_id, dir = %dir.display(), "run log created");
            return Ok(Self { run_id, dir });
        }
        Err(anyhow!(
            "unable to allocate a run directory from base '{base}'"
        ))
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn round_path(&self, turn: u32) -> PathBuf {
        self.dir.join("rounds").join(format!("{turn}.json"))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.dir.join("run.json")
    }

    pub fn write_round(&self, round: &RoundLog) -> Result<PathBuf> {
        let path = self.round_path(round.turn);
        write_json(&path, round)?;
        Ok(path)
    }

    pub fn write_summary(&self, summary: &RunSummary) -> Result<PathBuf> {
        let path = self.summary_path();
        write_json(&path, summary)?;
        Ok(path)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}
