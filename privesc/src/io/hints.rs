//! Per-host hints, consulted once when the agent starts.
//!
//! A hint source is either inline (`hint:<text>`) or the path of a JSON object
//! mapping hostnames to hint strings. A missing or unreadable file is not an
//! error; the run just goes without a hint.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

const INLINE_PREFIX: &str = "hint:";

/// Resolve the hint for `hostname` from `source`.
pub fn resolve_hint(source: Option<&str>, hostname: &str) -> Option<String> {
    let source = source?.trim();
    if source.is_empty() {
        return None;
    }
    if let Some(inline) = source.strip_prefix(INLINE_PREFIX) {
        let inline = inline.trim();
        return (!inline.is_empty()).then(|| inline.to_string());
    }

    let path = Path::new(source);
    if !path.exists() {
        warn!(path = %path.display(), "hint file not found");
        return None;
    }
    match read_hint_file(path) {
        Ok(hints) => {
            let hint = hints.get(hostname).cloned();
            if hint.is_none() {
                info!(hostname, "no hint for host");
            }
            hint
        }
        Err(err) => {
            warn!(err = %format!("{err:#}"), "hint file could not be loaded");
            None
        }
    }
}

fn read_hint_file(path: &Path) -> Result<HashMap<String, String>> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let hints = serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(hints)
}
