//! Request/response execution on top of an interactive shell stream.
//!
//! One command is in flight at a time. Each command gets fresh markers, is
//! written with its trailer, and the output is read until the end marker shows
//! up on its own line or the deadline passes. A timed out command triggers an
//! interrupt, a drain and a sync echo so the next command starts on a clean
//! stream; if the shell does not answer, the session is closed and reopened
//! lazily on the next command.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{debug, info, instrument, warn};

use crate::core::framing::{
    Markers, completed_result, contains_marker_line, incomplete_result, wire_form,
};
use crate::core::types::CommandResult;
use crate::errors::TransportStartupError;
use crate::io::config::ChannelConfig;
use crate::io::transport::{ReadEvent, Transport};

const TOKEN_LEN: usize = 12;

/// Timing knobs for a [`FramedChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub startup_grace: Duration,
    pub drain_quiet: Duration,
    pub recovery_timeout: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self::from(&ChannelConfig::default())
    }
}

impl From<&ChannelConfig> for ChannelSettings {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            startup_grace: Duration::from_millis(config.startup_grace_ms),
            drain_quiet: Duration::from_millis(config.drain_quiet_ms),
            recovery_timeout: Duration::from_secs(config.recovery_timeout_secs),
        }
    }
}

enum Drained {
    Quiet(Vec<u8>),
    Closed(Vec<u8>),
}

enum ReadUntil {
    Found(String),
    Deadline(String),
    Closed(String),
}

pub struct FramedChannel<T: Transport> {
    transport: T,
    settings: ChannelSettings,
    started: bool,
}

impl<T: Transport> FramedChannel<T> {
    pub fn new(transport: T, settings: ChannelSettings) -> Self {
        Self {
            transport,
            settings,
            started: false,
        }
    }

    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Open the transport and swallow its startup noise, once.
    ///
    /// A session whose process died since the last command is reopened.
    #[instrument(skip_all)]
    pub fn ensure_started(&mut self) -> Result<()> {
        if self.started {
            if self.transport.is_open() {
                return Ok(());
            }
            warn!("session exited, reopening");
            self.reset();
        }

        self.transport.open().map_err(|err| {
            if err.is::<TransportStartupError>() {
                err
            } else {
                TransportStartupError::new(format!("{err:#}")).into()
            }
        })?;

        let deadline = Instant::now() + self.settings.startup_grace;
        let mut banner = Vec::new();
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = (deadline - now).min(self.settings.poll_interval);
            match self.transport.poll_read(wait)? {
                ReadEvent::Data(chunk) => banner.extend_from_slice(&chunk),
                ReadEvent::Idle => {}
                ReadEvent::Closed => return Err(startup_exit(&banner)),
            }
        }

        match self.drain(self.settings.drain_quiet, self.settings.timeout)? {
            Drained::Quiet(rest) => banner.extend_from_slice(&rest),
            Drained::Closed(rest) => {
                banner.extend_from_slice(&rest);
                return Err(startup_exit(&banner));
            }
        }

        debug!(banner_bytes = banner.len(), "session started");
        self.started = true;
        Ok(())
    }

    /// Run `command` with the configured deadline.
    pub fn run(&mut self, command: &str) -> Result<CommandResult> {
        self.run_with_timeout(command, self.settings.timeout)
    }

    /// Run `command` and return its isolated output.
    ///
    /// Timeouts and a shell that exits mid-command are reported in the
    /// result; only transport failures are errors.
    #[instrument(skip(self), fields(timeout_ms = timeout.as_millis() as u64))]
    pub fn run_with_timeout(&mut self, command: &str, timeout: Duration) -> Result<CommandResult> {
        if command.trim().is_empty() {
            return Ok(CommandResult::empty());
        }
        self.ensure_started()?;

        let markers = Markers::new(
            format!("__PE_END_{}__", random_token()),
            format!("__PE_RC_{}__", random_token()),
        );
        let wire = markers.compose(command);
        self.transport
            .send(format!("{wire}\n").as_bytes())
            .context("send framed command")?;

        let started_at = Instant::now();
        match self.read_until(&markers.end, timeout)? {
            ReadUntil::Found(raw) => {
                let result = completed_result(&raw, &markers, &wire);
                debug!(
                    return_code = result.return_code,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "command completed"
                );
                Ok(result)
            }
            ReadUntil::Closed(raw) => {
                warn!("session exited before the command completed");
                self.started = false;
                Ok(incomplete_result(
                    &raw,
                    &markers,
                    &wire,
                    false,
                    "session exited before the command completed".to_string(),
                ))
            }
            ReadUntil::Deadline(raw) => {
                warn!("end marker not found before deadline");
                let result = incomplete_result(
                    &raw,
                    &markers,
                    &wire,
                    true,
                    format!("command timed out after {timeout:?}; output may be incomplete"),
                );
                let recovered = self.recover()?;
                debug!(recovered, "timeout recovery finished");
                Ok(result)
            }
        }
    }

    /// Close the session. Safe to call repeatedly.
    pub fn close(&mut self) -> Result<()> {
        self.started = false;
        self.transport.close()
    }

    /// Interrupt the wedged command and confirm the shell answers again.
    ///
    /// Returns false when the session had to be dropped instead.
    #[instrument(skip_all)]
    fn recover(&mut self) -> Result<bool> {
        if let Err(err) = self.transport.interrupt() {
            warn!(err = %err, "interrupt failed, dropping session");
            self.reset();
            return Ok(false);
        }

        if let Drained::Closed(_) = self
            .drain(self.settings.drain_quiet, self.settings.recovery_timeout)?
        {
            info!("session exited after interrupt");
            self.reset();
            return Ok(false);
        }

        let sync = format!("__PE_SYNC_{}__", random_token());
        let sync_line = format!("echo {}\n", wire_form(&sync));
        if let Err(err) = self.transport.send(sync_line.as_bytes()) {
            warn!(err = %err, "sync echo could not be sent, dropping session");
            self.reset();
            return Ok(false);
        }

        match self.read_until(&sync, self.settings.recovery_timeout)? {
            ReadUntil::Found(_) => Ok(true),
            ReadUntil::Deadline(_) | ReadUntil::Closed(_) => {
                warn!("shell did not answer the sync echo, dropping session");
                self.reset();
                Ok(false)
            }
        }
    }

    fn reset(&mut self) {
        self.started = false;
        if let Err(err) = self.transport.close() {
            warn!(err = %err, "failed to close session");
        }
    }

    /// Read until `marker` is a complete line of the accumulated output.
    fn read_until(&mut self, marker: &str, timeout: Duration) -> Result<ReadUntil> {
        let deadline = Instant::now() + timeout;
        let mut buf = Vec::new();
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(ReadUntil::Deadline(lossy(&buf)));
            }
            let wait = (deadline - now).min(self.settings.poll_interval);
            match self.transport.poll_read(wait)? {
                ReadEvent::Data(chunk) => {
                    buf.extend_from_slice(&chunk);
                    let text = lossy(&buf);
                    if contains_marker_line(&text, marker) {
                        return Ok(ReadUntil::Found(text));
                    }
                }
                ReadEvent::Idle => {}
                ReadEvent::Closed => return Ok(ReadUntil::Closed(lossy(&buf))),
            }
        }
    }

    /// Discard output until the stream stays quiet for `quiet`, at most `limit`.
    fn drain(&mut self, quiet: Duration, limit: Duration) -> Result<Drained> {
        let deadline = Instant::now() + limit;
        let mut drained = Vec::new();
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(Drained::Quiet(drained));
            }
            match self.transport.poll_read(quiet.min(deadline - now))? {
                ReadEvent::Data(chunk) => drained.extend_from_slice(&chunk),
                ReadEvent::Idle => return Ok(Drained::Quiet(drained)),
                ReadEvent::Closed => return Ok(Drained::Closed(drained)),
            }
        }
    }
}

fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

fn lossy(buf: &[u8]) -> String {
    String::from_utf8_lossy(buf).into_owned()
}

fn startup_exit(banner: &[u8]) -> anyhow::Error {
    TransportStartupError::new(format!(
        "session exited during startup: {}",
        lossy(banner).trim()
    ))
    .into()
}
