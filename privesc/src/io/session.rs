//! A shell session: one framed channel plus the identity it runs as.

use std::time::Duration;

use anyhow::Result;

use crate::core::types::{CommandResult, Identity};
use crate::io::channel::{ChannelSettings, FramedChannel};
use crate::io::config::PrivescConfig;
use crate::io::transport::{ProcessTransport, Transport};

/// Owned by whoever drives the agent. At most one command is in flight, which
/// `&mut self` on every call enforces.
pub struct Session<T: Transport> {
    identity: Identity,
    channel: FramedChannel<T>,
}

impl<T: Transport> Session<T> {
    pub fn new(identity: Identity, channel: FramedChannel<T>) -> Self {
        Self { identity, channel }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn channel(&self) -> &FramedChannel<T> {
        &self.channel
    }

    pub fn run(&mut self, command: &str) -> Result<CommandResult> {
        self.channel.run(command)
    }

    pub fn run_with_timeout(&mut self, command: &str, timeout: Duration) -> Result<CommandResult> {
        self.channel.run_with_timeout(command, timeout)
    }

    pub fn default_timeout(&self) -> Duration {
        self.channel.settings().timeout
    }

    pub fn close(&mut self) -> Result<()> {
        self.channel.close()
    }
}

impl Session<ProcessTransport> {
    /// Session for the configured target and transport. Nothing is spawned
    /// until the first command.
    pub fn from_config(config: &PrivescConfig) -> Self {
        let identity = config.target.identity();
        let transport = ProcessTransport::from_config(
            &config.transport,
            &identity,
            config.channel.close_timeout(),
        );
        let channel = FramedChannel::new(transport, ChannelSettings::from(&config.channel));
        Self::new(identity, channel)
    }
}
