//! Byte-oriented duplex transports to a shell.
//!
//! Every backend (local shell, gsocket relay, ssh client) is a child process
//! whose stdin is the shell's input and whose merged stdout/stderr is the
//! shell's output. The [`Transport`] trait is the contract the framed channel
//! relies on; tests substitute an in-memory shell.
//!
//! Remote backends run the shell on a pty, so Ctrl-C interrupts the foreground
//! job. A local shell on pipes has no terminal to do that, and is interrupted
//! with SIGINT to the processes it started instead.

use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::types::Identity;
use crate::errors::TransportStartupError;
use crate::io::config::TransportConfig;

/// ASCII end-of-text, what a terminal sends for Ctrl-C.
pub const INTERRUPT_BYTE: u8 = 0x03;

/// How [`ProcessTransport`] stops a wedged foreground command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptMode {
    /// Write [`INTERRUPT_BYTE`] for the remote pty to turn into SIGINT.
    #[default]
    ControlByte,
    /// Send SIGINT to every descendant of the child process.
    SignalChildren,
}

impl InterruptMode {
    pub fn for_config(config: &TransportConfig) -> Self {
        match config {
            TransportConfig::Local { .. } => Self::SignalChildren,
            TransportConfig::Gsocket { .. } | TransportConfig::Ssh { .. } => Self::ControlByte,
        }
    }
}

/// What a single readiness poll observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    /// Bytes arrived.
    Data(Vec<u8>),
    /// Nothing arrived within the wait.
    Idle,
    /// The other side is gone; no more data will arrive.
    Closed,
}

/// Duplex byte channel to an interactive shell.
pub trait Transport {
    /// Open the channel. Opening an already open channel is a no-op.
    fn open(&mut self) -> Result<()>;

    /// True while the channel can carry data.
    fn is_open(&mut self) -> bool;

    /// Write and flush `data`.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Wait at most `wait` for output.
    fn poll_read(&mut self, wait: Duration) -> Result<ReadEvent>;

    /// Ask the foreground command to stop.
    fn interrupt(&mut self) -> Result<()> {
        self.send(&[INTERRUPT_BYTE])
    }

    /// Close the channel. Must be idempotent and tolerate a dead peer.
    fn close(&mut self) -> Result<()>;
}

/// Command line that starts the configured backend.
pub fn transport_argv(config: &TransportConfig, identity: &Identity) -> Vec<String> {
    match config {
        TransportConfig::Local { shell } => shell.clone(),
        TransportConfig::Gsocket {
            secret,
            gs_netcat_path,
        } => vec![
            gs_netcat_path.clone(),
            "-s".to_string(),
            secret.clone(),
            "-i".to_string(),
        ],
        TransportConfig::Ssh {
            host,
            port,
            keyfile,
            ssh_path,
            sshpass_path,
        } => {
            let mut argv = Vec::new();
            let use_password = keyfile.is_none() && !identity.password.is_empty();
            if use_password {
                argv.extend([
                    sshpass_path.clone(),
                    "-p".to_string(),
                    identity.password.clone(),
                ]);
            }
            argv.extend([
                ssh_path.clone(),
                "-tt".to_string(),
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-p".to_string(),
                port.to_string(),
            ]);
            if let Some(keyfile) = keyfile {
                argv.extend(["-i".to_string(), keyfile.clone()]);
            }
            argv.push(format!("{}@{}", identity.username, host));
            argv
        }
    }
}

struct LiveProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    output: Receiver<Vec<u8>>,
}

/// Transport backed by a child process with piped stdio.
pub struct ProcessTransport {
    argv: Vec<String>,
    close_timeout: Duration,
    interrupt: InterruptMode,
    live: Option<LiveProcess>,
}

impl ProcessTransport {
    pub fn new(argv: Vec<String>, close_timeout: Duration) -> Self {
        Self {
            argv,
            close_timeout,
            interrupt: InterruptMode::default(),
            live: None,
        }
    }

    pub fn from_config(
        config: &TransportConfig,
        identity: &Identity,
        close_timeout: Duration,
    ) -> Self {
        Self::new(transport_argv(config, identity), close_timeout)
            .with_interrupt(InterruptMode::for_config(config))
    }

    pub fn with_interrupt(mut self, interrupt: InterruptMode) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn interrupt_mode(&self) -> InterruptMode {
        self.interrupt
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }
}

impl Transport for ProcessTransport {
    #[instrument(skip_all, fields(program = self.program().unwrap_or("")))]
    fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        self.live = None;

        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| TransportStartupError::new("empty transport command"))?;

        debug!("spawning transport process");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| TransportStartupError::new(format!("spawn {program}: {err}")))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let (tx, rx) = mpsc::channel();
        spawn_pump(stdout, tx.clone());
        spawn_pump(stderr, tx);

        self.live = Some(LiveProcess {
            child,
            stdin,
            output: rx,
        });
        Ok(())
    }

    fn is_open(&mut self) -> bool {
        match self.live.as_mut() {
            Some(live) => matches!(live.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        let live = self
            .live
            .as_mut()
            .ok_or_else(|| anyhow!("transport is not open"))?;
        let stdin = live
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("transport stdin is closed"))?;
        stdin.write_all(data).context("write to transport")?;
        stdin.flush().context("flush transport")?;
        Ok(())
    }

    fn poll_read(&mut self, wait: Duration) -> Result<ReadEvent> {
        let Some(live) = self.live.as_mut() else {
            return Ok(ReadEvent::Closed);
        };
        match live.output.recv_timeout(wait) {
            Ok(chunk) => Ok(ReadEvent::Data(chunk)),
            Err(RecvTimeoutError::Disconnected) => Ok(ReadEvent::Closed),
            Err(RecvTimeoutError::Timeout) => {
                if live.child.try_wait().context("poll transport")?.is_none() {
                    return Ok(ReadEvent::Idle);
                }
                let mut rest = Vec::new();
                while let Ok(chunk) = live.output.try_recv() {
                    rest.extend_from_slice(&chunk);
                }
                if rest.is_empty() {
                    Ok(ReadEvent::Closed)
                } else {
                    Ok(ReadEvent::Data(rest))
                }
            }
        }
    }

    fn interrupt(&mut self) -> Result<()> {
        match self.interrupt {
            InterruptMode::ControlByte => self.send(&[INTERRUPT_BYTE]),
            InterruptMode::SignalChildren => {
                let live = self
                    .live
                    .as_ref()
                    .ok_or_else(|| anyhow!("transport is not open"))?;
                let signalled = interrupt_descendants(live.child.id());
                debug!(signalled, "interrupted shell children");
                Ok(())
            }
        }
    }

    #[instrument(skip_all, fields(program = self.program().unwrap_or("")))]
    fn close(&mut self) -> Result<()> {
        let Some(mut live) = self.live.take() else {
            return Ok(());
        };
        drop(live.stdin.take());

        let status = match live
            .child
            .wait_timeout(self.close_timeout)
            .context("wait for transport exit")?
        {
            Some(status) => status,
            None => {
                warn!(
                    timeout_secs = self.close_timeout.as_secs(),
                    "transport did not exit, killing"
                );
                // The process may exit between the timeout and the kill.
                if let Err(err) = live.child.kill() {
                    debug!(err = %err, "kill transport");
                }
                live.child.wait().context("wait transport after kill")?
            }
        };
        debug!(exit_code = ?status.code(), "transport closed");
        Ok(())
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(err = %err, "failed to close transport on drop");
        }
    }
}

/// SIGINT every live descendant of `root`, leaving `root` itself alone.
/// Returns how many processes accepted the signal.
fn interrupt_descendants(root: u32) -> usize {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    let processes = system.processes();

    let mut descendants = Vec::new();
    let mut parents = vec![Pid::from_u32(root)];
    while let Some(parent) = parents.pop() {
        for (pid, process) in processes {
            // Threads show up as tasks of their process.
            if process.thread_kind().is_none() && process.parent() == Some(parent) {
                descendants.push(*pid);
                parents.push(*pid);
            }
        }
    }

    descendants
        .iter()
        .filter_map(|pid| processes.get(pid))
        .filter(|process| process.kill_with(Signal::Interrupt).unwrap_or(false))
        .count()
}

fn spawn_pump<R: Read + Send + 'static>(mut reader: R, tx: Sender<Vec<u8>>) {
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(chunk[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(err = %err, "transport output closed");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn identity(password: &str) -> Identity {
        Identity {
            hostname: "target".to_string(),
            username: "lowpriv".to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn gsocket_argv_uses_interactive_relay() {
        let config = TransportConfig::Gsocket {
            secret: "s3cret".to_string(),
            gs_netcat_path: "gs-netcat".to_string(),
        };
        assert_eq!(
            transport_argv(&config, &identity("")),
            vec!["gs-netcat", "-s", "s3cret", "-i"]
        );
    }

    #[test]
    fn ssh_argv_prefers_keyfile_over_password() {
        let mut config = TransportConfig::Ssh {
            host: "10.0.0.5".to_string(),
            port: 2222,
            keyfile: Some("/keys/id".to_string()),
            ssh_path: "ssh".to_string(),
            sshpass_path: "sshpass".to_string(),
        };
        let argv = transport_argv(&config, &identity("trustno1"));
        assert_eq!(argv[0], "ssh");
        assert!(argv.contains(&"/keys/id".to_string()));
        assert_eq!(argv.last().map(String::as_str), Some("lowpriv@10.0.0.5"));

        if let TransportConfig::Ssh { keyfile, .. } = &mut config {
            *keyfile = None;
        }
        let argv = transport_argv(&config, &identity("trustno1"));
        assert_eq!(&argv[..3], &["sshpass", "-p", "trustno1"]);
        assert!(argv.contains(&"2222".to_string()));
    }

    #[test]
    fn only_the_local_shell_is_interrupted_by_signal() {
        let close = Duration::from_secs(1);
        let local = TransportConfig::Local {
            shell: vec!["/bin/sh".to_string()],
        };
        assert_eq!(
            ProcessTransport::from_config(&local, &identity(""), close).interrupt_mode(),
            InterruptMode::SignalChildren
        );

        let ssh = TransportConfig::Ssh {
            host: "10.0.0.5".to_string(),
            port: 22,
            keyfile: None,
            ssh_path: "ssh".to_string(),
            sshpass_path: "sshpass".to_string(),
        };
        assert_eq!(
            ProcessTransport::from_config(&ssh, &identity("pw"), close).interrupt_mode(),
            InterruptMode::ControlByte
        );
    }

    #[test]
    fn signal_interrupt_stops_the_foreground_child_only() {
        let mut transport =
            ProcessTransport::new(vec!["/bin/sh".to_string()], Duration::from_secs(2))
                .with_interrupt(InterruptMode::SignalChildren);
        transport.open().expect("open");
        transport.send(b"sleep 30; echo after\n").expect("send");

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen = Vec::new();
        while Instant::now() < deadline && !seen.ends_with(b"after\n") {
            transport.interrupt().expect("interrupt");
            if let ReadEvent::Data(chunk) = transport
                .poll_read(Duration::from_millis(100))
                .expect("poll")
            {
                seen.extend(chunk);
            }
        }
        assert_eq!(seen, b"after\n");
        assert!(transport.is_open());

        transport.close().expect("close");
    }

    #[test]
    fn spawn_failure_is_startup_error() {
        let mut transport = ProcessTransport::new(
            vec!["/nonexistent/definitely-not-a-shell".to_string()],
            Duration::from_secs(1),
        );
        let err = transport.open().unwrap_err();
        assert!(err.downcast_ref::<TransportStartupError>().is_some());
        assert!(!transport.is_open());
    }

    #[test]
    fn process_transport_round_trips_bytes_and_closes_idempotently() {
        let mut transport =
            ProcessTransport::new(vec!["cat".to_string()], Duration::from_secs(2));
        transport.open().expect("open");
        assert!(transport.is_open());

        transport.send(b"hello\n").expect("send");
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while Instant::now() < deadline && !seen.ends_with(b"hello\n") {
            if let ReadEvent::Data(chunk) = transport
                .poll_read(Duration::from_millis(50))
                .expect("poll")
            {
                seen.extend(chunk);
            }
        }
        assert_eq!(seen, b"hello\n");

        transport.close().expect("close");
        transport.close().expect("second close");
        assert!(!transport.is_open());
        assert_eq!(
            transport.poll_read(Duration::from_millis(1)).expect("poll"),
            ReadEvent::Closed
        );
    }
}
