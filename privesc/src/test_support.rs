//! Test-only doubles: an in-memory shell transport and a scripted reasoner.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use regex::Regex;
use tempfile::TempDir;

use crate::core::budget::{ApproxTokenCounter, TokenCounter};
use crate::core::types::Identity;
use crate::io::channel::{ChannelSettings, FramedChannel};
use crate::io::config::{PrivescConfig, write_config};
use crate::io::reasoner::{Completion, Reasoner};
use crate::io::session::Session;
use crate::io::transport::{INTERRUPT_BYTE, ReadEvent, Transport};

static FRAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*); echo (\S+)\$\?(\S+); echo (\S+)$").expect("frame regex is valid")
});

/// How the scripted shell answers one framed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellReply {
    Output { stdout: String, code: i32 },
    /// Never finishes until interrupted.
    Hang,
    /// Prints the text, then hangs.
    HangAfter(String),
    /// The shell process exits.
    Exit,
}

impl ShellReply {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::output(stdout, 0)
    }

    pub fn output(stdout: impl Into<String>, code: i32) -> Self {
        Self::Output {
            stdout: stdout.into(),
            code,
        }
    }
}

/// In-memory [`Transport`] that behaves like a POSIX shell for framed commands.
pub struct ScriptedShell {
    handler: Box<dyn FnMut(&str) -> ShellReply>,
    echo: bool,
    wrap: Option<usize>,
    banner: Option<String>,
    fail_open: bool,
    die_on_start: bool,
    ignore_sync: bool,
    open: bool,
    exiting: bool,
    hung: bool,
    input: String,
    output: Vec<u8>,
    opens: usize,
    closes: usize,
    interrupts: usize,
    sent: Vec<String>,
    commands: Vec<String>,
}

impl ScriptedShell {
    pub fn new(handler: impl FnMut(&str) -> ShellReply + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            echo: false,
            wrap: None,
            banner: None,
            fail_open: false,
            die_on_start: false,
            ignore_sync: false,
            open: false,
            exiting: false,
            hung: false,
            input: String::new(),
            output: Vec::new(),
            opens: 0,
            closes: 0,
            interrupts: 0,
            sent: Vec::new(),
            commands: Vec::new(),
        }
    }

    /// Echo every input line back, like a terminal does.
    pub fn with_echo(mut self) -> Self {
        self.echo = true;
        self
    }

    /// Echo input like a terminal `width` columns wide, wrapping long lines.
    pub fn with_wrapped_echo(mut self, width: usize) -> Self {
        self.echo = true;
        self.wrap = Some(width.max(1));
        self
    }

    /// Print `banner` right after every open.
    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = Some(banner.into());
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Exit right after printing the banner.
    pub fn dying_on_start(mut self) -> Self {
        self.die_on_start = true;
        self
    }

    /// Never answer bare `echo` lines.
    pub fn ignoring_sync(mut self) -> Self {
        self.ignore_sync = true;
        self
    }

    pub fn opens(&self) -> usize {
        self.opens
    }

    pub fn closes(&self) -> usize {
        self.closes
    }

    pub fn interrupts(&self) -> usize {
        self.interrupts
    }

    /// Every `send`, decoded lossily.
    pub fn sent(&self) -> &[String] {
        &self.sent
    }

    /// User commands extracted from framed lines, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.clone()
    }

    fn feed_line(&mut self, line: &str) {
        if self.echo {
            self.echo_input(line);
        }
        if self.hung || self.exiting {
            return;
        }

        if let Some(caps) = FRAME_RE.captures(line) {
            let command = caps[1].to_string();
            let rc = unquote(&caps[2]);
            let end = unquote(&caps[4]);
            self.commands.push(command.clone());
            match (self.handler)(&command) {
                ShellReply::Output { stdout, code } => {
                    if !stdout.is_empty() {
                        self.emit(stdout.trim_end_matches('\n'));
                    }
                    self.emit(&format!("{rc}{code}{rc}"));
                    self.emit(&end);
                }
                ShellReply::Hang => self.hung = true,
                ShellReply::HangAfter(text) => {
                    self.emit(&text);
                    self.hung = true;
                }
                ShellReply::Exit => self.exiting = true,
            }
        } else if let Some(word) = line.strip_prefix("echo ") {
            if !self.ignore_sync {
                self.emit(&unquote(word));
            }
        }
    }

    fn echo_input(&mut self, line: &str) {
        let Some(width) = self.wrap else {
            self.emit(line);
            return;
        };
        let chars: Vec<char> = line.chars().collect();
        for row in chars.chunks(width) {
            let row: String = row.iter().collect();
            self.emit(&format!("{row}\r"));
        }
    }

    fn emit(&mut self, line: &str) {
        self.output.extend_from_slice(line.as_bytes());
        self.output.push(b'\n');
    }
}

impl Transport for ScriptedShell {
    fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        if self.fail_open {
            return Err(anyhow!("connection refused"));
        }
        self.opens += 1;
        self.open = true;
        self.exiting = self.die_on_start;
        self.hung = false;
        self.input.clear();
        self.output = self
            .banner
            .as_deref()
            .map(|banner| banner.as_bytes().to_vec())
            .unwrap_or_default();
        Ok(())
    }

    fn is_open(&mut self) -> bool {
        self.open && !self.exiting
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.open {
            return Err(anyhow!("transport is not open"));
        }
        self.sent.push(String::from_utf8_lossy(data).into_owned());
        if data == [INTERRUPT_BYTE] {
            self.interrupts += 1;
            self.hung = false;
            return Ok(());
        }

        self.input.push_str(&String::from_utf8_lossy(data));
        while let Some(idx) = self.input.find('\n') {
            let line: String = self.input.drain(..=idx).collect();
            self.feed_line(line.trim_end_matches(['\r', '\n']));
        }
        Ok(())
    }

    fn poll_read(&mut self, wait: Duration) -> Result<ReadEvent> {
        if !self.open {
            return Ok(ReadEvent::Closed);
        }
        if !self.output.is_empty() {
            return Ok(ReadEvent::Data(std::mem::take(&mut self.output)));
        }
        if self.exiting {
            self.open = false;
            return Ok(ReadEvent::Closed);
        }
        thread::sleep(wait.min(Duration::from_millis(1)));
        Ok(ReadEvent::Idle)
    }

    fn close(&mut self) -> Result<()> {
        if self.open {
            self.closes += 1;
        }
        self.open = false;
        self.exiting = false;
        self.hung = false;
        self.output.clear();
        self.input.clear();
        Ok(())
    }
}

/// What the shell prints for a word typed with empty quotes in it.
fn unquote(word: &str) -> String {
    word.replace("\"\"", "")
}

/// Channel timing short enough for unit tests.
pub fn fast_settings() -> ChannelSettings {
    ChannelSettings {
        timeout: Duration::from_millis(100),
        poll_interval: Duration::from_millis(5),
        startup_grace: Duration::from_millis(10),
        drain_quiet: Duration::from_millis(5),
        recovery_timeout: Duration::from_millis(100),
    }
}

pub fn scripted_session(shell: ScriptedShell) -> Session<ScriptedShell> {
    let identity = Identity {
        hostname: "target".to_string(),
        username: "lowpriv".to_string(),
        password: "trustno1".to_string(),
    };
    Session::new(identity, FramedChannel::new(shell, fast_settings()))
}

/// Reasoner that replays canned completions and records every prompt.
pub struct ScriptedReasoner {
    replies: RefCell<VecDeque<String>>,
    repeat: Option<String>,
    prompts: RefCell<Vec<String>>,
    context_size: usize,
}

impl ScriptedReasoner {
    /// Answer with `replies` in order, then fail.
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: RefCell::new(replies.into_iter().map(Into::into).collect()),
            repeat: None,
            prompts: RefCell::new(Vec::new()),
            context_size: 8192,
        }
    }

    /// Answer every prompt with `reply`.
    pub fn repeating(reply: impl Into<String>) -> Self {
        Self {
            repeat: Some(reply.into()),
            ..Self::new(Vec::<String>::new())
        }
    }

    pub fn with_context_size(mut self, context_size: usize) -> Self {
        self.context_size = context_size;
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl TokenCounter for ScriptedReasoner {
    fn count_tokens(&self, text: &str) -> usize {
        ApproxTokenCounter.count_tokens(text)
    }
}

impl Reasoner for ScriptedReasoner {
    fn complete(&self, prompt: &str) -> Result<Completion> {
        self.prompts.borrow_mut().push(prompt.to_string());
        let text = self
            .replies
            .borrow_mut()
            .pop_front()
            .or_else(|| self.repeat.clone())
            .ok_or_else(|| anyhow!("scripted reasoner has no reply left"))?;
        Ok(Completion {
            prompt_tokens: self.count_tokens(prompt),
            completion_tokens: self.count_tokens(&text),
            text,
        })
    }

    fn context_size(&self) -> usize {
        self.context_size
    }
}

/// A config file in its own temporary directory.
pub struct TestConfig {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl TestConfig {
    /// Write `config` as `privesc.toml` inside a fresh temporary directory.
    pub fn write(config: &PrivescConfig) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("privesc.toml");
        write_config(&path, config)?;
        Ok(Self { dir, path })
    }
}

/// Local `/bin/sh` config with timings suited to integration tests.
pub fn local_shell_config() -> PrivescConfig {
    let mut config = PrivescConfig::default();
    config.channel.timeout_secs = 5;
    config.channel.poll_interval_ms = 20;
    config.channel.startup_grace_ms = 100;
    config.channel.drain_quiet_ms = 100;
    config.channel.recovery_timeout_secs = 2;
    config.channel.close_timeout_secs = 2;
    config
}
