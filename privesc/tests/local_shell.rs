//! Framed channel tests against a real `/bin/sh` child process.
//!
//! A non-interactive shell prints no prompt and does not echo, so these cover
//! marker parsing, return codes, timeout recovery and session restarts on a
//! real byte stream rather than the scripted one.

use std::time::Duration;

use privesc::core::types::Identity;
use privesc::io::channel::{ChannelSettings, FramedChannel};
use privesc::io::config::TransportConfig;
use privesc::io::transport::ProcessTransport;

fn settings() -> ChannelSettings {
    ChannelSettings {
        timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(20),
        startup_grace: Duration::from_millis(100),
        drain_quiet: Duration::from_millis(100),
        recovery_timeout: Duration::from_secs(1),
    }
}

fn shell() -> FramedChannel<ProcessTransport> {
    let config = TransportConfig::Local {
        shell: vec!["/bin/sh".to_string()],
    };
    let identity = Identity {
        hostname: "localhost".to_string(),
        username: "lowpriv".to_string(),
        password: String::new(),
    };
    let transport = ProcessTransport::from_config(&config, &identity, Duration::from_secs(2));
    FramedChannel::new(transport, settings())
}

#[test]
fn echo_and_return_codes() {
    let mut channel = shell();

    let result = channel.run("echo hello").expect("run");
    assert_eq!(result.stdout, "hello");
    assert_eq!(result.return_code, 0);
    assert!(!result.timed_out);

    let result = channel.run("(exit 3)").expect("run");
    assert_eq!(result.stdout, "");
    assert_eq!(result.return_code, 3);

    channel.close().expect("close");
}

#[test]
fn multiline_output_and_redirected_stderr() {
    let mut channel = shell();

    let result = channel.run("printf 'a\\nb\\nc\\n'").expect("run");
    assert_eq!(result.stdout, "a\nb\nc");

    let result = channel
        .run("ls /definitely/not/here 2>&1")
        .expect("run");
    assert_ne!(result.return_code, 0);
    assert!(result.stdout.contains("/definitely/not/here"));

    channel.close().expect("close");
}

#[test]
fn state_persists_between_commands() {
    let mut channel = shell();
    channel.run("cd /tmp && FOO=bar").expect("run");
    assert_eq!(channel.run("pwd").expect("run").stdout, "/tmp");
    assert_eq!(channel.run("echo $FOO").expect("run").stdout, "bar");
    channel.close().expect("close");
}

#[test]
fn timed_out_command_keeps_the_shell_and_its_state() {
    let mut channel = shell();
    channel.run("cd /tmp && export KEEP=kept").expect("run");

    let result = channel
        .run_with_timeout("sleep 30", Duration::from_millis(300))
        .expect("run");
    assert!(result.timed_out);
    assert!(result.stderr.contains("timed out"));
    assert!(channel.is_started());

    let result = channel.run("pwd; echo \"$KEEP\"").expect("run");
    assert_eq!(result.stdout, "/tmp\nkept");
    assert_eq!(result.return_code, 0);
    assert!(channel.is_started());

    channel.close().expect("close");
}

#[test]
fn exited_shell_is_restarted() {
    let mut channel = shell();

    let result = channel.run("exit 0").expect("run");
    assert!(!result.timed_out);
    assert!(result.stderr.contains("session exited"));
    assert!(!channel.is_started());

    let result = channel.run("echo fresh").expect("run");
    assert_eq!(result.stdout, "fresh");
    assert!(channel.is_started());

    channel.close().expect("close");
    channel.close().expect("close again");
}
