use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use tracing::{debug, info, instrument};

use crate::capabilities::{CapabilityOutput, Handler, InvokeContext};
use crate::core::dispatch::DispatchParseFailure;
use crate::core::text::{last_non_empty_line, shell_quote};
use crate::io::session::Session;
use crate::io::transport::Transport;

static USERNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("username regex is valid"));

const REJECTION_MARKERS: &[&str] = &[
    "authentication failure",
    "incorrect password",
    "sorry, try again",
    "su: failure",
];

/// Ways to feed a password to `su`/`sudo` without an interactive terminal, in
/// the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStrategy {
    /// A python pseudo-terminal around `su`.
    PtyHelper,
    /// `script` providing the terminal `su` wants.
    ScriptWrapper,
    /// `sudo -S`, which reads the password from stdin.
    SudoFeed,
}

impl CredentialStrategy {
    pub const ALL: [Self; 3] = [Self::PtyHelper, Self::ScriptWrapper, Self::SudoFeed];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PtyHelper => "pty_helper",
            Self::ScriptWrapper => "script_wrapper",
            Self::SudoFeed => "sudo_feed",
        }
    }

    /// Shell command that prints the resulting identity on success.
    ///
    /// `username` must already be validated; the password is quoted here.
    pub fn command(self, username: &str, password: &str) -> String {
        let feed = format!("printf '%s\\n' {}", shell_quote(password));
        match self {
            Self::PtyHelper => format!(
                "{feed} | python3 -c 'import pty,sys; pty.spawn([\"su\", sys.argv[1], \"-c\", \"whoami\"])' {username} 2>/dev/null"
            ),
            Self::ScriptWrapper => {
                format!("{feed} | script -qc 'su {username} -c whoami' /dev/null 2>/dev/null")
            }
            Self::SudoFeed => format!("{feed} | sudo -S -u {username} whoami 2>/dev/null"),
        }
    }
}

/// What one strategy attempt established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialOutcome {
    /// The switch worked; carries the identity it reported.
    Accepted(String),
    /// The password was refused.
    Rejected,
    /// Nothing recognisable came back.
    Inconclusive,
}

/// Classify the output of one strategy attempt.
pub fn classify_attempt(stdout: &str, username: &str, target_user: &str) -> CredentialOutcome {
    let last = last_non_empty_line(stdout);
    if last == target_user || last == username {
        return CredentialOutcome::Accepted(last);
    }
    let lower = stdout.to_lowercase();
    if REJECTION_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return CredentialOutcome::Rejected;
    }
    CredentialOutcome::Inconclusive
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Checks a username/password pair by switching user on the target.
#[derive(Debug, Clone)]
pub struct TestCredential {
    strategies: Vec<CredentialStrategy>,
}

impl Default for TestCredential {
    fn default() -> Self {
        Self {
            strategies: CredentialStrategy::ALL.to_vec(),
        }
    }
}

impl TestCredential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategies(strategies: Vec<CredentialStrategy>) -> Self {
        Self { strategies }
    }
}

impl Handler for TestCredential {
    type Args = Credentials;

    fn name(&self) -> &'static str {
        "test_credential"
    }

    fn usage(&self) -> &'static str {
        "<username> <password>"
    }

    fn describe(&self) -> &'static str {
        "give credentials to be tested by switching to that user on the target. \
         This is best-effort: su may need a terminal the session cannot provide."
    }

    fn parse_args(&self, raw: &str) -> Result<Self::Args, DispatchParseFailure> {
        let parts: Vec<&str> = raw.split_whitespace().collect();
        let [username, password] = parts.as_slice() else {
            return Err(DispatchParseFailure::new(format!(
                "{} expects exactly two arguments: {}",
                self.name(),
                self.usage()
            )));
        };
        if !USERNAME_RE.is_match(username) {
            return Err(DispatchParseFailure::new(format!(
                "invalid username {username:?}: only letters, digits, '.', '_' and '-' are allowed"
            )));
        }
        Ok(Credentials {
            username: (*username).to_string(),
            password: (*password).to_string(),
        })
    }

    #[instrument(skip_all, fields(username = %args.username))]
    fn execute<T: Transport>(
        &self,
        session: &mut Session<T>,
        ctx: &InvokeContext<'_>,
        args: Self::Args,
    ) -> Result<CapabilityOutput> {
        for strategy in &self.strategies {
            let result = session.run(&strategy.command(&args.username, &args.password))?;
            let outcome = if result.timed_out {
                CredentialOutcome::Inconclusive
            } else {
                classify_attempt(&result.stdout, &args.username, ctx.target_user)
            };
            debug!(strategy = strategy.as_str(), ?outcome, "credential attempt");

            if let CredentialOutcome::Accepted(identity) = outcome {
                info!(strategy = strategy.as_str(), identity = %identity, "credentials accepted");
                if identity == ctx.target_user {
                    return Ok(CapabilityOutput {
                        output: format!("Login as {} was successful\n", ctx.target_user),
                        got_root: true,
                    });
                }
                return Ok(CapabilityOutput {
                    output: format!(
                        "Authentication successful as {}, but user is not {}\n",
                        args.username, ctx.target_user
                    ),
                    got_root: false,
                });
            }
        }

        Ok(CapabilityOutput {
            output: "Authentication error, credentials are wrong or su requires a TTY we can't provide\n"
                .to_string(),
            got_root: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::root_detect::ShellRootDetector;
    use crate::test_support::{ScriptedShell, ShellReply, scripted_session};

    fn run(shell: ScriptedShell, raw: &str) -> (CapabilityOutput, Vec<String>) {
        let detector = ShellRootDetector::new();
        let ctx = InvokeContext {
            detector: &detector,
            target_user: "root",
        };
        let mut session = scripted_session(shell);
        let capability = TestCredential::new();
        let args = capability.parse_args(raw).expect("args");
        let out = capability
            .execute(&mut session, &ctx, args)
            .expect("execute");
        (out, session.channel().transport().commands())
    }

    #[test]
    fn parse_requires_exactly_two_arguments() {
        let capability = TestCredential::new();
        assert!(capability.parse_args("root").is_err());
        assert!(capability.parse_args("root pass extra").is_err());
        let creds = capability.parse_args("  root   toor ").expect("args");
        assert_eq!(creds.username, "root");
        assert_eq!(creds.password, "toor");
    }

    #[test]
    fn parse_rejects_shell_metacharacters_in_username() {
        let err = TestCredential::new()
            .parse_args("root;id toor")
            .unwrap_err();
        assert!(err.reason.contains("invalid username"));
    }

    #[test]
    fn password_is_single_quoted() {
        let cmd = CredentialStrategy::SudoFeed.command("bob", "it's $HOME");
        assert_eq!(
            cmd,
            "printf '%s\\n' 'it'\\''s $HOME' | sudo -S -u bob whoami 2>/dev/null"
        );
    }

    #[test]
    fn classify_attempt_outcomes() {
        assert_eq!(
            classify_attempt("Password: \r\nroot\r\n", "root", "root"),
            CredentialOutcome::Accepted("root".to_string())
        );
        assert_eq!(
            classify_attempt("bob\n", "bob", "root"),
            CredentialOutcome::Accepted("bob".to_string())
        );
        assert_eq!(
            classify_attempt("su: Authentication failure\n", "root", "root"),
            CredentialOutcome::Rejected
        );
        assert_eq!(
            classify_attempt("", "root", "root"),
            CredentialOutcome::Inconclusive
        );
    }

    #[test]
    fn first_conclusive_strategy_wins() {
        let shell = ScriptedShell::new(|cmd| {
            if cmd.contains("python3") {
                ShellReply::ok("")
            } else if cmd.contains("script -qc") {
                ShellReply::ok("Password: \nroot")
            } else {
                ShellReply::ok("should not run")
            }
        });
        let (out, commands) = run(shell, "root toor");
        assert!(out.got_root);
        assert_eq!(out.output, "Login as root was successful\n");
        assert_eq!(commands.len(), 2);
    }

    #[test]
    fn non_root_login_is_reported() {
        let shell = ScriptedShell::new(|_| ShellReply::ok("bob"));
        let (out, commands) = run(shell, "bob secret");
        assert!(!out.got_root);
        assert_eq!(
            out.output,
            "Authentication successful as bob, but user is not root\n"
        );
        assert_eq!(commands.len(), 1);
    }

    #[test]
    fn all_strategies_inconclusive() {
        let shell = ScriptedShell::new(|_| ShellReply::output("su: Authentication failure", 1));
        let (out, commands) = run(shell, "root wrong");
        assert!(!out.got_root);
        assert!(out.output.starts_with("Authentication error"));
        assert_eq!(commands.len(), 3);
    }
}
