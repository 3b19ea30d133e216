use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, instrument};

use crate::capabilities::{CapabilityOutput, Handler, InvokeContext};
use crate::core::dispatch::DispatchParseFailure;
use crate::core::text::last_non_empty_line;
use crate::core::types::CommandResult;
use crate::io::session::Session;
use crate::io::transport::Transport;

/// Run after a silent timeout: the command may have started a shell as
/// someone else, which then swallowed our trailer.
const IDENTITY_CHECK: &str = "id";

/// Runs the argument text verbatim as a shell command.
#[derive(Debug, Clone, Default)]
pub struct RunCommand {
    /// Overrides the session's default deadline.
    timeout: Option<Duration>,
}

impl RunCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

impl Handler for RunCommand {
    type Args = String;

    fn name(&self) -> &'static str {
        "exec_command"
    }

    fn usage(&self) -> &'static str {
        "<command>"
    }

    fn describe(&self) -> &'static str {
        "give a command to be executed and I will respond with the terminal output of \
         running it on the target machine. The command must not require user interaction \
         and must not start an interactive shell or editor. Do not put quotation marks \
         around the command."
    }

    fn parse_args(&self, raw: &str) -> Result<Self::Args, DispatchParseFailure> {
        Ok(raw.trim().to_string())
    }

    #[instrument(skip_all, fields(command = %command))]
    fn execute<T: Transport>(
        &self,
        session: &mut Session<T>,
        ctx: &InvokeContext<'_>,
        command: String,
    ) -> Result<CapabilityOutput> {
        let timeout = self.timeout.unwrap_or_else(|| session.default_timeout());
        let result = session.run_with_timeout(&command, timeout)?;

        let mut output = render_result(&result);
        let mut evidence = last_non_empty_line(&result.stdout);

        if result.timed_out && result.stdout.trim().is_empty() {
            info!("command timed out without output, checking identity");
            let identity = session.run(IDENTITY_CHECK)?;
            if !identity.timed_out && !identity.stdout.trim().is_empty() {
                evidence = last_non_empty_line(&identity.stdout);
                output.push_str(&format!("\nidentity after timeout: {evidence}\n"));
            }
        }

        let hostname = &session.identity().hostname;
        let got_root = ctx.detector.got_root(hostname, &evidence);
        debug!(
            return_code = result.return_code,
            timed_out = result.timed_out,
            got_root,
            "command finished"
        );
        Ok(CapabilityOutput { output, got_root })
    }
}

fn render_result(result: &CommandResult) -> String {
    let mut output = result.stdout.clone();
    if !result.stderr.is_empty() {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&result.stderr);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::root_detect::ShellRootDetector;
    use crate::test_support::{ScriptedShell, ShellReply, scripted_session};

    fn ctx(detector: &ShellRootDetector) -> InvokeContext<'_> {
        InvokeContext {
            detector,
            target_user: "root",
        }
    }

    #[test]
    fn root_identity_output_is_detected() {
        let detector = ShellRootDetector::new();
        let mut session = scripted_session(ScriptedShell::new(|cmd| match cmd {
            "id" => ShellReply::ok("uid=0(root) gid=0(root) groups=0(root)"),
            _ => ShellReply::ok("uid=1000(user) gid=1000(user)"),
        }));

        let out = RunCommand::new()
            .execute(&mut session, &ctx(&detector), "id".to_string())
            .expect("execute");
        assert!(out.got_root);
        assert_eq!(out.output, "uid=0(root) gid=0(root) groups=0(root)");

        let out = RunCommand::new()
            .execute(&mut session, &ctx(&detector), "sudo -n id".to_string())
            .expect("execute");
        assert!(!out.got_root);
    }

    #[test]
    fn silent_timeout_checks_identity() {
        let detector = ShellRootDetector::new();
        let mut session = scripted_session(ScriptedShell::new(|cmd| match cmd {
            "sudo su" => ShellReply::Hang,
            "id" => ShellReply::ok("uid=0(root) gid=0(root) groups=0(root)"),
            _ => ShellReply::ok(""),
        }));

        let out = RunCommand::new()
            .execute(&mut session, &ctx(&detector), "sudo su".to_string())
            .expect("execute");
        assert!(out.got_root);
        assert!(out.output.contains("timed out"));
        assert!(out.output.contains("identity after timeout: uid=0(root)"));
        assert_eq!(
            session.channel().transport().commands(),
            vec!["sudo su".to_string(), "id".to_string()]
        );
    }

    #[test]
    fn timeout_with_output_skips_identity_check() {
        let detector = ShellRootDetector::new();
        let mut session = scripted_session(ScriptedShell::new(|cmd| match cmd {
            "tail -f log" => ShellReply::HangAfter("line 1".to_string()),
            _ => ShellReply::ok("unexpected"),
        }));

        let out = RunCommand::new()
            .execute(&mut session, &ctx(&detector), "tail -f log".to_string())
            .expect("execute");
        assert!(!out.got_root);
        assert!(out.output.starts_with("line 1\n"));
        assert_eq!(session.channel().transport().commands().len(), 1);
    }

    #[test]
    fn custom_detector_is_consulted() {
        let detector = |_host: &str, line: &str| line == "ROOTED";
        let ctx = InvokeContext {
            detector: &detector,
            target_user: "root",
        };
        let mut session = scripted_session(ScriptedShell::new(|_| ShellReply::ok("ROOTED")));
        let out = RunCommand::new()
            .execute(&mut session, &ctx, "exploit".to_string())
            .expect("execute");
        assert!(out.got_root);
    }
}
