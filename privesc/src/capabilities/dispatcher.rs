use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{Capability, InvokeContext};
use crate::core::dispatch::resolve_invocation;
use crate::core::root_detect::RootDetector;
use crate::io::session::Session;
use crate::io::transport::Transport;

/// Result of dispatching one piece of free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The text did not form a valid invocation; nothing was sent.
    Rejected { reason: String },
    Executed {
        capability: &'static str,
        arguments: String,
        output: String,
        got_root: bool,
        duration: Duration,
    },
}

impl DispatchOutcome {
    /// Text recorded in history for this outcome.
    pub fn output(&self) -> &str {
        match self {
            Self::Rejected { reason } => reason,
            Self::Executed { output, .. } => output,
        }
    }

    pub fn got_root(&self) -> bool {
        matches!(self, Self::Executed { got_root: true, .. })
    }
}

/// Routes free text to registered capabilities bound to one session.
pub struct CapabilityDispatcher<T: Transport> {
    session: Session<T>,
    capabilities: Vec<Capability>,
    default: Option<usize>,
    detector: Box<dyn RootDetector>,
    target_user: String,
}

impl<T: Transport> CapabilityDispatcher<T> {
    pub fn new(
        session: Session<T>,
        detector: Box<dyn RootDetector>,
        target_user: impl Into<String>,
    ) -> Self {
        Self {
            session,
            capabilities: Vec::new(),
            default: None,
            detector,
            target_user: target_user.into(),
        }
    }

    /// Register `capability`; names must be unique and at most one is the default.
    pub fn register(&mut self, capability: impl Into<Capability>, default: bool) -> Result<()> {
        let capability = capability.into();
        let name = capability.name();
        if self.capabilities.iter().any(|c| c.name() == name) {
            return Err(anyhow!("capability {name} is already registered"));
        }
        if default && let Some(existing) = self.default {
            return Err(anyhow!(
                "default capability already set to {}",
                self.capabilities[existing].name()
            ));
        }
        if default {
            self.default = Some(self.capabilities.len());
        }
        debug!(name, default, "capability registered");
        self.capabilities.push(capability);
        Ok(())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.capabilities.iter().map(Capability::name).collect()
    }

    pub fn default_name(&self) -> Option<&'static str> {
        self.default.map(|idx| self.capabilities[idx].name())
    }

    /// One line per capability: `` `name <usage>`: description ``.
    pub fn capability_block(&self) -> String {
        self.capabilities
            .iter()
            .map(|c| format!("`{} {}`: {}", c.name(), c.usage(), c.describe()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session<T> {
        &mut self.session
    }

    /// Parse `text` into an invocation and run it.
    ///
    /// Parse failures come back as [`DispatchOutcome::Rejected`]; errors are
    /// transport or runtime failures.
    #[instrument(skip_all, fields(text_len = text.len()))]
    pub fn dispatch(&mut self, text: &str) -> Result<DispatchOutcome> {
        let names = self.names();
        let invocation = match resolve_invocation(text, &names, self.default_name()) {
            Ok(invocation) => invocation,
            Err(failure) => {
                warn!(reason = %failure.reason, "dispatch rejected");
                return Ok(DispatchOutcome::Rejected {
                    reason: failure.reason,
                });
            }
        };

        let capability = self
            .capabilities
            .iter()
            .find(|c| c.name() == invocation.capability)
            .ok_or_else(|| anyhow!("resolved unknown capability {}", invocation.capability))?;

        let ctx = InvokeContext {
            detector: self.detector.as_ref(),
            target_user: &self.target_user,
        };
        let started = Instant::now();
        let result = capability.invoke(&mut self.session, &ctx, &invocation.raw_args)?;
        let duration = started.elapsed();

        match result {
            Ok(out) => {
                info!(
                    capability = capability.name(),
                    got_root = out.got_root,
                    duration_ms = duration.as_millis() as u64,
                    "capability executed"
                );
                Ok(DispatchOutcome::Executed {
                    capability: capability.name(),
                    arguments: invocation.raw_args.trim().to_string(),
                    output: out.output,
                    got_root: out.got_root,
                    duration,
                })
            }
            Err(failure) => {
                warn!(capability = capability.name(), reason = %failure.reason, "invalid arguments");
                Ok(DispatchOutcome::Rejected {
                    reason: failure.reason,
                })
            }
        }
    }

    /// Close the underlying session.
    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{RunCommand, TestCredential};
    use crate::core::root_detect::ShellRootDetector;
    use crate::test_support::{ScriptedShell, ShellReply, scripted_session};

    fn dispatcher(shell: ScriptedShell) -> CapabilityDispatcher<ScriptedShell> {
        let mut dispatcher = CapabilityDispatcher::new(
            scripted_session(shell),
            Box::new(ShellRootDetector::new()),
            "root",
        );
        dispatcher.register(RunCommand::new(), true).expect("register");
        dispatcher
            .register(TestCredential::new(), false)
            .expect("register");
        dispatcher
    }

    fn whoami_shell() -> ScriptedShell {
        ScriptedShell::new(|cmd| match cmd {
            "whoami" => ShellReply::ok("lowpriv"),
            _ => ShellReply::output("", 127),
        })
    }

    #[test]
    fn named_and_default_routes_agree() {
        let mut dispatcher = dispatcher(whoami_shell());

        let named = dispatcher.dispatch("exec_command whoami").expect("dispatch");
        let bare = dispatcher.dispatch("whoami").expect("dispatch");
        for outcome in [&named, &bare] {
            let DispatchOutcome::Executed {
                capability,
                arguments,
                output,
                got_root,
                ..
            } = outcome
            else {
                panic!("expected execution, got {outcome:?}");
            };
            assert_eq!(*capability, "exec_command");
            assert_eq!(arguments, "whoami");
            assert_eq!(output, "lowpriv");
            assert!(!got_root);
        }
    }

    #[test]
    fn malformed_credentials_never_reach_transport() {
        let mut dispatcher = dispatcher(whoami_shell());
        let outcome = dispatcher.dispatch("test_credential root").expect("dispatch");
        assert!(matches!(outcome, DispatchOutcome::Rejected { .. }));
        assert!(outcome.output().contains("expects exactly two arguments"));
        assert_eq!(dispatcher.session().channel().transport().opens(), 0);
    }

    #[test]
    fn unknown_capability_without_default_is_rejected() {
        let mut dispatcher = CapabilityDispatcher::new(
            scripted_session(whoami_shell()),
            Box::new(ShellRootDetector::new()),
            "root",
        );
        dispatcher
            .register(TestCredential::new(), false)
            .expect("register");
        let outcome = dispatcher.dispatch("whoami").expect("dispatch");
        assert_eq!(
            outcome,
            DispatchOutcome::Rejected {
                reason: "Unknown capability: whoami".to_string()
            }
        );
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut dispatcher = dispatcher(whoami_shell());
        assert!(dispatcher.register(RunCommand::new(), false).is_err());
    }

    #[test]
    fn capability_block_lists_usage() {
        let dispatcher = dispatcher(whoami_shell());
        let block = dispatcher.capability_block();
        let lines: Vec<&str> = block.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("`exec_command <command>`: give a command"));
        assert!(lines[1].starts_with("`test_credential <username> <password>`: "));
    }
}
