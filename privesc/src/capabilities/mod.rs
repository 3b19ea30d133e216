//! Named actions the reasoning provider can invoke against a session.
//!
//! The set is closed: [`Capability`] enumerates every kind, and each kind
//! implements [`Handler`]. Arguments are parsed before anything is sent, so a
//! malformed invocation never reaches the target.

mod dispatcher;
mod run_command;
mod test_credential;

pub use dispatcher::{CapabilityDispatcher, DispatchOutcome};
pub use run_command::RunCommand;
pub use test_credential::{CredentialOutcome, CredentialStrategy, TestCredential};

use anyhow::Result;

use crate::core::dispatch::DispatchParseFailure;
use crate::core::root_detect::RootDetector;
use crate::io::session::Session;
use crate::io::transport::Transport;

/// What a capability reports back for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityOutput {
    pub output: String,
    pub got_root: bool,
}

/// Run-wide facts a capability needs besides its session.
pub struct InvokeContext<'a> {
    pub detector: &'a dyn RootDetector,
    /// The user we are trying to become.
    pub target_user: &'a str,
}

/// The shared invocation interface.
pub trait Handler {
    type Args;

    fn name(&self) -> &'static str;

    /// Argument syntax shown in the capability block, e.g. `<command>`.
    fn usage(&self) -> &'static str;

    /// Advertised to the reasoning provider; the only contract it has.
    fn describe(&self) -> &'static str;

    fn parse_args(&self, raw: &str) -> Result<Self::Args, DispatchParseFailure>;

    fn execute<T: Transport>(
        &self,
        session: &mut Session<T>,
        ctx: &InvokeContext<'_>,
        args: Self::Args,
    ) -> Result<CapabilityOutput>;
}

#[derive(Debug, Clone)]
pub enum Capability {
    RunCommand(RunCommand),
    TestCredential(TestCredential),
}

impl Capability {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunCommand(c) => c.name(),
            Self::TestCredential(c) => c.name(),
        }
    }

    pub fn usage(&self) -> &'static str {
        match self {
            Self::RunCommand(c) => c.usage(),
            Self::TestCredential(c) => c.usage(),
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::RunCommand(c) => c.describe(),
            Self::TestCredential(c) => c.describe(),
        }
    }

    /// Parse `raw_args` and, if they are valid, execute.
    ///
    /// The outer error is a transport or runtime failure; the inner one is a
    /// rejected invocation that touched nothing.
    pub fn invoke<T: Transport>(
        &self,
        session: &mut Session<T>,
        ctx: &InvokeContext<'_>,
        raw_args: &str,
    ) -> Result<Result<CapabilityOutput, DispatchParseFailure>> {
        match self {
            Self::RunCommand(c) => invoke_with(c, session, ctx, raw_args),
            Self::TestCredential(c) => invoke_with(c, session, ctx, raw_args),
        }
    }
}

impl From<RunCommand> for Capability {
    fn from(value: RunCommand) -> Self {
        Self::RunCommand(value)
    }
}

impl From<TestCredential> for Capability {
    fn from(value: TestCredential) -> Self {
        Self::TestCredential(value)
    }
}

fn invoke_with<H: Handler, T: Transport>(
    handler: &H,
    session: &mut Session<T>,
    ctx: &InvokeContext<'_>,
    raw_args: &str,
) -> Result<Result<CapabilityOutput, DispatchParseFailure>> {
    let args = match handler.parse_args(raw_args) {
        Ok(args) => args,
        Err(failure) => return Ok(Err(failure)),
    };
    handler.execute(session, ctx, args).map(Ok)
}
