//! Resolution of free text into a capability invocation.

use thiserror::Error;

use crate::core::types::Invocation;

/// The text could not be turned into a valid invocation.
///
/// Parse failures never reach the transport; they are reported back to the
/// turn loop as a failed round.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct DispatchParseFailure {
    pub reason: String,
}

impl DispatchParseFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Route `text` to a capability by its first whitespace-delimited token.
///
/// A matching name is stripped and the remainder becomes the arguments;
/// otherwise the whole text goes to `default`, if there is one.
pub fn resolve_invocation(
    text: &str,
    names: &[&str],
    default: Option<&str>,
) -> Result<Invocation, DispatchParseFailure> {
    let trimmed = text.trim();
    let (head, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim_start()),
        None => (trimmed, ""),
    };

    if let Some(name) = names.iter().find(|name| **name == head) {
        return Ok(Invocation {
            capability: (*name).to_string(),
            raw_args: rest.to_string(),
            raw_command: text.to_string(),
        });
    }

    match default {
        Some(default) => Ok(Invocation {
            capability: default.to_string(),
            raw_args: trimmed.to_string(),
            raw_command: text.to_string(),
        }),
        None if head.is_empty() => Err(DispatchParseFailure::new(format!(
            "Could not extract capability name from text: {text}"
        ))),
        None => Err(DispatchParseFailure::new(format!(
            "Unknown capability: {head}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAMES: &[&str] = &["exec_command", "test_credential"];

    #[test]
    fn named_capability_gets_remainder() {
        let inv = resolve_invocation("exec_command whoami", NAMES, Some("exec_command"))
            .expect("resolve");
        assert_eq!(inv.capability, "exec_command");
        assert_eq!(inv.raw_args, "whoami");
        assert_eq!(inv.raw_command, "exec_command whoami");
    }

    #[test]
    fn unknown_name_routes_whole_text_to_default() {
        let inv = resolve_invocation("whoami", NAMES, Some("exec_command")).expect("resolve");
        assert_eq!(inv.capability, "exec_command");
        assert_eq!(inv.raw_args, "whoami");

        let inv = resolve_invocation("cat /etc/passwd | grep sh", NAMES, Some("exec_command"))
            .expect("resolve");
        assert_eq!(inv.raw_args, "cat /etc/passwd | grep sh");
    }

    #[test]
    fn whitespace_runs_separate_name_and_args() {
        let inv = resolve_invocation("test_credential \t lowpriv  trustno1", NAMES, None)
            .expect("resolve");
        assert_eq!(inv.capability, "test_credential");
        assert_eq!(inv.raw_args, "lowpriv  trustno1");
    }

    #[test]
    fn name_prefix_is_not_a_match() {
        let inv =
            resolve_invocation("exec_commandx id", NAMES, Some("exec_command")).expect("resolve");
        assert_eq!(inv.capability, "exec_command");
        assert_eq!(inv.raw_args, "exec_commandx id");
    }

    #[test]
    fn unknown_name_without_default_fails() {
        let err = resolve_invocation("whoami", NAMES, None).unwrap_err();
        assert_eq!(err.reason, "Unknown capability: whoami");
        let err = resolve_invocation("   ", NAMES, None).unwrap_err();
        assert!(err.reason.contains("Could not extract capability name"));
    }
}
