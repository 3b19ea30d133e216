//! Marker framing for interactive shell sessions.
//!
//! A framed command is the user command followed by a return-code trailer and
//! an end marker:
//!
//! ```text
//! <command>; echo <rc><status><rc>; echo <end>
//! ```
//!
//! On the wire every marker is split by an empty quoted string (`__PE_""END_x__`),
//! so echoed input, wrapped or not, never holds a marker the shell has not
//! printed itself.
//!
//! Everything here is pure: markers are passed in, raw output is parsed. The
//! channel in [`crate::io::channel`] owns generation and the read loop.

use regex::Regex;

use crate::core::text::strip_ansi;
use crate::core::types::{CommandResult, UNKNOWN_RETURN_CODE};

/// Shortest echo tail recognised without the whole end marker.
const MIN_ECHO_TAIL: usize = 4;

/// The pair of per-command markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    pub end: String,
    pub rc: String,
}

impl Markers {
    pub fn new(end: impl Into<String>, rc: impl Into<String>) -> Self {
        Self {
            end: end.into(),
            rc: rc.into(),
        }
    }

    /// The line written to the session for `command` (without newline).
    pub fn compose(&self, command: &str) -> String {
        format!(
            "{command}; echo {rc}$?{rc}; echo {end}",
            rc = wire_form(&self.rc),
            end = wire_form(&self.end)
        )
    }
}

/// `marker` as typed into the shell: split in the middle by `""`, which the
/// shell removes when it prints the word.
pub fn wire_form(marker: &str) -> String {
    let mid = marker
        .char_indices()
        .nth(marker.chars().count() / 2)
        .map_or(marker.len(), |(idx, _)| idx);
    format!("{}\"\"{}", &marker[..mid], &marker[mid..])
}

/// True if `line`, without colour codes and surrounding whitespace, is exactly
/// `marker`.
pub fn is_marker_line(line: &str, marker: &str) -> bool {
    strip_ansi(line).trim() == marker
}

/// True once any complete line of `raw` is a marker line.
pub fn contains_marker_line(raw: &str, marker: &str) -> bool {
    let complete = match raw.rfind('\n') {
        Some(idx) => &raw[..idx],
        None => return false,
    };
    complete.split('\n').any(|line| is_marker_line(line, marker))
}

/// True if `lines[idx]` ends an echo of the wire line, whole or wrapped by the
/// terminal over several lines. `wire` is already [`compact`]ed.
fn is_echo_tail(lines: &[&str], idx: usize, wire: &str, end_wire: &str) -> bool {
    if strip_ansi(lines[idx]).contains(end_wire) {
        return true;
    }
    let mut tail = String::new();
    for line in lines[..=idx].iter().rev() {
        let joined = format!("{}{tail}", compact(&strip_ansi(line)));
        if joined.is_empty() || !wire.ends_with(&joined) {
            break;
        }
        tail = joined;
    }
    tail.len() >= MIN_ECHO_TAIL
}

/// Text after the last carriage return, without whitespace. Line-editing
/// shells redraw wrapped input after a bare `\r`.
fn compact(line: &str) -> String {
    let line = line.trim_end_matches('\r');
    line.rsplit('\r')
        .next()
        .unwrap_or(line)
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

/// Split raw session output into the command's stdout and its return code.
///
/// Drops echoed input, the return-code line and everything from the end marker
/// on. Returns `None` for the code when no return-code line was seen.
pub fn parse_framed_output(raw: &str, markers: &Markers, wire: &str) -> (String, Option<i32>) {
    let rc_re = Regex::new(&format!(
        "{rc}(\\d+){rc}",
        rc = regex::escape(&markers.rc)
    ))
    .ok();
    let wire = compact(wire);
    let end_wire = wire_form(&markers.end);

    let lines: Vec<&str> = raw
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .collect();
    let stop = lines
        .iter()
        .position(|line| is_marker_line(line, &markers.end))
        .unwrap_or(lines.len());
    let lines = &lines[..stop];
    let start = (0..lines.len())
        .rposition(|idx| is_echo_tail(lines, idx, &wire, &end_wire))
        .map_or(0, |idx| idx + 1);

    let mut kept = Vec::new();
    let mut return_code = None;
    for line in &lines[start..] {
        if let Some(caps) = rc_re.as_ref().and_then(|re| re.captures(line)) {
            return_code = caps[1].parse::<i32>().ok();
            // Output without a trailing newline shares the line with the code.
            let before = caps.get(0).map_or("", |m| &line[..m.start()]);
            if !before.trim().is_empty() {
                kept.push(before);
            }
            continue;
        }
        if line.contains(&markers.rc) || line.contains(&markers.end) {
            continue;
        }
        kept.push(line);
    }

    let stdout = strip_ansi(kept.join("\n").trim());
    (stdout, return_code)
}

/// Build the result for a command whose end marker arrived.
pub fn completed_result(raw: &str, markers: &Markers, wire: &str) -> CommandResult {
    let (stdout, return_code) = parse_framed_output(raw, markers, wire);
    CommandResult {
        stdout,
        stderr: String::new(),
        return_code: return_code.unwrap_or(UNKNOWN_RETURN_CODE),
        timed_out: false,
    }
}

/// Build the result for a command whose end marker never arrived.
pub fn incomplete_result(
    raw: &str,
    markers: &Markers,
    wire: &str,
    timed_out: bool,
    diagnostic: String,
) -> CommandResult {
    let (stdout, _) = parse_framed_output(raw, markers, wire);
    CommandResult {
        stdout,
        stderr: diagnostic,
        return_code: UNKNOWN_RETURN_CODE,
        timed_out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> Markers {
        Markers::new("__END_abc__", "__RC_xyz__")
    }

    #[test]
    fn compose_appends_trailer() {
        assert_eq!(
            markers().compose("id"),
            r#"id; echo __RC_""xyz__$?__RC_""xyz__; echo __END""_abc__"#
        );
    }

    #[test]
    fn wire_form_prints_as_the_marker() {
        assert_eq!(wire_form("__END_abc__"), r#"__END""_abc__"#);
        assert_eq!(wire_form("__RC_xyz__"), r#"__RC_""xyz__"#);
        assert_eq!(wire_form("x"), r#"""x"#);
        assert!(!markers().compose("id").contains("__END_abc__"));
    }

    #[test]
    fn marker_line_ignores_echoed_command() {
        let m = markers();
        let wire = m.compose("id");
        assert!(!is_marker_line(&wire, &m.end));
        assert!(is_marker_line("__END_abc__", &m.end));
        assert!(is_marker_line("__END_abc__\r", &m.end));
        assert!(is_marker_line("\x1b[0m__END_abc__ ", &m.end));
        assert!(!is_marker_line("$ __END_abc__", &m.end));
        assert!(!is_marker_line("o __END_abc__", &m.end));
        assert!(!is_marker_line("x__END_abc__y", &m.end));
    }

    #[test]
    fn contains_marker_line_requires_complete_line() {
        let m = markers();
        assert!(!contains_marker_line("output\n__END_abc__", &m.end));
        assert!(contains_marker_line("output\n__END_abc__\n", &m.end));
        assert!(contains_marker_line("output\r\n__END_abc__\r\n$ ", &m.end));
    }

    #[test]
    fn wrapped_echo_fragment_is_not_a_marker_line() {
        let m = markers();
        let raw = "$ some long command; echo RC$?RC; ech\r\no __END_abc__\r\n";
        assert!(!contains_marker_line(raw, &m.end));
    }

    #[test]
    fn parse_skips_echo_wrapped_by_the_terminal() {
        let m = markers();
        let wire = m.compose("cat /etc/hostname");
        let (head, tail) = wire.split_at(wire.find("; echo __END").expect("end trailer") + 5);
        let raw = format!(
            "$ {head}\r\n{tail}\r\nreal output\r\n__RC_xyz__0__RC_xyz__\r\n__END_abc__\r\n$ "
        );

        assert!(contains_marker_line(&raw, &m.end));
        let (stdout, rc) = parse_framed_output(&raw, &m, &wire);
        assert_eq!(stdout, "real output");
        assert_eq!(rc, Some(0));
    }

    #[test]
    fn parse_joins_short_wrapped_fragments() {
        let m = markers();
        let wire = m.compose("id");
        let (head, tail) = wire.split_at(wire.len() - 2);
        let (first, middle) = head.split_at(10);
        let raw = format!(
            "$ {first}\r\n{middle}\r\n{tail}\r\nuid=1000\r\n__RC_xyz__0__RC_xyz__\r\n__END_abc__\r\n"
        );

        let (stdout, rc) = parse_framed_output(&raw, &m, &wire);
        assert_eq!(stdout, "uid=1000");
        assert_eq!(rc, Some(0));
    }

    #[test]
    fn parse_keeps_output_sharing_the_return_code_line() {
        let m = markers();
        let raw = "no newline__RC_xyz__1__RC_xyz__\n__END_abc__\n";
        let (stdout, rc) = parse_framed_output(raw, &m, "");
        assert_eq!(stdout, "no newline");
        assert_eq!(rc, Some(1));
    }

    #[test]
    fn parse_drops_echo_markers_and_ansi() {
        let m = markers();
        let wire = m.compose("ls --color");
        let raw = format!(
            "{wire}\r\n\x1b[01;34mbin\x1b[0m\r\netc\r\n__RC_xyz__0__RC_xyz__\r\n__END_abc__\r\n$ "
        );

        let (stdout, rc) = parse_framed_output(&raw, &m, &wire);

        assert_eq!(stdout, "bin\netc");
        assert_eq!(rc, Some(0));
    }

    #[test]
    fn parse_extracts_return_code() {
        let m = markers();
        let wire = m.compose("false");
        let raw = "__RC_xyz__127__RC_xyz__\n__END_abc__\n";
        let result = completed_result(raw, &m, &wire);
        assert_eq!(result.return_code, 127);
        assert_eq!(result.stdout, "");
        assert!(!result.timed_out);
    }

    #[test]
    fn parse_without_rc_line_reports_unknown() {
        let m = markers();
        let result = completed_result("hello\n__END_abc__\n", &m, "");
        assert_eq!(result.stdout, "hello");
        assert_eq!(result.return_code, UNKNOWN_RETURN_CODE);
    }

    #[test]
    fn parse_keeps_multiline_output_verbatim() {
        let m = markers();
        let raw = "line one\n  indented\n\nline four\n__RC_xyz__0__RC_xyz__\n__END_abc__\n";
        let (stdout, _) = parse_framed_output(raw, &m, "");
        assert_eq!(stdout, "line one\n  indented\n\nline four");
    }

    #[test]
    fn incomplete_result_keeps_partial_output() {
        let m = markers();
        let wire = m.compose("sleep 100");
        let result = incomplete_result(
            &format!("{wire}\npartial\n"),
            &m,
            &wire,
            true,
            "timed out".to_string(),
        );
        assert_eq!(result.stdout, "partial");
        assert_eq!(result.return_code, UNKNOWN_RETURN_CODE);
        assert!(result.timed_out);
        assert_eq!(result.stderr, "timed out");
    }
}
