//! Shared data types for tether-shell.

use serde::{Deserialize, Serialize};
use std::fmt;
use tether_core::RedactRule;

// ---------------------------------------------------------------------------
// Sentinel exit codes
// ---------------------------------------------------------------------------

/// Exit codes reserved for supervisor failures.
///
/// All are negative so they can never be confused with a real child status,
/// which is always in `0..=255`.
pub mod code {
    /// The shell died while we were writing to it.
    pub const BROKEN_PIPE: i32 = -1;
    /// The session is not in the `Running` state.
    pub const NOT_RUNNING: i32 = -2;
    /// The command failed validation and never reached a shell.
    pub const REJECTED: i32 = -3;
    /// The command outlived the configured timeout and was killed.
    pub const TIMEOUT: i32 = -4;
    /// The OS refused to spawn the child.
    pub const SPAWN_FAILED: i32 = -5;

    /// `true` for any of the reserved codes above.
    pub fn is_sentinel(code: i32) -> bool {
        (SPAWN_FAILED..=BROKEN_PIPE).contains(&code)
    }
}

/// Message carried in stderr for rejected commands.
pub const CHECK_FAILED_MSG: &str = "Command check failed!";

// ---------------------------------------------------------------------------
// CompletedProcess
// ---------------------------------------------------------------------------

/// Outcome of a single-shot run or of one session checkpoint.
///
/// Output is kept as raw bytes; nothing is decoded or trimmed until
/// [`CompletedProcess::render`] is called.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedProcess {
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl CompletedProcess {
    pub fn new(exit_code: i32, stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Result for input the validator refused.
    pub fn rejected(reason: &str) -> Self {
        Self::new(code::REJECTED, Vec::new(), reason)
    }

    /// Result for an operation on a session that is not running.
    pub fn not_running() -> Self {
        Self::new(code::NOT_RUNNING, Vec::new(), Vec::new())
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    /// The supervisor, not the child, produced this exit code.
    pub fn is_sentinel(&self) -> bool {
        code::is_sentinel(self.exit_code)
    }

    /// Format the result as a user-facing block.
    ///
    /// ```text
    /// Return code: 0
    ///
    /// STDOUT:
    /// hi
    /// ```
    ///
    /// Empty streams are omitted, a stream that is not valid UTF-8 shows as
    /// `<BIN>`, exactly one trailing newline is dropped, and then every rule
    /// is applied in order as a literal substring replacement.
    pub fn render(&self, rules: &[RedactRule]) -> String {
        let mut output = format!("Return code: {}\n", self.exit_code);
        if !self.stdout.is_empty() {
            output.push_str("\nSTDOUT: \n");
            output.push_str(decode(&self.stdout));
        }
        if !self.stderr.is_empty() {
            output.push_str("\nSTDERR: \n");
            output.push_str(decode(&self.stderr));
        }
        if output.ends_with('\n') {
            output.pop();
        }

        for rule in rules {
            // An empty pattern would match between every character.
            if rule.pattern.is_empty() {
                continue;
            }
            output = output.replace(&rule.pattern, &rule.replace);
        }
        output
    }
}

impl fmt::Display for CompletedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(&[]))
    }
}

fn decode(raw: &[u8]) -> &str {
    std::str::from_utf8(raw).unwrap_or("<BIN>")
}

// ---------------------------------------------------------------------------
// SessionState / SessionInfo
// ---------------------------------------------------------------------------

/// Lifecycle of a [`crate::session::Session`]. `Terminated` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    NotStarted,
    Running,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::NotStarted => "not_started",
            SessionState::Running => "running",
            SessionState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Snapshot of a session, as returned by `SessionManager::list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: String,
    pub state: SessionState,
    /// PID of the shell while it is running.
    pub pid: Option<u32>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_success_with_stdout() {
        let result = CompletedProcess::new(0, b"hi\n".to_vec(), Vec::new());
        assert_eq!(result.render(&[]), "Return code: 0\n\nSTDOUT: \nhi");
    }

    #[test]
    fn render_code_only() {
        let result = CompletedProcess::new(1, Vec::new(), Vec::new());
        assert_eq!(result.render(&[]), "Return code: 1");
    }

    #[test]
    fn render_both_streams() {
        let result = CompletedProcess::new(2, b"out\n".to_vec(), b"err\n".to_vec());
        assert_eq!(
            result.render(&[]),
            "Return code: 2\n\nSTDOUT: \nout\n\nSTDERR: \nerr"
        );
    }

    #[test]
    fn render_strips_exactly_one_newline() {
        let result = CompletedProcess::new(0, b"a\n\n".to_vec(), Vec::new());
        assert!(result.render(&[]).ends_with("a\n"));

        // No trailing newline: nothing is cut.
        let result = CompletedProcess::new(0, b"abc".to_vec(), Vec::new());
        assert!(result.render(&[]).ends_with("abc"));
    }

    #[test]
    fn render_marks_binary_output() {
        let result = CompletedProcess::new(0, vec![0xff, 0xfe, b'\n'], Vec::new());
        assert_eq!(result.render(&[]), "Return code: 0\n\nSTDOUT: \n<BIN>");
    }

    #[test]
    fn render_applies_rules_in_order() {
        let result = CompletedProcess::new(0, b"token=abc123\n".to_vec(), Vec::new());
        let rules = vec![
            RedactRule::new("abc123", "SECRET"),
            RedactRule::new("SECRET", "***"),
        ];
        assert_eq!(result.render(&rules), "Return code: 0\n\nSTDOUT: \ntoken=***");
    }

    #[test]
    fn render_skips_empty_pattern() {
        let result = CompletedProcess::new(0, b"x\n".to_vec(), Vec::new());
        let rules = vec![RedactRule::new("", "!")];
        assert_eq!(result.render(&rules), result.render(&[]));
    }

    #[test]
    fn render_is_pure() {
        let result = CompletedProcess::new(
            0,
            b"password: hunter2\n".to_vec(),
            b"hunter2\n".to_vec(),
        );
        let rules = vec![RedactRule::new("hunter2", "*******")];
        let first = result.render(&rules);
        let second = result.render(&rules);
        assert_eq!(first, second);
        assert!(!first.contains("hunter2"));
        // The stored bytes are untouched.
        assert_eq!(result.stdout(), b"password: hunter2\n");
    }

    #[test]
    fn bytes_are_preserved_exactly() {
        let raw: Vec<u8> = (0u8..=255).collect();
        let result = CompletedProcess::new(0, raw.clone(), raw.clone());
        assert_eq!(result.stdout(), raw.as_slice());
        assert_eq!(result.stderr(), raw.as_slice());
    }

    #[test]
    fn sentinel_codes_are_distinct_from_real_codes() {
        for c in [
            code::BROKEN_PIPE,
            code::NOT_RUNNING,
            code::REJECTED,
            code::TIMEOUT,
            code::SPAWN_FAILED,
        ] {
            assert!(code::is_sentinel(c));
            assert!(!(0..=255).contains(&c));
        }
        assert!(!code::is_sentinel(0));
        assert!(!code::is_sentinel(137));
    }

    #[test]
    fn rejected_carries_message() {
        let result = CompletedProcess::rejected(CHECK_FAILED_MSG);
        assert_eq!(result.exit_code(), code::REJECTED);
        assert_eq!(result.stderr(), CHECK_FAILED_MSG.as_bytes());
        assert!(result.is_sentinel());
    }

    #[test]
    fn display_matches_unredacted_render() {
        let result = CompletedProcess::new(0, b"ok\n".to_vec(), Vec::new());
        assert_eq!(result.to_string(), result.render(&[]));
    }

    #[test]
    fn serializes_to_json() {
        let result = CompletedProcess::new(3, b"a".to_vec(), Vec::new());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["exit_code"], 3);
        assert_eq!(json["stdout"], serde_json::json!([97]));
    }
}
