//! Checkpoints: stream markers plus an out-of-band exit status channel.
//!
//! After each user command the session appends a status fragment that writes
//! `$?` to `{check_dir}/{token}`. The file is written under a `.part` name
//! and renamed into place, so it only becomes visible once complete. When the
//! session wants the output, it appends a marker fragment that echoes the
//! token on stdout and on stderr; everything read before the marker belongs
//! to the checkpoint. The stderr marker also carries `$?`, which is the
//! fallback status when no status file exists.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

const NANOS_PER_SEC: i128 = 1_000_000_000;

/// Unique marker for one checkpoint: `{session}-{unix_secs}-{nanos}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckpointToken(String);

impl CheckpointToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckpointToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-session token source and status-file bookkeeping.
#[derive(Debug)]
pub struct Checkpointer {
    session: String,
    dir: PathBuf,
    /// Last issued timestamp in nanoseconds; tokens are strictly increasing.
    last: i128,
    /// Status files the shell was asked to write and nobody has read yet.
    outstanding: HashSet<PathBuf>,
}

impl Checkpointer {
    pub fn new(session: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            session: session.into(),
            dir: dir.into(),
            last: 0,
            outstanding: HashSet::new(),
        }
    }

    /// Issue a fresh token.
    ///
    /// Wall-clock based, but bumped by one nanosecond whenever the clock has
    /// not advanced (or went backwards) since the previous token.
    pub fn next(&mut self) -> CheckpointToken {
        let now = Utc::now();
        let mut stamp =
            now.timestamp() as i128 * NANOS_PER_SEC + now.timestamp_subsec_nanos() as i128;
        if stamp <= self.last {
            stamp = self.last + 1;
        }
        self.last = stamp;

        CheckpointToken(format!(
            "{}-{}-{:09}",
            self.session,
            stamp.div_euclid(NANOS_PER_SEC),
            stamp.rem_euclid(NANOS_PER_SEC)
        ))
    }

    /// Location of the status file for `token`.
    pub fn path(&self, token: &CheckpointToken) -> PathBuf {
        self.dir.join(token.as_str())
    }

    /// Shell line that stores the previous command's `$?` in the status file.
    ///
    /// Registers the file as outstanding until [`Self::read_status`] or
    /// [`Self::purge`] removes it.
    pub fn status_fragment(&mut self, token: &CheckpointToken) -> String {
        let path = self.path(token);
        let part = part_path(&path);
        let fragment = format!(
            "echo $? >{part}; mv -f {part} {path}",
            part = shell_quote(&part),
            path = shell_quote(&path),
        );
        self.outstanding.insert(path);
        fragment
    }

    /// Shell lines that close the current checkpoint on both streams.
    ///
    /// The stderr marker goes first so its `$?` still refers to the last
    /// command rather than to the stdout `echo`.
    pub fn marker_fragment(token: &CheckpointToken) -> String {
        let quoted = shell_quote_str(token.as_str());
        format!("echo {quoted} \"$?\" >&2\necho {quoted}\n")
    }

    /// `true` once the status file for `token` exists.
    pub async fn status_ready(&self, token: &CheckpointToken) -> bool {
        tokio::fs::metadata(self.path(token))
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    /// Read and delete the status file for `token`.
    ///
    /// `None` when the file is missing or does not hold a number.
    pub async fn read_status(&mut self, token: &CheckpointToken) -> Option<i32> {
        let path = self.path(token);
        let text = tokio::fs::read_to_string(&path).await.ok()?;

        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), "failed to remove status file: {e}");
        }
        self.outstanding.remove(&path);

        let status = parse_status(&text);
        if status.is_none() {
            warn!(path = %path.display(), content = %text.trim(), "unparseable exit status");
        }
        status
    }

    /// Delete every status file (and `.part` sibling) this session still owns.
    pub fn purge(&mut self) {
        for path in self.outstanding.drain() {
            for candidate in [part_path(&path), path] {
                match std::fs::remove_file(&candidate) {
                    Ok(()) => debug!(path = %candidate.display(), "removed stale status file"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(path = %candidate.display(), "failed to remove status file: {e}")
                    }
                }
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}

/// Parse a decimal exit status, ignoring surrounding whitespace.
pub fn parse_status(text: &str) -> Option<i32> {
    text.trim().parse().ok()
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn shell_quote(path: &Path) -> String {
    shell_quote_str(&path.to_string_lossy())
}

/// Wrap `s` in single quotes for POSIX shells.
fn shell_quote_str(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_and_ordered_in_a_tight_loop() {
        let mut checkpoints = Checkpointer::new("s", "/tmp");
        let tokens: Vec<_> = (0..1_000).map(|_| checkpoints.next()).collect();

        let unique: HashSet<_> = tokens.iter().collect();
        assert_eq!(unique.len(), tokens.len());

        // Fixed-width nanos keep lexical order equal to issue order.
        assert!(tokens.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn token_is_session_qualified() {
        let mut checkpoints = Checkpointer::new("alice", "/tmp");
        let token = checkpoints.next();
        let mut parts = token.as_str().splitn(3, '-');
        assert_eq!(parts.next(), Some("alice"));
        let secs: i64 = parts.next().unwrap().parse().unwrap();
        assert!(secs > 1_600_000_000);
        assert_eq!(parts.next().unwrap().len(), 9);
    }

    #[test]
    fn path_lives_in_check_dir() {
        let mut checkpoints = Checkpointer::new("s", "/var/tmp/checks");
        let token = checkpoints.next();
        assert_eq!(
            checkpoints.path(&token),
            PathBuf::from("/var/tmp/checks").join(token.as_str())
        );
    }

    #[test]
    fn status_fragment_writes_then_renames() {
        let mut checkpoints = Checkpointer::new("s", "/tmp/x");
        let token = checkpoints.next();
        let fragment = checkpoints.status_fragment(&token);
        let path = format!("/tmp/x/{token}");
        assert_eq!(
            fragment,
            format!("echo $? >'{path}.part'; mv -f '{path}.part' '{path}'")
        );
        assert_eq!(checkpoints.outstanding(), 1);
    }

    #[test]
    fn marker_fragment_reports_status_on_stderr_first() {
        let token = CheckpointToken("s-1-000000001".to_string());
        assert_eq!(
            Checkpointer::marker_fragment(&token),
            "echo 's-1-000000001' \"$?\" >&2\necho 's-1-000000001'\n"
        );
    }

    #[test]
    fn quoting_escapes_single_quotes() {
        assert_eq!(shell_quote_str("it's"), r"'it'\''s'");
    }

    #[test]
    fn parse_status_trims() {
        assert_eq!(parse_status("0\n"), Some(0));
        assert_eq!(parse_status(" 127 "), Some(127));
        assert_eq!(parse_status(""), None);
        assert_eq!(parse_status("abc"), None);
    }

    #[tokio::test]
    async fn read_status_consumes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut checkpoints = Checkpointer::new("s", dir.path());
        let token = checkpoints.next();
        let _ = checkpoints.status_fragment(&token);

        assert!(!checkpoints.status_ready(&token).await);
        std::fs::write(checkpoints.path(&token), "42\n").unwrap();
        assert!(checkpoints.status_ready(&token).await);

        assert_eq!(checkpoints.read_status(&token).await, Some(42));
        assert!(!checkpoints.path(&token).exists());
        assert_eq!(checkpoints.outstanding(), 0);
        assert_eq!(checkpoints.read_status(&token).await, None);
    }

    #[test]
    fn purge_removes_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let mut checkpoints = Checkpointer::new("s", dir.path());
        let first = checkpoints.next();
        let second = checkpoints.next();
        let _ = checkpoints.status_fragment(&first);
        let _ = checkpoints.status_fragment(&second);

        std::fs::write(checkpoints.path(&first), "0\n").unwrap();
        std::fs::write(part_path(&checkpoints.path(&second)), "0\n").unwrap();

        checkpoints.purge();
        assert_eq!(checkpoints.outstanding(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
