//! Interactive session: one long-lived shell driven over plain pipes.
//!
//! Each `Session` owns the shell's child handle, its stdin, and two reader
//! tasks that split stdout and stderr into lines and forward them over
//! unbounded channels. Because both streams are drained continuously, a
//! command can never stall on a full pipe while the session waits for its
//! status file; the lines simply queue up until the next checkpoint is
//! collected.
//!
//! Commands are correlated with their output through the
//! [`crate::checkpoint`] protocol.

use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tether_core::ShellConfig;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command as AsyncCommand};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{self, CheckpointToken, Checkpointer};
use crate::error::{Result, ShellError};
use crate::process;
use crate::types::{code, CompletedProcess, SessionState, CHECK_FAILED_MSG};
use crate::validate;

/// Step between status-file checks.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a shell gets to answer a checkpoint after its command was
/// killed, and how long readers get to flush once the shell is gone.
const GRACE: Duration = Duration::from_secs(2);

const NO_COMMAND_MSG: &str = "No command passed.";
const TERMINATED_MSG: &[u8] = b"Shell terminated.\n";

/// The live half of a session.
struct ShellProcess {
    child: Child,
    pid: u32,
    stdin: ChildStdin,
    stdout: UnboundedReceiver<Vec<u8>>,
    stderr: UnboundedReceiver<Vec<u8>>,
}

/// Output gathered for one checkpoint.
struct Correlation {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    /// `$?` as reported next to the stderr marker.
    status: Option<i32>,
    /// Both markers were seen before the deadline.
    complete: bool,
}

/// Outcome of waiting for a status file.
enum Wait {
    Ready,
    TimedOut,
    ShellExited,
}

/// A supervised shell that accepts commands over its lifetime.
///
/// All operations take `&mut self`, so two of them can never overlap on the
/// same session. Dropping a running session kills its process group.
pub struct Session {
    name: String,
    config: ShellConfig,
    state: SessionState,
    checkpoints: Checkpointer,
    process: Option<ShellProcess>,
}

impl Session {
    /// Create a session in the `NotStarted` state.
    ///
    /// `name` ends up in checkpoint file names, so it may only contain ASCII
    /// letters, digits, `.`, `_` and `-`. Defaults to the current unix time.
    pub fn new(config: ShellConfig, name: Option<&str>) -> Result<Self> {
        let name = match name {
            Some(name) => {
                validate_name(name)?;
                name.to_string()
            }
            None => Utc::now().timestamp().to_string(),
        };

        let checkpoints = Checkpointer::new(name.clone(), config.check_dir.clone());
        Ok(Self {
            name,
            config,
            state: SessionState::NotStarted,
            checkpoints,
            process: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    /// PID of the shell while running.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Spawn the shell.
    ///
    /// Returns `false` without touching anything unless the session is
    /// `NotStarted`. When `env` is given it replaces the inherited
    /// environment entirely. See [`Session::try_start`] for the reason a
    /// start failed.
    pub async fn start(&mut self, env: Option<HashMap<String, String>>) -> bool {
        match self.try_start(env).await {
            Ok(()) => true,
            Err(e @ ShellError::NotStartable { .. }) => {
                warn!(session = %self.name, "{e}");
                false
            }
            Err(e) => {
                error!(
                    session = %self.name,
                    dir = %self.config.check_dir.display(),
                    "failed to start shell: {e}"
                );
                false
            }
        }
    }

    /// Like [`Session::start`], but reports why the shell did not come up.
    pub async fn try_start(&mut self, env: Option<HashMap<String, String>>) -> Result<()> {
        if self.state != SessionState::NotStarted {
            return Err(ShellError::NotStartable {
                name: self.name.clone(),
                state: self.state,
            });
        }

        let (program, args) = self
            .config
            .program()
            .ok_or_else(|| ShellError::Spawn("shell_exec is empty".to_string()))?;

        // The shell may `cd` anywhere, so status files need an absolute path.
        let check_dir = prepare_check_dir(&self.config.check_dir).await?;
        self.checkpoints = Checkpointer::new(self.name.clone(), check_dir);

        let mut cmd = AsyncCommand::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(env) = env {
            cmd.env_clear().envs(env);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ShellError::Spawn(format!("{program}: {e}")))?;

        if let Some(status) = child.try_wait()? {
            return Err(ShellError::Spawn(format!(
                "shell exited right after spawn ({status})"
            )));
        }

        let (Some(pid), Some(stdin), Some(stdout), Some(stderr)) = (
            child.id(),
            child.stdin.take(),
            child.stdout.take(),
            child.stderr.take(),
        ) else {
            let _ = child.start_kill();
            return Err(ShellError::Spawn("shell pipes unavailable".to_string()));
        };

        self.process = Some(ShellProcess {
            child,
            pid,
            stdin,
            stdout: spawn_line_reader(stdout, "stdout"),
            stderr: spawn_line_reader(stderr, "stderr"),
        });
        self.state = SessionState::Running;
        info!(session = %self.name, pid, program, "shell session started");
        Ok(())
    }

    /// Send one or more newline-separated commands.
    ///
    /// Blank lines are skipped and the whole batch is validated before
    /// anything is written. A bare `exit` line ends the session through
    /// [`Session::exit`]; later lines are dropped. The result covers every
    /// byte the shell printed since the previous checkpoint and carries the
    /// exit status of the last command.
    pub async fn send(&mut self, text: &str) -> CompletedProcess {
        if !self.is_running() {
            warn!(session = %self.name, "send on a shell that is not running");
            return CompletedProcess::not_running();
        }

        let commands = match prepare_batch(text) {
            Ok(commands) => commands,
            Err(result) => return result,
        };

        // One budget for the whole batch.
        let deadline = Instant::now() + self.config.timeout;
        let mut last = None;

        for command in commands {
            if validate::is_exit(command) {
                info!(session = %self.name, "exit requested");
                return self.exit().await;
            }

            let command = validate::neutralize_exit(command);
            let token = self.checkpoints.next();
            let payload = format!("{command}\n{}\n", self.checkpoints.status_fragment(&token));
            debug!(session = %self.name, %token, command = %command, "send");

            if let Err(e) = self.write_stdin(&payload).await {
                return self.broken_pipe(e).await;
            }

            match self.wait_for_status(&token, deadline).await {
                Wait::Ready => last = Some(token),
                Wait::TimedOut => {
                    warn!(session = %self.name, %token, "reached timeout, killing the command");
                    self.kill().await;
                    return self.finish(&token, GRACE.min(self.config.timeout), true).await;
                }
                Wait::ShellExited => {
                    let e = io::Error::new(io::ErrorKind::BrokenPipe, "shell exited");
                    return self.broken_pipe(e).await;
                }
            }
        }

        match last {
            Some(token) => self.finish(&token, self.config.timeout, false).await,
            None => CompletedProcess::rejected(NO_COMMAND_MSG),
        }
    }

    /// Close an ad hoc checkpoint and return what the shell printed since
    /// the previous one.
    ///
    /// No status file is involved; the exit code is the shell's current
    /// `$?`, i.e. that of the last statement it ran.
    pub async fn checkpoint(&mut self) -> CompletedProcess {
        if !self.is_running() {
            return CompletedProcess::not_running();
        }
        let token = self.checkpoints.next();
        self.finish(&token, self.config.timeout, false).await
    }

    /// SIGKILL every process the shell spawned. The shell itself survives.
    pub async fn kill(&mut self) {
        let Some(pid) = self.pid().filter(|_| self.is_running()) else {
            warn!(session = %self.name, "kill on a shell that is not running");
            return;
        };

        let killed = tokio::task::spawn_blocking(move || process::kill_descendants(pid))
            .await
            .unwrap_or_default();
        info!(session = %self.name, killed, "killed processes spawned by the shell");
    }

    /// Ask the shell to exit and wait for it.
    ///
    /// Falls back to killing the process group when the shell does not exit
    /// within the timeout. The session is `Terminated` afterwards no matter
    /// what. Calling this on a session that is not running returns
    /// `NOT_RUNNING` and changes nothing.
    pub async fn exit(&mut self) -> CompletedProcess {
        if !self.is_running() {
            warn!(session = %self.name, "exit on a shell that is not running");
            return CompletedProcess::not_running();
        }
        let Some(shell) = self.process.take() else {
            self.state = SessionState::Terminated;
            return CompletedProcess::not_running();
        };

        let ShellProcess {
            mut child,
            pid,
            mut stdin,
            mut stdout,
            mut stderr,
        } = shell;

        if let Err(e) = write_with_timeout(&mut stdin, b"exit\n", self.config.timeout).await {
            debug!(session = %self.name, "writing exit failed: {e}");
        }
        drop(stdin);

        let wait = tokio::time::timeout(self.config.timeout, child.wait()).await;
        let (exit_code, forced) = match wait {
            Ok(Ok(status)) => (process::exit_code(status), false),
            Ok(Err(e)) => {
                warn!(session = %self.name, "waiting for shell failed: {e}");
                (force_kill(pid, &mut child).await.unwrap_or(code::BROKEN_PIPE), true)
            }
            Err(_elapsed) => {
                warn!(session = %self.name, "shell did not exit in time, terminating");
                (force_kill(pid, &mut child).await.unwrap_or(code::TIMEOUT), true)
            }
        };

        let (out, mut err) = tokio::join!(drain(&mut stdout, GRACE), drain(&mut stderr, GRACE));
        if forced {
            err.extend_from_slice(TERMINATED_MSG);
        }
        if exit_code != 0 {
            warn!(session = %self.name, exit_code, "shell exit code");
        }

        self.checkpoints.purge();
        self.state = SessionState::Terminated;
        info!(session = %self.name, exit_code, "shell session closed");
        CompletedProcess::new(exit_code, out, err)
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    async fn write_stdin(&mut self, payload: &str) -> io::Result<()> {
        let timeout = self.config.timeout;
        let shell = self
            .process
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "shell is not running"))?;
        write_with_timeout(&mut shell.stdin, payload.as_bytes(), timeout).await
    }

    /// Poll for the status file until it appears, the deadline passes, or
    /// the shell dies.
    async fn wait_for_status(&mut self, token: &CheckpointToken, deadline: Instant) -> Wait {
        loop {
            if self.checkpoints.status_ready(token).await {
                return Wait::Ready;
            }
            if let Some(shell) = self.process.as_mut() {
                if !matches!(shell.child.try_wait(), Ok(None)) {
                    return Wait::ShellExited;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Wait::TimedOut;
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Write both markers for `token` and read each stream up to its marker.
    async fn correlate(
        &mut self,
        token: &CheckpointToken,
        deadline: Instant,
    ) -> io::Result<Correlation> {
        self.write_stdin(&Checkpointer::marker_fragment(token)).await?;

        let shell = self
            .process
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "shell is not running"))?;
        let marker = token.as_str().as_bytes();

        let (stdout, out_tail) = read_until_marker(&mut shell.stdout, marker, deadline).await;
        let (stderr, err_tail) = read_until_marker(&mut shell.stderr, marker, deadline).await;

        let status = err_tail
            .as_deref()
            .and_then(|tail| checkpoint::parse_status(&String::from_utf8_lossy(tail)));

        Ok(Correlation {
            stdout,
            stderr,
            status,
            complete: out_tail.is_some() && err_tail.is_some(),
        })
    }

    /// Collect the output for `token` and turn it into a result.
    ///
    /// A shell that does not answer within `wait` is considered hung and is
    /// terminated.
    async fn finish(
        &mut self,
        token: &CheckpointToken,
        wait: Duration,
        timed_out: bool,
    ) -> CompletedProcess {
        let correlation = match self.correlate(token, Instant::now() + wait).await {
            Ok(correlation) => correlation,
            Err(e) => return self.broken_pipe(e).await,
        };

        if !correlation.complete {
            warn!(session = %self.name, %token, "shell did not answer the checkpoint, terminating");
            let (out, err) = self.shutdown().await;
            let mut stdout = correlation.stdout;
            let mut stderr = correlation.stderr;
            stdout.extend(out);
            stderr.extend(err);
            stderr.extend_from_slice(TERMINATED_MSG);
            return CompletedProcess::new(code::TIMEOUT, stdout, stderr);
        }

        // The status file, if one was requested, was written before the
        // markers, so it is on disk by now.
        let status = self.checkpoints.read_status(token).await.or(correlation.status);

        let exit_code = if timed_out {
            code::TIMEOUT
        } else {
            status.unwrap_or_else(|| {
                warn!(session = %self.name, %token, "could not read exit status");
                code::BROKEN_PIPE
            })
        };
        CompletedProcess::new(exit_code, correlation.stdout, correlation.stderr)
    }

    async fn broken_pipe(&mut self, err: io::Error) -> CompletedProcess {
        warn!(session = %self.name, "shell terminated: {err}");
        let (stdout, stderr) = self.shutdown().await;
        CompletedProcess::new(code::BROKEN_PIPE, stdout, stderr)
    }

    /// Kill the whole process group, reap the shell and collect whatever
    /// output is still buffered. Leaves the session `Terminated`.
    async fn shutdown(&mut self) -> (Vec<u8>, Vec<u8>) {
        let mut output = (Vec::new(), Vec::new());
        if let Some(mut shell) = self.process.take() {
            let _ = force_kill(shell.pid, &mut shell.child).await;
            output = tokio::join!(
                drain(&mut shell.stdout, GRACE),
                drain(&mut shell.stderr, GRACE)
            );
        }
        self.checkpoints.purge();
        self.state = SessionState::Terminated;
        output
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(shell) = &self.process {
            if let Err(e) = process::kill_group(shell.pid) {
                warn!(session = %self.name, "failed to kill shell on drop: {e}");
            }
        }
        self.checkpoints.purge();
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

fn validate_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "must not be empty"
    } else if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        "only ASCII letters, digits, '.', '_' and '-' are allowed"
    } else {
        return Ok(());
    };
    Err(ShellError::InvalidName {
        name: name.to_string(),
        reason,
    })
}

/// Split and validate a batch. Any rejected line rejects the batch.
fn prepare_batch(text: &str) -> std::result::Result<Vec<&str>, CompletedProcess> {
    let mut commands = Vec::new();
    for line in text.lines().filter(|line| !line.trim().is_empty()) {
        match validate::validate(line) {
            Ok(command) => commands.push(command),
            Err(_) => return Err(CompletedProcess::rejected(CHECK_FAILED_MSG)),
        }
    }
    if commands.is_empty() {
        return Err(CompletedProcess::rejected(NO_COMMAND_MSG));
    }
    Ok(commands)
}

async fn prepare_check_dir(dir: &std::path::Path) -> io::Result<std::path::PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::canonicalize(dir).await
}

async fn write_with_timeout(
    stdin: &mut ChildStdin,
    payload: &[u8],
    timeout: Duration,
) -> io::Result<()> {
    let write = async {
        stdin.write_all(payload).await?;
        stdin.flush().await
    };
    tokio::time::timeout(timeout, write)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "shell is not reading its input"))?
}

/// SIGKILL the group led by `pid` and reap the leader.
async fn force_kill(pid: u32, child: &mut Child) -> Option<i32> {
    if let Err(e) = process::kill_group(pid) {
        warn!(pid, "failed to kill process group: {e}");
    }
    let _ = child.start_kill();
    match tokio::time::timeout(GRACE, child.wait()).await {
        Ok(Ok(status)) => Some(process::exit_code(status)),
        _ => None,
    }
}

/// Forward `stream` line by line until EOF.
fn spawn_line_reader<R>(stream: R, label: &'static str) -> UnboundedReceiver<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        loop {
            let mut line = Vec::new();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(stream = label, "shell reader error: {e}");
                    break;
                }
            }
        }
        debug!(stream = label, "shell reader exited");
    });
    rx
}

/// Read lines until one contains `marker`.
///
/// Text before the marker on that line is kept; the rest of the line is
/// returned as the tail. `None` means the deadline passed or the stream
/// closed first.
async fn read_until_marker(
    rx: &mut UnboundedReceiver<Vec<u8>>,
    marker: &[u8],
    deadline: Instant,
) -> (Vec<u8>, Option<Vec<u8>>) {
    let mut output = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(line)) => {
                if let Some(pos) = find(&line, marker) {
                    output.extend_from_slice(&line[..pos]);
                    return (output, Some(line[pos + marker.len()..].to_vec()));
                }
                output.extend_from_slice(&line);
            }
            Ok(None) | Err(_) => return (output, None),
        }
    }
}

/// Collect everything left in `rx` until it closes or `grace` runs out.
async fn drain(rx: &mut UnboundedReceiver<Vec<u8>>, grace: Duration) -> Vec<u8> {
    let deadline = Instant::now() + grace;
    let mut output = Vec::new();
    while let Ok(Some(line)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        output.extend_from_slice(&line);
    }
    output
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_name("alice-01.test_x").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name("a b").is_err());
    }

    #[test]
    fn default_name_is_a_timestamp() {
        let session = Session::new(ShellConfig::default(), None).unwrap();
        let secs: i64 = session.name().parse().unwrap();
        assert!(secs > 1_600_000_000);
        assert_eq!(session.state(), SessionState::NotStarted);
    }

    #[test]
    fn batch_skips_blank_lines() {
        let commands = prepare_batch("echo a\n\n   \necho b\n").unwrap();
        assert_eq!(commands, ["echo a", "echo b"]);
    }

    #[test]
    fn batch_is_rejected_as_a_whole() {
        let result = prepare_batch("echo a\nsleep 5 &\necho b").unwrap_err();
        assert_eq!(result.exit_code(), code::REJECTED);
        assert_eq!(result.stderr(), CHECK_FAILED_MSG.as_bytes());
    }

    #[test]
    fn empty_batch_is_rejected() {
        let result = prepare_batch("\n \n").unwrap_err();
        assert_eq!(result.exit_code(), code::REJECTED);
        assert_eq!(result.stderr(), NO_COMMAND_MSG.as_bytes());
    }

    #[test]
    fn find_locates_marker() {
        assert_eq!(find(b"abcmarker\n", b"marker"), Some(3));
        assert_eq!(find(b"abc", b"marker"), None);
        assert_eq!(find(b"abc", b""), None);
    }

    #[tokio::test]
    async fn marker_split_keeps_prefix_and_tail() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(b"line one\n".to_vec()).unwrap();
        tx.send(b"partialTOKEN 7\n".to_vec()).unwrap();
        tx.send(b"next checkpoint\n".to_vec()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        let (output, tail) = read_until_marker(&mut rx, b"TOKEN", deadline).await;
        assert_eq!(output, b"line one\npartial");
        assert_eq!(tail.as_deref(), Some(&b" 7\n"[..]));

        // The following line stays queued for the next checkpoint.
        assert_eq!(rx.recv().await.unwrap(), b"next checkpoint\n");
    }

    #[tokio::test]
    async fn marker_read_gives_up_at_deadline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(b"no marker here\n".to_vec()).unwrap();

        let deadline = Instant::now() + Duration::from_millis(50);
        let (output, tail) = read_until_marker(&mut rx, b"TOKEN", deadline).await;
        assert_eq!(output, b"no marker here\n");
        assert!(tail.is_none());
        drop(tx);
    }

    #[tokio::test]
    async fn operations_on_unstarted_session_are_no_ops() {
        let mut session = Session::new(ShellConfig::default(), Some("idle")).unwrap();
        assert_eq!(session.send("echo hi").await.exit_code(), code::NOT_RUNNING);
        assert_eq!(session.checkpoint().await.exit_code(), code::NOT_RUNNING);
        assert_eq!(session.exit().await.exit_code(), code::NOT_RUNNING);
        session.kill().await;
        assert_eq!(session.state(), SessionState::NotStarted);
    }
}
