//! Single-shot execution: one fresh shell per command.
//!
//! The child runs as `<shell_exec> -c <command>` in its own process group with
//! stdin closed. Both output pipes are drained by background tasks into shared
//! buffers, so whatever was printed before a timeout is still returned.

use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tether_core::ShellConfig;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command as AsyncCommand};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::process;
use crate::types::{code, CompletedProcess, CHECK_FAILED_MSG};
use crate::validate;

/// How long pipe readers get to hit EOF once the process group is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Stateless runner for isolated commands.
#[derive(Debug, Clone)]
pub struct Runner {
    config: ShellConfig,
}

impl Runner {
    pub fn new(config: ShellConfig) -> Self {
        Self { config }
    }

    /// Run `command` to completion or until the configured timeout.
    ///
    /// Never fails: rejected input, spawn errors and timeouts all come back
    /// as sentinel exit codes (see [`crate::types::code`]). On timeout the
    /// whole process group is killed and the partial output is kept.
    pub async fn run(&self, command: &str) -> CompletedProcess {
        let Ok(command) = validate::validate(command) else {
            return CompletedProcess::rejected(CHECK_FAILED_MSG);
        };

        let Some((program, args)) = self.config.program() else {
            error!("shell_exec is empty, cannot run command");
            return CompletedProcess::new(code::SPAWN_FAILED, Vec::new(), "shell_exec is empty");
        };

        debug!(command, "run");

        let mut cmd = AsyncCommand::new(program);
        cmd.args(args)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(program, "failed to spawn shell: {e}");
                return CompletedProcess::new(
                    code::SPAWN_FAILED,
                    Vec::new(),
                    format!("spawn failed: {e}"),
                );
            }
        };

        let pid = child.id();
        let stdout = Capture::spawn(child.stdout.take());
        let stderr = Capture::spawn(child.stderr.take());

        let exit_code = match tokio::time::timeout(self.config.timeout, child.wait()).await {
            Ok(Ok(status)) => process::exit_code(status),

            Ok(Err(e)) => {
                error!(command, "wait failed: {e}");
                code::SPAWN_FAILED
            }

            Err(_elapsed) => {
                warn!(
                    command,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "command timed out, killing process group"
                );
                code::TIMEOUT
            }
        };

        // Also reaps anything the command left behind in its group, which
        // would otherwise keep the pipes open.
        terminate(pid, &mut child).await;

        let (stdout, stderr) = tokio::join!(stdout.finish(), stderr.finish());
        CompletedProcess::new(exit_code, stdout, stderr)
    }
}

/// Kill the process group led by `pid` and reap the leader.
async fn terminate(pid: Option<u32>, child: &mut Child) {
    if let Some(pid) = pid {
        if let Err(e) = process::kill_group(pid) {
            warn!(pid, "failed to kill process group: {e}");
        }
    }
    if let Err(e) = child.start_kill() {
        // Already reaped is the normal case here.
        debug!("start_kill: {e}");
    }
    let _ = child.wait().await;
}

/// Background reader that copies one pipe into a shared buffer.
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl Capture {
    fn spawn<R>(stream: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);

        let task = tokio::spawn(async move {
            let Some(mut stream) = stream else {
                return;
            };
            let mut chunk = [0u8; 4096];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        warn!("output reader error: {e}");
                        break;
                    }
                }
            }
        });

        Self { buf, task }
    }

    /// Wait briefly for EOF, then hand over whatever was captured.
    async fn finish(self) -> Vec<u8> {
        let Capture { buf, mut task } = self;
        if tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err() {
            task.abort();
        }
        let mut guard = buf.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *guard)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn runner(timeout: Duration) -> Runner {
        Runner::new(ShellConfig {
            timeout,
            shell_exec: vec!["sh".to_string()],
            ..ShellConfig::default()
        })
    }

    async fn wait_dead(pid: u32) -> bool {
        for _ in 0..40 {
            if !process::is_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn echo_hi() {
        let result = runner(Duration::from_secs(10)).run("echo hi").await;
        assert_eq!(result.exit_code(), 0);
        assert_eq!(result.stdout(), b"hi\n");
        assert!(result.stderr().is_empty());
    }

    #[tokio::test]
    async fn real_exit_code_and_stderr() {
        let result = runner(Duration::from_secs(10))
            .run("echo oops >&2; exit 3")
            .await;
        assert_eq!(result.exit_code(), 3);
        assert_eq!(result.stderr(), b"oops\n");
    }

    #[tokio::test]
    async fn background_is_rejected_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let command = format!("touch {} &", marker.display());

        let result = runner(Duration::from_secs(10)).run(&command).await;
        assert_eq!(result.exit_code(), code::REJECTED);
        assert_eq!(result.stderr(), CHECK_FAILED_MSG.as_bytes());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn empty_is_rejected() {
        let result = runner(Duration::from_secs(10)).run("   ").await;
        assert_eq!(result.exit_code(), code::REJECTED);
    }

    #[tokio::test]
    async fn timeout_keeps_partial_output_and_kills_child() {
        let result = runner(Duration::from_secs(1))
            .run("echo $$; echo started >&2; exec sleep 30")
            .await;
        assert_eq!(result.exit_code(), code::TIMEOUT);
        assert_eq!(result.stderr(), b"started\n");

        let pid: u32 = String::from_utf8_lossy(result.stdout())
            .trim()
            .parse()
            .unwrap();
        assert!(wait_dead(pid).await, "child {pid} still alive");
    }

    #[tokio::test]
    async fn timeout_kills_grandchildren() {
        let result = runner(Duration::from_secs(1))
            .run("sh -c 'echo $$; sleep 30; true'; true")
            .await;
        assert_eq!(result.exit_code(), code::TIMEOUT);

        let pid: u32 = String::from_utf8_lossy(result.stdout())
            .trim()
            .parse()
            .unwrap();
        assert!(wait_dead(pid).await, "grandchild {pid} still alive");
    }

    #[tokio::test]
    async fn missing_shell_is_a_spawn_failure() {
        let runner = Runner::new(ShellConfig {
            shell_exec: vec!["/nonexistent/shell".to_string()],
            ..ShellConfig::default()
        });
        let result = runner.run("echo hi").await;
        assert_eq!(result.exit_code(), code::SPAWN_FAILED);
        assert!(String::from_utf8_lossy(result.stderr()).contains("spawn failed"));
    }

    #[tokio::test]
    async fn large_output_is_not_truncated() {
        let result = runner(Duration::from_secs(10))
            .run("head -c 300000 /dev/zero | tr '\\0' x")
            .await;
        assert_eq!(result.exit_code(), 0);
        assert_eq!(result.stdout().len(), 300_000);
    }
}
