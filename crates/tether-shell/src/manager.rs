//! `SessionManager`: owns named sessions and the single-shot runner.
//!
//! Typical use is one session per conversation, keyed by a stable name. The
//! manager is designed to be owned by a single Tokio task and passed around
//! behind an `Arc<tokio::sync::Mutex>` when shared access is needed.

use std::collections::HashMap;

use tether_core::ShellConfig;
use tracing::info;

use crate::{
    error::{Result, ShellError},
    runner::Runner,
    session::Session,
    types::{CompletedProcess, SessionInfo},
};

/// Manages multiple independent shell sessions.
pub struct SessionManager {
    config: ShellConfig,
    runner: Runner,
    sessions: HashMap<String, Session>,
}

impl SessionManager {
    pub fn new(config: ShellConfig) -> Self {
        Self {
            runner: Runner::new(config.clone()),
            config,
            sessions: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// Return the running session called `name`, starting one if needed.
    ///
    /// A terminated session under the same name is replaced.
    pub async fn open(
        &mut self,
        name: &str,
        env: Option<HashMap<String, String>>,
    ) -> Result<&mut Session> {
        let live = self.sessions.get(name).is_some_and(Session::is_running);
        if !live {
            let mut session = Session::new(self.config.clone(), Some(name))?;
            session.try_start(env).await?;
            info!(session = name, "opened shell session");
            self.sessions.insert(name.to_string(), session);
        }

        self.sessions
            .get_mut(name)
            .ok_or_else(|| ShellError::SessionNotFound(name.to_string()))
    }

    /// Send `text` to the named session.
    ///
    /// Unknown names get a `NOT_RUNNING` result, like a stopped session.
    pub async fn send(&mut self, name: &str, text: &str) -> CompletedProcess {
        match self.sessions.get_mut(name) {
            Some(session) => session.send(text).await,
            None => CompletedProcess::not_running(),
        }
    }

    /// Kill every process spawned by the named session's shell.
    pub async fn kill(&mut self, name: &str) -> Result<()> {
        let session = self
            .sessions
            .get_mut(name)
            .ok_or_else(|| ShellError::SessionNotFound(name.to_string()))?;
        session.kill().await;
        Ok(())
    }

    /// Close the named session and forget it.
    pub async fn exit(&mut self, name: &str) -> CompletedProcess {
        match self.sessions.remove(name) {
            Some(mut session) => {
                let result = session.exit().await;
                info!(session = name, exit_code = result.exit_code(), "closed shell session");
                result
            }
            None => CompletedProcess::not_running(),
        }
    }

    /// Close every session. Used on shutdown.
    pub async fn exit_all(&mut self) {
        let names: Vec<String> = self.sessions.keys().cloned().collect();
        for name in names {
            let _ = self.exit(&name).await;
        }
    }

    /// Return metadata snapshots for all tracked sessions, sorted by name.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .values()
            .map(|s| SessionInfo {
                name: s.name().to_string(),
                state: s.state(),
                pid: s.pid(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    // -----------------------------------------------------------------------
    // One-shot execution
    // -----------------------------------------------------------------------

    /// Run `command` in a fresh shell, independent of any session.
    pub async fn run_once(&self, command: &str) -> CompletedProcess {
        self.runner.run(command).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
