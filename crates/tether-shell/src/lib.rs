//! tether-shell: supervised shell execution over plain pipes.
//!
//! Provides two execution modes:
//! - `Runner`: one fresh shell per command, hard timeout, partial output kept
//! - `Session`: one long-lived shell; every command (or batch of lines) is
//!   framed by a checkpoint so its output and exit status can be told apart
//!   from the next one
//!
//! Every operation returns a [`CompletedProcess`]. Supervisor failures use the
//! negative codes in [`types::code`]; real exit statuses pass through as-is.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use tether_core::ShellConfig;
//! use tether_shell::{Runner, Session};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ShellConfig::default();
//!
//!     let result = Runner::new(config.clone()).run("echo hello").await;
//!     println!("{result}");
//!
//!     let mut session = Session::new(config, Some("demo")).unwrap();
//!     session.start(None).await;
//!     session.send("cd /tmp").await;
//!     println!("{}", session.send("pwd").await);
//!     session.exit().await;
//! }
//! ```

pub mod checkpoint;
pub mod error;
pub mod manager;
pub mod process;
pub mod runner;
pub mod session;
pub mod types;
pub mod validate;

pub use checkpoint::CheckpointToken;
pub use error::{Result, ShellError};
pub use manager::SessionManager;
pub use runner::Runner;
pub use session::Session;
pub use types::{code, CompletedProcess, SessionInfo, SessionState};
pub use validate::Rejection;
