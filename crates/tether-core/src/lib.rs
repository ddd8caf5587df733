pub mod config;
pub mod error;

pub use config::{RedactRule, ShellConfig, TetherConfig};
pub use error::{CoreError, Result};
