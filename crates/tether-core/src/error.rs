use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shell executable not found: {program}")]
    ShellNotFound { program: String },
}

impl CoreError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::ShellNotFound { .. } => "SHELL_NOT_FOUND",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
