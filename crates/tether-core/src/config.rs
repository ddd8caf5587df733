use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_TIMEOUT_SECS: f64 = 30.0;
pub const MIN_TIMEOUT_SECS: f64 = 5.0;
pub const DEFAULT_SHELL: &str = "bash";
pub const DEFAULT_CHECK_DIR: &str = "tmp/shell";

/// Top-level config (tether.toml + TETHER_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub shell: ShellConfig,
}

/// Everything the shell supervisor needs at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Budget for every blocking wait: single-shot runs, checkpoint polls and
    /// the graceful-exit wait. Written as (fractional) seconds.
    #[serde(default = "default_timeout", with = "secs")]
    pub timeout: Duration,

    /// Shell program followed by its arguments. A plain string is split on
    /// spaces, so `shell_exec = "bash --norc"` works.
    #[serde(default = "default_shell_exec", deserialize_with = "string_or_list")]
    pub shell_exec: Vec<String>,

    /// Directory holding the out-of-band exit status files.
    #[serde(default = "default_check_dir")]
    pub check_dir: PathBuf,

    /// Literal substitutions applied, in order, when a result is rendered.
    #[serde(default)]
    pub output_redact: Vec<RedactRule>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            shell_exec: default_shell_exec(),
            check_dir: default_check_dir(),
            output_redact: Vec::new(),
        }
    }
}

/// One `(match, replace)` pair used to scrub rendered output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactRule {
    #[serde(rename = "match")]
    pub pattern: String,
    pub replace: String,
}

impl RedactRule {
    pub fn new(pattern: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            replace: replace.into(),
        }
    }
}

impl ShellConfig {
    /// Startup gate: reject a config the supervisor cannot work with.
    ///
    /// Floors the timeout at [`MIN_TIMEOUT_SECS`] and resolves the shell
    /// program through `PATH`. Failing here is fatal for the caller.
    pub fn validate(mut self) -> Result<Self> {
        let program = self
            .shell_exec
            .first()
            .ok_or_else(|| CoreError::Config("shell_exec must not be empty".to_string()))?;

        which::which(program).map_err(|_| CoreError::ShellNotFound {
            program: program.clone(),
        })?;

        let floor = Duration::from_secs_f64(MIN_TIMEOUT_SECS);
        if self.timeout < floor {
            tracing::warn!(
                timeout_ms = self.timeout.as_millis() as u64,
                "shell timeout below minimum, raising to {MIN_TIMEOUT_SECS}s"
            );
            self.timeout = floor;
        }

        Ok(self)
    }

    /// Split `shell_exec` into program and arguments.
    pub fn program(&self) -> Option<(&str, &[String])> {
        self.shell_exec
            .split_first()
            .map(|(program, args)| (program.as_str(), args))
    }
}

impl TetherConfig {
    /// Load config from a TOML file with TETHER_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `TETHER_SHELL__CHECK_DIR=/run/tether`.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.tether/tether.toml
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: TetherConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TETHER_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS)
}
fn default_shell_exec() -> Vec<String> {
    vec![DEFAULT_SHELL.to_string()]
}
fn default_check_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CHECK_DIR)
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tether/tether.toml", home)
}

fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrList {
        String(String),
        List(Vec<String>),
    }

    Ok(match StringOrList::deserialize(deserializer)? {
        StringOrList::String(s) => s.split_whitespace().map(str::to_string).collect(),
        StringOrList::List(list) => list,
    })
}

/// `Duration` as a floating-point number of seconds.
mod secs {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| D::Error::custom(format!("invalid timeout {secs}: {e}")))
    }
}
