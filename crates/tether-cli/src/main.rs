use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tether_core::{ShellConfig, TetherConfig};
use tether_shell::{CompletedProcess, SessionManager, SessionState};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Tether -- supervised shell sessions with timeouts and exit-status tracking.
#[derive(Parser, Debug)]
#[command(name = "tether", version, about)]
struct Cli {
    /// Path to tether.toml (falls back to TETHER_CONFIG, then ~/.tether/tether.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one command in a fresh shell
    Run {
        /// Print the result as JSON instead of the text report
        #[arg(long)]
        json: bool,

        /// Command line, joined with spaces
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Open an interactive session and feed it lines from stdin
    Shell {
        /// Session name, used in checkpoint file names
        #[arg(long, default_value = "repl")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // stdout carries command results, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=info,tether_core=info,tether_shell=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let shell = load_config(cli.config)?;

    match cli.command {
        Commands::Run { json, command } => {
            let manager = SessionManager::new(shell);
            let result = manager.run_once(&command.join(" ")).await;
            if json {
                println!("{}", to_json(&result));
            } else {
                println!("{}", result.render(&manager.config().output_redact));
            }
            Ok(exit_code(result.exit_code()))
        }
        Commands::Shell { name } => repl(shell, &name).await,
    }
}

/// explicit path > TETHER_CONFIG env > ~/.tether/tether.toml
fn load_config(explicit: Option<String>) -> anyhow::Result<ShellConfig> {
    let path = explicit.or_else(|| std::env::var("TETHER_CONFIG").ok());
    let config = TetherConfig::load(path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        TetherConfig::default()
    });
    config.shell.validate().context("invalid shell configuration")
}

/// Line-oriented front end for one session. Lines starting with `:` are
/// handled here instead of being sent to the shell.
async fn repl(config: ShellConfig, name: &str) -> anyhow::Result<ExitCode> {
    let rules = config.output_redact.clone();
    let mut manager = SessionManager::new(config);
    manager.open(name, None).await?;
    info!(session = name, "type :help for session commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut last = 0;

    loop {
        stdout.write_all(b"tether$ ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };

        let result = match line.trim() {
            ":help" => {
                println!(":kill        kill everything the shell started");
                println!(":checkpoint  collect output printed since the last command");
                println!(":list        show tracked sessions");
                println!(":quit        exit the session");
                continue;
            }
            ":kill" => {
                manager.kill(name).await?;
                continue;
            }
            ":list" => {
                for info in manager.list() {
                    let pid = info.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
                    println!("{}\t{}\t{}", info.name, info.state, pid);
                }
                continue;
            }
            ":checkpoint" => manager.open(name, None).await?.checkpoint().await,
            ":quit" => break,
            _ => manager.send(name, &line).await,
        };

        println!("{}", result.render(&rules));
        last = result.exit_code();

        let running = manager
            .list()
            .iter()
            .any(|s| s.name == name && s.state == SessionState::Running);
        if !running {
            return Ok(exit_code(last));
        }
    }

    let result = manager.exit(name).await;
    if result.exit_code() != 0 || !result.stdout().is_empty() || !result.stderr().is_empty() {
        println!("{}", result.render(&rules));
    }
    Ok(exit_code(last))
}

fn to_json(result: &CompletedProcess) -> serde_json::Value {
    serde_json::json!({
        "exit_code": result.exit_code(),
        "sentinel": result.is_sentinel(),
        "stdout": String::from_utf8_lossy(result.stdout()),
        "stderr": String::from_utf8_lossy(result.stderr()),
    })
}

/// Sentinels and codes outside 0..=255 map to a generic failure.
fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code).map(ExitCode::from).unwrap_or(ExitCode::FAILURE)
}
