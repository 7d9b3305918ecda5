#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::uninlined_format_args
)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use tern::config::Config;
use tracing_subscriber::{fmt, EnvFilter};

/// `tern` - a small, durable IRC bot runtime.
#[derive(Parser, Debug)]
#[command(name = "tern")]
#[command(version)]
#[command(about = "One connection, one dispatch loop, commands as subprocesses.", long_about = None)]
struct Cli {
    /// Bot base directory (defaults to ~/.tern)
    #[arg(long, global = true)]
    base: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect and run the bot in the foreground
    Start,

    /// Create a new bot base directory with a default config
    Create {
        /// Directory to create; overrides --base
        dir: Option<PathBuf>,
    },

    /// Send an instruction to a running bot over its control socket
    Send {
        /// Instruction name, e.g. `join`, `quit`, `reload`
        instruction: String,

        /// Arguments; each is parsed as JSON, falling back to a plain string
        args: Vec<String>,
    },

    /// Print the health state last written by the running bot
    Status,
}

fn base_dir(cli_base: Option<PathBuf>) -> Result<PathBuf> {
    match cli_base {
        Some(base) => Ok(base),
        None => Config::default_base(),
    }
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install default crypto provider for Rustls TLS.
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Warning: Failed to install default crypto provider: {e:?}");
    }

    let cli = Cli::parse();

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    match cli.command {
        Commands::Start => {
            let config = Config::load(&base_dir(cli.base)?)?;
            tern::daemon::run(config).await
        }
        Commands::Create { dir } => {
            let base = match dir {
                Some(dir) => dir,
                None => base_dir(cli.base)?,
            };
            let config = Config::create(&base)?;
            println!("Created {}", config.config_path.display());
            println!("   Nick:     {}", config.client.nick);
            println!("   Commands: {}", config.commands_dir().display());
            Ok(())
        }
        Commands::Send { instruction, args } => {
            let config = Config::load(&base_dir(cli.base)?)?;
            let args: Vec<Value> = args.iter().map(|a| parse_arg(a)).collect();
            tern::control::send(&config.control_socket_path(), &instruction, &args).await
        }
        Commands::Status => {
            let config = Config::load(&base_dir(cli.base)?)?;
            let path = tern::daemon::state_file_path(&config);
            let data = std::fs::read_to_string(&path)
                .with_context(|| format!("No state file at {}", path.display()))?;
            println!("{data}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn cli_definition_has_no_flag_conflicts() {
        Cli::command().debug_assert();
    }

    #[test]
    fn send_args_fall_back_to_strings() {
        assert_eq!(parse_arg("42"), json!(42));
        assert_eq!(parse_arg("[\"#c\",\"hi\"]"), json!(["#c", "hi"]));
        assert_eq!(parse_arg("#rust"), json!("#rust"));
    }

    #[test]
    fn send_collects_trailing_args() {
        let cli = Cli::try_parse_from(["tern", "--base", "/tmp/b", "send", "join", "#rust"]).unwrap();
        assert_eq!(cli.base, Some(PathBuf::from("/tmp/b")));
        match cli.command {
            Commands::Send { instruction, args } => {
                assert_eq!(instruction, "join");
                assert_eq!(args, vec!["#rust"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
