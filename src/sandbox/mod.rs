//! Runs bot commands as external processes.
//!
//! A command is an executable file in the commands directory. It receives its
//! argument both as `argv[1]` and on stdin, and the first line of its stdout
//! is what gets sent back to the invoker.

use crate::config::{ClientConfig, Config};
use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Longest first line kept from stdout, and longest stderr kept for logging.
const MAX_OUTPUT_BYTES: usize = 65_536;

/// One command execution. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub command: String,
    pub argument: String,
    /// Added on top of the inherited process environment
    pub environment: BTreeMap<String, String>,
    pub timeout: Duration,
}

/// Failure modes of a command. `Display` is the text sent back to the invoker.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("`{0}` is not a valid command name")]
    InvalidName(String),
    #[error("There is no `{0}` command")]
    NotFound(String),
    #[error("The command file does not have executable permissions")]
    NotExecutable,
    #[error("Sorry, {0} took too long")]
    TimedOut(String),
    #[error("Sorry, {0} responded with an error")]
    Failed(String),
    #[error("Sorry, {command} could not be run: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl SandboxError {
    /// Errors that are dropped without telling the invoker.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::InvalidName(_) | Self::NotFound(_))
    }
}

/// Process isolation boundary used by the dispatch loop.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Whether `name` resolves to a command. Unknown commands are ignored
    /// without spawning anything.
    fn has_command(&self, name: &str) -> bool;

    /// Run one command to completion. `Ok` holds the first output line, which
    /// may be empty.
    async fn execute(&self, invocation: &CommandInvocation) -> Result<String, SandboxError>;
}

/// A command name may not reach outside the commands directory.
pub fn valid_command_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains(['/', '\0', '.'])
        && !name.contains(std::path::MAIN_SEPARATOR)
}

/// Sandbox that spawns files from one commands directory.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    commands_dir: PathBuf,
}

impl ProcessSandbox {
    pub fn new(commands_dir: impl Into<PathBuf>) -> Self {
        Self {
            commands_dir: commands_dir.into(),
        }
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf, SandboxError> {
        if !valid_command_name(name) {
            return Err(SandboxError::InvalidName(name.to_string()));
        }
        Ok(self.commands_dir.join(name))
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn has_command(&self, name: &str) -> bool {
        self.resolve(name).is_ok_and(|path| path.is_file())
    }

    async fn execute(&self, invocation: &CommandInvocation) -> Result<String, SandboxError> {
        let name = invocation.command.as_str();
        let path = self.resolve(name)?;

        let mut child = Command::new(&path)
            .arg(&invocation.argument)
            .envs(&invocation.environment)
            .current_dir(&self.commands_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::PermissionDenied | ErrorKind::NotFound => SandboxError::NotExecutable,
                _ => SandboxError::Io {
                    command: name.to_string(),
                    source: e,
                },
            })?;

        let mut stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let input = format!("{}\n", invocation.argument);
        let run = async move {
            if let Some(stdin) = stdin.as_mut() {
                // Commands that never read stdin close the pipe early.
                let _ = stdin.write_all(input.as_bytes()).await;
            }
            drop(stdin);
            tokio::try_join!(first_line(stdout), capped(stderr), child.wait())
        };

        let (stdout, stderr, status) = match tokio::time::timeout(invocation.timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SandboxError::Io {
                    command: name.to_string(),
                    source: e,
                })
            }
            // Dropping the future drops the child, which kills it.
            Err(_) => {
                tracing::warn!("Command `{name}` timed out after {:?}", invocation.timeout);
                return Err(SandboxError::TimedOut(name.to_string()));
            }
        };

        if !stderr.is_empty() {
            tracing::debug!(
                "Command `{name}` stderr: {}",
                String::from_utf8_lossy(&stderr).trim_end()
            );
        }

        let text = String::from_utf8_lossy(&stdout);
        let first = text.lines().next().unwrap_or("").trim_end_matches('\r');

        if !status.success() && first.is_empty() {
            tracing::warn!("Command `{name}` exited with {status}");
            return Err(SandboxError::Failed(name.to_string()));
        }
        Ok(first.to_string())
    }
}

/// Read up to the first newline, at most `MAX_OUTPUT_BYTES`, then discard the
/// rest so the child never blocks on a full pipe.
async fn first_line<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let Some(pipe) = pipe else {
        return Ok(Vec::new());
    };
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();
    (&mut reader)
        .take(MAX_OUTPUT_BYTES as u64)
        .read_until(b'\n', &mut line)
        .await?;
    tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    Ok(line)
}

async fn capped<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let Some(mut pipe) = pipe else {
        return Ok(Vec::new());
    };
    let mut kept = Vec::new();
    (&mut pipe).take(MAX_OUTPUT_BYTES as u64).read_to_end(&mut kept).await?;
    tokio::io::copy(&mut pipe, &mut tokio::io::sink()).await?;
    Ok(kept)
}

/// Decides whether an invoker counts as the owner.
#[derive(Debug, Clone, Default)]
pub struct Authoriser {
    patterns: Vec<Pattern>,
    requires_identification: bool,
}

impl Authoriser {
    /// Compile owner patterns. Only `*` and `?` are wildcards; brackets in
    /// nicks match literally. Invalid patterns are logged and skipped.
    pub fn new(client: &ClientConfig) -> Self {
        let patterns = client
            .owner
            .iter()
            .filter_map(|raw| {
                let mut escaped = String::with_capacity(raw.len());
                for c in raw.chars() {
                    match c {
                        '[' => escaped.push_str("[[]"),
                        ']' => escaped.push_str("[]]"),
                        other => escaped.push(other),
                    }
                }
                match Pattern::new(&escaped) {
                    Ok(pattern) => Some(pattern),
                    Err(e) => {
                        tracing::warn!("Ignoring owner pattern `{raw}`: {e}");
                        None
                    }
                }
            })
            .collect();
        Self {
            patterns,
            requires_identification: client.owner_requires_auth,
        }
    }

    /// `address` is the full `nick!user@host`; `identified` holds nicks that
    /// have proven themselves to services.
    pub fn is_authorised(&self, address: &str, nick: &str, identified: &HashSet<String>) -> bool {
        let options = MatchOptions {
            case_sensitive: false,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };
        let matched = self
            .patterns
            .iter()
            .any(|pattern| pattern.matches_with(address, options));
        matched && (!self.requires_identification || identified.contains(&nick.to_lowercase()))
    }
}

/// Who invoked a command, and where.
#[derive(Debug, Clone, Default)]
pub struct Invoker<'a> {
    pub nick: &'a str,
    pub sender: &'a str,
    pub address: Option<&'a str>,
    pub url: Option<&'a str>,
    pub authorised: bool,
}

/// The `TERN_*` variables every command can rely on.
pub fn command_environment(config: &Config, invoker: &Invoker<'_>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("TERN_BOT".into(), config.client.nick.clone());
    env.insert("TERN_BASE".into(), config.base_dir.display().to_string());
    env.insert(
        "TERN_COMMANDS".into(),
        config.commands_dir().display().to_string(),
    );
    env.insert("TERN_NICK".into(), invoker.nick.to_string());
    env.insert("TERN_SENDER".into(), invoker.sender.to_string());
    if let Some(address) = invoker.address {
        env.insert("TERN_ADDRESS".into(), address.to_string());
    }
    if let Some(url) = invoker.url {
        env.insert("TERN_URL".into(), url.to_string());
    }
    if invoker.authorised {
        env.insert("TERN_AUTHORISED".into(), "1".into());
    }
    env
}
