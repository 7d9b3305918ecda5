//! Local control channel.
//!
//! Clients connect to `client.sock` in the base directory and write
//! newline-terminated lines of the form `instruction[ base64(json array)]`.
//! Each line that decodes is enqueued on the dispatch channel; lines that do
//! not are logged and skipped.

use crate::runtime::dispatch::FatalError;
use crate::runtime::instruction::{encode_wire_line, Instruction, InstructionSender};
use anyhow::{Context, Result};
use serde_json::Value;
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

/// Longest accepted control line.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// A bound control socket, not yet accepting.
pub struct ControlServer {
    path: PathBuf,
    listener: UnixListener,
}

impl ControlServer {
    /// Bind `path`, replacing a stale socket left by a dead process.
    ///
    /// Every failure here is a [`FatalError::Bind`].
    pub async fn bind(path: &Path) -> Result<Self, FatalError> {
        let fatal = |source: io::Error| FatalError::Bind {
            path: path.to_path_buf(),
            source,
        };

        if let Ok(metadata) = std::fs::symlink_metadata(path) {
            if !metadata.file_type().is_socket() {
                return Err(fatal(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "path exists and is not a socket",
                )));
            }
            match UnixStream::connect(path).await {
                Ok(_) => {
                    return Err(fatal(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        "another process is listening on this socket",
                    )))
                }
                Err(_) => {
                    tracing::debug!("Removing stale control socket {}", path.display());
                    std::fs::remove_file(path).map_err(fatal)?;
                }
            }
        }

        let listener = UnixListener::bind(path).map_err(fatal)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(fatal)?;
        tracing::info!("Control socket listening at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            listener,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept clients until the dispatch channel closes.
    pub fn spawn(self, instructions: InstructionSender) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    () = instructions.closed() => break,
                    accepted = self.listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            tracing::warn!("Control socket accept failed: {e}");
                            continue;
                        }
                    },
                };
                tokio::spawn(serve_client(stream, instructions.clone()));
            }
        })
    }
}

async fn serve_client(stream: UnixStream, instructions: InstructionSender) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match (&mut reader)
            .take(MAX_LINE_BYTES as u64)
            .read_until(b'\n', &mut buf)
            .await
        {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Control client read failed: {e}");
                return;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match Instruction::from_wire_line(line) {
            Ok(instruction) => {
                tracing::debug!("Control: {}", instruction.name());
                if instructions.send(instruction).is_err() {
                    return;
                }
            }
            Err(e) => tracing::warn!("Rejected control line: {e}"),
        }
    }
}

/// Remove the socket file, ignoring a missing one.
pub fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove control socket {}: {e}", path.display());
        }
    }
}

/// Client side: deliver one instruction to a running bot.
pub async fn send(path: &Path, name: &str, args: &[Value]) -> Result<()> {
    let mut stream = UnixStream::connect(path)
        .await
        .with_context(|| format!("Is the bot running? Cannot connect to {}", path.display()))?;
    let mut line = encode_wire_line(name, args);
    line.push('\n');
    stream
        .write_all(line.as_bytes())
        .await
        .context("Failed to write to the control socket")?;
    stream.shutdown().await.ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    async fn next(rx: &mut mpsc::UnboundedReceiver<Instruction>) -> Instruction {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("instruction in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn lines_become_instructions() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("client.sock");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = ControlServer::bind(&path).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let _task = server.spawn(tx);

        send(&path, "join", &[json!("#rust")]).await.unwrap();
        assert_eq!(next(&mut rx).await, Instruction::Join("#rust".into()));

        send(&path, "quit", &[]).await.unwrap();
        assert_eq!(next(&mut rx).await, Instruction::Quit);
    }

    #[tokio::test]
    async fn bad_lines_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("client.sock");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _task = ControlServer::bind(&path).await.unwrap().spawn(tx);

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream
            .write_all(b"join !!!\nreceiving\n\nping\n")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
        assert_eq!(next(&mut rx).await, Instruction::Ping);
    }

    #[tokio::test]
    async fn stale_socket_is_replaced_but_live_one_is_not() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("client.sock");

        let stale = std::os::unix::net::UnixListener::bind(&path).unwrap();
        drop(stale);
        let live = ControlServer::bind(&path).await.unwrap();

        let err = ControlServer::bind(&path).await.err().unwrap();
        assert!(matches!(err, FatalError::Bind { .. }));
        drop(live);
        remove_socket(&path);
        assert!(!path.exists());
        remove_socket(&path);
    }

    #[tokio::test]
    async fn regular_file_is_not_removed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("client.sock");
        std::fs::write(&path, "keep").unwrap();
        assert!(ControlServer::bind(&path).await.is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep");
    }

    #[tokio::test]
    async fn send_without_server_fails() {
        let tmp = TempDir::new().unwrap();
        let err = send(&tmp.path().join("client.sock"), "ping", &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Is the bot running"));
    }
}
