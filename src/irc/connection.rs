//! Socket ownership: connect, the receive and send tasks, and disconnect.
//!
//! The tasks never decide anything. They report `receiving`/`sending` when
//! they start and `disco_receiving`/`disco_sending` when they stop, tagged
//! with the connection id, and the dispatch loop takes it from there.

use crate::config::ServerConfig;
use crate::irc::flood::FloodGate;
use crate::runtime::instruction::{ConnectionId, Instruction, InstructionSender};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::rustls;
use tokio_util::sync::CancellationToken;

/// Item on the outbound-bytes queue. `Close` ends the send task gracefully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Line(Vec<u8>),
    Close,
}

/// Anything the tasks can run over: plain TCP, TLS, or an in-memory duplex.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// One live socket and the two tasks serving it.
pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
    receive_task: JoinHandle<()>,
    send_task: JoinHandle<()>,
}

impl Connection {
    /// Open a socket to `server` and start both tasks on it.
    pub async fn connect(
        id: ConnectionId,
        server: &ServerConfig,
        flood_protect: bool,
        instructions: InstructionSender,
    ) -> Result<Self> {
        tracing::info!("Connecting to {}:{} ({id})", server.host, server.port);
        let tcp = tokio::net::TcpStream::connect((server.host.as_str(), server.port))
            .await
            .with_context(|| format!("Failed to connect to {}:{}", server.host, server.port))?;

        if !server.tls {
            return Ok(Self::start(id, tcp, flood_protect, instructions));
        }

        if !server.verify_tls {
            tracing::warn!("Using TLS without validating the server certificate");
        }
        let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config(server.verify_tls)?));
        let domain = rustls::pki_types::ServerName::try_from(server.host.clone())
            .with_context(|| format!("Invalid TLS server name: {}", server.host))?;
        let tls = connector
            .connect(domain, tcp)
            .await
            .context("TLS handshake failed")?;
        Ok(Self::start(id, tls, flood_protect, instructions))
    }

    /// Start the receive and send tasks over an already open transport.
    pub fn start<T: Transport>(
        id: ConnectionId,
        transport: T,
        flood_protect: bool,
        instructions: InstructionSender,
    ) -> Self {
        let (reader, writer) = tokio::io::split(transport);
        let cancel = CancellationToken::new();
        let (outbound, queue) = mpsc::unbounded_channel();

        let receive_task = spawn_receive_task(id, reader, cancel.clone(), instructions.clone());
        let send_task = spawn_send_task(id, writer, queue, flood_protect, instructions);

        Self {
            id,
            outbound,
            cancel,
            receive_task,
            send_task,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue one serialized line. Returns false once the send task is gone.
    pub fn send(&self, octets: Vec<u8>) -> bool {
        self.outbound.send(Outbound::Line(octets)).is_ok()
    }

    /// Ask the send task to flush what it has and exit.
    pub fn close_sending(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    /// Stop the receive task without waiting for the peer.
    pub fn stop_receiving(&self) {
        self.cancel.cancel();
    }

    pub fn disconnect(&self) {
        self.close_sending();
        self.stop_receiving();
    }

    pub fn is_finished(&self) -> bool {
        self.receive_task.is_finished() && self.send_task.is_finished()
    }

    /// Wait up to `wait` for both tasks to end. Returns false if either is
    /// still running afterwards; both are aborted in that case.
    pub async fn join(self, wait: Duration) -> bool {
        let Self {
            receive_task,
            send_task,
            ..
        } = self;
        let receive_abort = receive_task.abort_handle();
        let send_abort = send_task.abort_handle();

        let joined = tokio::time::timeout(wait, async {
            let _ = receive_task.await;
            let _ = send_task.await;
        })
        .await;

        if joined.is_err() {
            receive_abort.abort();
            send_abort.abort();
            return false;
        }
        true
    }
}

/// Read lines until EOF, error, or cancellation.
pub fn spawn_receive_task<R>(
    id: ConnectionId,
    reader: R,
    cancel: CancellationToken,
    instructions: InstructionSender,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let _ = instructions.send(Instruction::Receiving(id));
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(512);

        loop {
            buf.clear();
            let read = tokio::select! {
                () = cancel.cancelled() => break,
                read = reader.read_until(b'\n', &mut buf) => read,
            };
            match read {
                Ok(0) => {
                    tracing::info!("Server closed the connection ({id})");
                    break;
                }
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    tracing::trace!("<- {}", String::from_utf8_lossy(&buf));
                    if instructions.send(Instruction::Remote(buf.clone())).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!("Read failed ({id}): {e}");
                    break;
                }
            }
        }

        let _ = instructions.send(Instruction::DiscoReceiving(id));
    })
}

/// Drain the outbound queue onto the socket, pacing when `flood_protect` is set.
pub fn spawn_send_task<W>(
    id: ConnectionId,
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    flood_protect: bool,
    instructions: InstructionSender,
) -> JoinHandle<()>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let _ = instructions.send(Instruction::Sending(id));
        let mut gate = flood_protect.then(FloodGate::new);

        while let Some(Outbound::Line(octets)) = queue.recv().await {
            tracing::debug!("-> {}", String::from_utf8_lossy(&octets).trim_end());
            let written = async {
                writer.write_all(&octets).await?;
                writer.flush().await
            }
            .await;
            if let Err(e) = written {
                tracing::warn!("Write failed ({id}): {e}");
                break;
            }
            if let Some(gate) = gate.as_mut() {
                tokio::time::sleep(gate.record(Instant::now())).await;
            }
        }

        let _ = writer.shutdown().await;
        let _ = instructions.send(Instruction::DiscoSending(id));
    })
}

fn tls_config(verify: bool) -> Result<rustls::ClientConfig> {
    let builder =
        rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .context("Failed to select TLS protocol versions")?;

    let config = if verify {
        let root_store: rustls::RootCertStore =
            webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
        builder
            .with_root_certificates(root_store)
            .with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth()
    };
    Ok(config)
}

/// Certificate verifier that accepts any certificate (for `verify_tls = false`).
#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc::unbounded_channel;

    async fn next(rx: &mut mpsc::UnboundedReceiver<Instruction>) -> Instruction {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("instruction in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn receive_task_reports_lines_and_eof() {
        let (tx, mut rx) = unbounded_channel();
        let (mut server, client) = tokio::io::duplex(1024);
        let conn = Connection::start(ConnectionId(7), client, false, tx);

        server.write_all(b"PING :a\r\n:n!u@h PRIVMSG #c :hi\r\n").await.unwrap();
        drop(server);

        let mut seen = Vec::new();
        while seen.len() < 5 {
            seen.push(next(&mut rx).await);
        }
        assert!(seen.contains(&Instruction::Receiving(ConnectionId(7))));
        assert!(seen.contains(&Instruction::Sending(ConnectionId(7))));
        assert!(seen.contains(&Instruction::Remote(b"PING :a".to_vec())));
        assert!(seen.contains(&Instruction::Remote(b":n!u@h PRIVMSG #c :hi".to_vec())));
        assert!(seen.contains(&Instruction::DiscoReceiving(ConnectionId(7))));

        conn.close_sending();
        assert!(conn.join(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn send_task_writes_lines_and_stops_on_close() {
        let (tx, mut rx) = unbounded_channel();
        let (mut server, client) = tokio::io::duplex(1024);
        let conn = Connection::start(ConnectionId(1), client, false, tx);

        assert!(conn.send(b"NICK tern\r\n".to_vec()));
        assert!(conn.send(b"USER tern +iw tern :tern\r\n".to_vec()));
        conn.disconnect();

        let mut written = Vec::new();
        server.read_to_end(&mut written).await.unwrap();
        assert_eq!(written, b"NICK tern\r\nUSER tern +iw tern :tern\r\n");

        let mut saw_disco_sending = false;
        let mut saw_disco_receiving = false;
        while !(saw_disco_sending && saw_disco_receiving) {
            match next(&mut rx).await {
                Instruction::DiscoSending(ConnectionId(1)) => saw_disco_sending = true,
                Instruction::DiscoReceiving(ConnectionId(1)) => saw_disco_receiving = true,
                _ => {}
            }
        }
        assert!(conn.join(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn connect_failure_is_an_error() {
        let (tx, _rx) = unbounded_channel();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let server = ServerConfig {
            host: "127.0.0.1".into(),
            port,
            tls: false,
            verify_tls: true,
        };
        assert!(Connection::connect(ConnectionId(2), &server, false, tx)
            .await
            .is_err());
    }

    #[test]
    fn tls_configs_build() {
        assert!(tls_config(true).is_ok());
        assert!(tls_config(false).is_ok());
    }
}
