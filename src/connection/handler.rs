//! Session Controller
//!
//! This module drives one IMAP client connection from accept to close.
//! Each connection runs two tasks: the read loop below, and a response
//! dispatcher that writes engine output back to the client.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects (TCP handshake)
//!        │
//!        ▼
//! 2. Engine built, dispatcher spawned, greeting queued
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │      Read Loop               │
//!    │                              │
//!    │  wait for queue capacity     │
//!    │  read ≤1024 bytes            │
//!    │        │                     │
//!    │        ▼                     │
//!    │  LineFramer ──lines──> engine ──responses──> dispatcher
//!    │        │                     │
//!    │        ▼                     │
//!    │  STARTTLS? pause, wait for   │
//!    │  go-ahead flush, handshake,  │
//!    │  swap transport              │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 4. EOF / LOGOUT / error / buffer overflow
//!        │
//!        ▼
//! 5. Response stream closed, dispatcher drained, transport shut down
//! ```
//!
//! ## Backpressure
//!
//! Engines send without blocking, so the read loop is what keeps output
//! bounded: before each line goes to the engine it waits until fewer than
//! [`MAX_QUEUED_RESPONSES`] responses are queued. A peer that stops reading
//! stalls the dispatcher, which stalls the read loop, until the dispatcher's
//! write timeout ends the session.
//!
//! ## Transport Ownership
//!
//! The transport is split into a read half owned by the read loop and a
//! write half kept in a [`WriterSlot`] shared with the dispatcher. The TLS
//! upgrade takes the write half out of the slot while holding its lock,
//! reunites both halves, performs the handshake, and puts the new write
//! half back, so no write can interleave with the swap. The dispatcher is
//! parked on the coordinator's gate for the whole swap.

use crate::connection::dispatcher::{ResponseDispatcher, WriterSlot};
use crate::connection::session::SessionState;
use crate::connection::stream::SessionStream;
use crate::connection::tls::TlsError;
use crate::protocol::types::escape_line;
use crate::protocol::{
    response_channel, EngineContext, FrameError, Flow, LineFramer, ProtocolEngine, Response,
    ResponseSender, Status, MAX_QUEUED_RESPONSES, READ_CHUNK_SIZE, UNTAGGED,
};
use crate::server::Server;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Connections turned away by the connection limit
    pub connections_rejected: AtomicU64,
    /// Total lines handed to the protocol engine
    pub lines_processed: AtomicU64,
    /// Sessions upgraded to TLS
    pub tls_upgrades: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
    /// Responses fully written and flushed
    pub responses_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn line_processed(&self) {
        self.lines_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tls_upgraded(&self) {
        self.tls_upgrades.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn response_written(&self) {
        self.responses_written.fetch_add(1, Ordering::Relaxed);
    }
}

/// Errors that end a session.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Client exceeded the partial-line buffer limit
    #[error("Frame error: {0}")]
    FrameError(#[from] FrameError),

    /// STARTTLS handshake failed; the session cannot continue
    #[error("TLS upgrade failed: {0}")]
    HandshakeFailure(#[from] TlsError),

    /// Client disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// No input within the idle timeout
    #[error("Idle timeout")]
    IdleTimeout,

    /// The dispatcher stopped after a failed or stalled write
    #[error("Response stream closed")]
    OutputClosed,
}

/// Handles a single client connection.
pub struct ConnectionHandler {
    /// Read half of the transport, taken during the TLS upgrade
    reader: Option<ReadHalf<SessionStream>>,

    /// Write half, shared with the dispatcher
    writer: WriterSlot<WriteHalf<SessionStream>>,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// Partial-line buffer
    framer: LineFramer,

    /// The protocol engine for this session
    engine: Box<dyn ProtocolEngine>,

    /// State shared with the engine
    state: Arc<SessionState>,

    /// Session-originated replies (greeting, errors)
    responses: ResponseSender,

    dispatcher: ResponseDispatcher,

    server: Arc<Server>,
}

impl ConnectionHandler {
    /// Creates a handler and starts its response dispatcher.
    pub fn new(stream: TcpStream, addr: SocketAddr, server: Arc<Server>) -> Self {
        let stats = Arc::clone(server.stats());
        stats.connection_opened();

        let policy = server.policy();
        let state = Arc::new(SessionState::new(
            addr,
            server.auth_backend(),
            server.mailbox_backend(),
            policy.tls_enabled(),
            policy.require_tls,
        ));
        if policy.tls_enabled() {
            debug!(client = %addr, "Enabling TLS support");
        }

        let (responses, receiver) = response_channel();
        let engine = server.engine_factory().build(EngineContext {
            hostname: server.hostname().to_string(),
            responses: responses.clone(),
            hooks: Arc::clone(&state) as Arc<dyn crate::protocol::SessionHooks>,
        });

        let (reader, writer) = tokio::io::split(SessionStream::plain(stream));
        let writer = Arc::new(Mutex::new(Some(writer)));
        let dispatcher = ResponseDispatcher::spawn(
            Arc::clone(&writer),
            receiver,
            addr,
            stats,
            server.write_timeout(),
            state.coordinator().map(|c| c.gate()),
        );

        Self {
            reader: Some(reader),
            writer,
            addr,
            framer: LineFramer::new(server.max_buffer_length()),
            engine,
            state,
            responses,
            dispatcher,
            server,
        }
    }

    /// Runs the session to completion.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let addr = self.addr;
        info!(client = %addr, "Starting session");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %self.addr, "Session ended by client"),
            Err(e) => match e {
                ConnectionError::ClientDisconnected => {
                    debug!(client = %self.addr, "Connection closed by remote host")
                }
                ConnectionError::IoError(io_err)
                    if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
                {
                    debug!(client = %self.addr, "Connection reset by client")
                }
                ConnectionError::HandshakeFailure(_) => {
                    error!(client = %self.addr, error = %e, "handshake error in TLS connection")
                }
                ConnectionError::OutputClosed => {
                    debug!(client = %self.addr, "Peer stopped accepting responses")
                }
                _ => warn!(client = %self.addr, error = %e, "Session error"),
            },
        }

        self.shutdown().await;
        info!(client = %addr, "Session ended");
        result
    }

    /// The read-frame-dispatch loop.
    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        let greeting = self.engine.start();
        self.reply(greeting);

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            let n = match self.read_chunk(&mut chunk).await {
                Ok(n) => n,
                Err(ConnectionError::IdleTimeout) => {
                    self.reply(Response::status(Status::Bye, "Autologout; idle for too long"));
                    return Err(ConnectionError::IdleTimeout);
                }
                Err(e) => return Err(e),
            };

            let lines = match self.framer.push(&chunk[..n]) {
                Ok(lines) => lines,
                Err(e) => {
                    warn!(client = %self.addr, error = %e, "Buffer size limit exceeded");
                    self.reply(Response::error(UNTAGGED, &e));
                    return Err(e.into());
                }
            };

            let mut lines = lines.into_iter();
            while let Some(line) = lines.next() {
                if !self.responses.wait_for_capacity(MAX_QUEUED_RESPONSES).await {
                    return Err(ConnectionError::OutputClosed);
                }

                let text = String::from_utf8_lossy(&line);
                self.server.stats().line_processed();

                if self.engine.handle_line(&text) == Flow::Close {
                    return Ok(());
                }

                if self.state.upgrade_pending() {
                    let dropped =
                        lines.by_ref().map(|l| l.len()).sum::<usize>() + self.framer.discard();
                    if dropped > 0 {
                        warn!(
                            client = %self.addr,
                            bytes = dropped,
                            "Discarding plaintext received after STARTTLS"
                        );
                    }
                    self.upgrade().await?;
                    break;
                }
            }
        }
    }

    /// Reads one chunk from the socket.
    async fn read_chunk(&mut self, chunk: &mut [u8]) -> Result<usize, ConnectionError> {
        let reader = self
            .reader
            .as_mut()
            .ok_or(ConnectionError::ClientDisconnected)?;

        let n = match self.server.idle_timeout() {
            Some(limit) => tokio::time::timeout(limit, reader.read(chunk))
                .await
                .map_err(|_| ConnectionError::IdleTimeout)??,
            None => reader.read(chunk).await?,
        };

        if n == 0 {
            return Err(ConnectionError::ClientDisconnected);
        }

        self.server.stats().bytes_read(n);
        trace!(
            client = %self.addr,
            bytes = n,
            data = %escape_line(&String::from_utf8_lossy(&chunk[..n])),
            "Received"
        );
        Ok(n)
    }

    /// UpgradeRequested → Upgrading → Secure | Failed.
    async fn upgrade(&mut self) -> Result<(), ConnectionError> {
        let state = Arc::clone(&self.state);
        let Some(coordinator) = state.coordinator() else {
            return Ok(());
        };

        let result = match coordinator.wait_flushed().await {
            Ok(()) => {
                info!(client = %self.addr, "Upgrading session to TLS");
                coordinator.begin();
                self.handshake().await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                coordinator.finish(true);
                self.engine.tls_completed(true);
                self.server.stats().tls_upgraded();
                info!(client = %self.addr, "Session upgrade complete");
                Ok(())
            }
            Err(e) => {
                // Nothing queued behind the go-ahead may go out in plaintext
                drop(self.writer.lock().await.take());
                coordinator.finish(false);
                self.engine.tls_completed(false);
                Err(e.into())
            }
        }
    }

    /// Swaps the plain transport for TLS under the writer lock.
    async fn handshake(&mut self) -> Result<(), TlsError> {
        let acceptor = self.server.tls_acceptor().await?;

        let mut slot = self.writer.lock().await;
        let writer = slot.take().ok_or(TlsError::TransportUnavailable)?;
        let reader = self.reader.take().ok_or(TlsError::TransportUnavailable)?;

        let tcp = reader
            .unsplit(writer)
            .into_plain()
            .map_err(|_| TlsError::TransportUnavailable)?;
        let tls = tokio::time::timeout(self.server.handshake_timeout(), acceptor.accept(tcp))
            .await
            .map_err(|_| {
                TlsError::Handshake(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "client did not complete the handshake",
                ))
            })?
            .map_err(TlsError::Handshake)?;

        let (reader, writer) = tokio::io::split(SessionStream::Tls(Box::new(tls)));
        *slot = Some(writer);
        self.reader = Some(reader);
        Ok(())
    }

    fn reply(&self, response: Response) {
        if self.responses.send(response).is_err() {
            debug!(client = %self.addr, "Response stream closed, reply dropped");
        }
    }

    /// Closes the response stream, drains the dispatcher, closes the transport.
    ///
    /// The drain is bounded: every write carries the server's write
    /// timeout, and the first failed write stops the dispatcher.
    async fn shutdown(self) {
        let ConnectionHandler {
            reader,
            writer,
            addr,
            engine,
            state,
            responses,
            dispatcher,
            server,
            ..
        } = self;

        // An engine may close the session with an upgrade still pending
        if let Some(coordinator) = state.coordinator().filter(|c| c.is_pending()) {
            drop(writer.lock().await.take());
            coordinator.finish(false);
        }

        drop(engine);
        drop(responses);
        dispatcher.finish().await;

        let writer = writer.lock().await.take();
        if let (Some(reader), Some(writer)) = (reader, writer) {
            let mut stream = reader.unsplit(writer);
            if let Err(e) = stream.shutdown().await {
                trace!(client = %addr, error = %e, "Transport shutdown failed");
            }
        }

        server.stats().connection_closed();
    }
}

/// Handles a client connection.
///
/// This is a convenience function that creates a ConnectionHandler
/// and runs it to completion.
pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, server: Arc<Server>) {
    let handler = ConnectionHandler::new(stream, addr, server);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::ClientDisconnected => {}
            ConnectionError::IoError(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %e, "Connection ended with error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendConfig, Identity};
    use crate::config::{Config, PolicySet, ServerBackends, ServerConfig, TlsConfig};
    use crate::protocol::{SessionHooks, TlsRequest};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn server_config(policy: PolicySet) -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            hostname: "imap.test".to_string(),
            policy_set: policy,
            backends: ServerBackends {
                auth: Some(BackendConfig::inline(
                    "local",
                    json!({"Users": {"alice": "secret"}})
                        .as_object()
                        .unwrap()
                        .clone(),
                )),
                mailbox: None,
                resolver: None,
            },
            ..Default::default()
        }
    }

    fn open_policy() -> PolicySet {
        PolicySet {
            disable_tls: false,
            require_tls: false,
            maximum_connections: 0,
        }
    }

    async fn create_test_server(server: Server) -> (SocketAddr, Arc<Server>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(server);

        let server_clone = Arc::clone(&server);
        tokio::spawn(async move {
            while let Ok((stream, client_addr)) = listener.accept().await {
                tokio::spawn(handle_connection(
                    stream,
                    client_addr,
                    Arc::clone(&server_clone),
                ));
            }
        });

        (addr, server)
    }

    fn build_server(config: ServerConfig) -> Server {
        Server::new(&Config::default(), &config).unwrap()
    }

    async fn read_line<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        line
    }

    async fn connect(addr: SocketAddr) -> BufReader<TcpStream> {
        let mut client = BufReader::new(TcpStream::connect(addr).await.unwrap());
        let greeting = read_line(&mut client).await;
        assert!(greeting.starts_with("* OK"), "greeting: {:?}", greeting);
        client
    }

    #[tokio::test]
    async fn test_greeting_and_noop() {
        let (addr, _) = create_test_server(build_server(server_config(open_policy()))).await;
        let mut client = connect(addr).await;

        client.get_mut().write_all(b"A1 NOOP\r\n").await.unwrap();
        assert_eq!(read_line(&mut client).await, "A1 OK NOOP completed\r\n");
    }

    #[tokio::test]
    async fn test_command_split_across_writes() {
        let (addr, _) = create_test_server(build_server(server_config(open_policy()))).await;
        let mut client = connect(addr).await;

        client.get_mut().write_all(b"A1 NO").await.unwrap();
        client.get_mut().flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.get_mut().write_all(b"OP\r\n").await.unwrap();

        assert_eq!(read_line(&mut client).await, "A1 OK NOOP completed\r\n");
    }

    #[tokio::test]
    async fn test_pipelined_commands_answered_in_order() {
        let (addr, _) = create_test_server(build_server(server_config(open_policy()))).await;
        let mut client = connect(addr).await;

        client
            .get_mut()
            .write_all(b"a NOOP\r\nb NOOP\r\nc NOOP\r\n")
            .await
            .unwrap();
        for tag in ["a", "b", "c"] {
            assert_eq!(
                read_line(&mut client).await,
                format!("{} OK NOOP completed\r\n", tag)
            );
        }
    }

    #[tokio::test]
    async fn test_buffer_overflow_replies_then_closes() {
        let mut config = server_config(open_policy());
        config.maximum_buffer_length = 10;
        let (addr, server) = create_test_server(build_server(config)).await;
        let mut client = connect(addr).await;

        client.get_mut().write_all(b"12345678901").await.unwrap();
        assert_eq!(
            read_line(&mut client).await,
            "* BAD Maximum buffer length exceeded\r\n"
        );

        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.stats().lines_processed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_logout_flushes_then_closes() {
        let (addr, server) = create_test_server(build_server(server_config(open_policy()))).await;
        let mut client = connect(addr).await;

        client.get_mut().write_all(b"A9 LOGOUT\r\n").await.unwrap();
        assert!(read_line(&mut client).await.starts_with("* BYE"));
        assert_eq!(read_line(&mut client).await, "A9 OK LOGOUT completed\r\n");

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.stats().active_connections.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_login_success_and_failure() {
        let (addr, _) = create_test_server(build_server(server_config(open_policy()))).await;
        let mut client = connect(addr).await;

        client
            .get_mut()
            .write_all(b"A1 LOGIN alice wrong\r\n")
            .await
            .unwrap();
        assert!(read_line(&mut client).await.starts_with("A1 NO"));

        client
            .get_mut()
            .write_all(b"A2 LOGIN alice \"secret\"\r\n")
            .await
            .unwrap();
        assert_eq!(read_line(&mut client).await, "A2 OK LOGIN completed\r\n");
    }

    #[tokio::test]
    async fn test_require_tls_rejects_login() {
        let policy = PolicySet {
            require_tls: true,
            ..open_policy()
        };
        let (addr, _) = create_test_server(build_server(server_config(policy))).await;
        let mut client = connect(addr).await;

        client
            .get_mut()
            .write_all(b"A1 LOGIN alice secret\r\n")
            .await
            .unwrap();
        assert_eq!(read_line(&mut client).await, "A1 BAD STARTTLS required\r\n");
    }

    #[tokio::test]
    async fn test_disable_tls_never_reaches_handshake() {
        let policy = PolicySet {
            disable_tls: true,
            require_tls: true,
            maximum_connections: 0,
        };
        let (addr, server) = create_test_server(build_server(server_config(policy))).await;
        let mut client = connect(addr).await;

        client.get_mut().write_all(b"A1 STARTTLS\r\n").await.unwrap();
        assert_eq!(read_line(&mut client).await, "A1 BAD STARTTLS not supported\r\n");

        // RequireTLS is not honoured when TLS is disabled
        client
            .get_mut()
            .write_all(b"A2 LOGIN alice secret\r\n")
            .await
            .unwrap();
        assert_eq!(read_line(&mut client).await, "A2 OK LOGIN completed\r\n");
        assert_eq!(server.stats().tls_upgrades.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let mut config = server_config(open_policy());
        config.idle_timeout = Some(1);
        let (addr, _) = create_test_server(build_server(config)).await;
        let mut client = connect(addr).await;

        let line = tokio::time::timeout(Duration::from_secs(3), async {
            let mut line = String::new();
            client.read_line(&mut line).await.unwrap();
            line
        })
        .await
        .unwrap();
        assert!(line.starts_with("* BYE Autologout"));
    }

    #[tokio::test]
    async fn test_mailbox_commands_reach_backend() {
        let mut config = server_config(open_policy());
        config.backends.mailbox = Some(BackendConfig::inline(
            "local",
            json!({"Mailboxes": ["Sent"]}).as_object().unwrap().clone(),
        ));
        let (addr, server) = create_test_server(build_server(config)).await;
        let mut client = connect(addr).await;

        client
            .get_mut()
            .write_all(b"A1 LOGIN alice secret\r\nA2 CREATE Archive\r\nA3 LIST \"\" *\r\n")
            .await
            .unwrap();
        assert_eq!(read_line(&mut client).await, "A1 OK LOGIN completed\r\n");
        assert_eq!(read_line(&mut client).await, "A2 OK CREATE completed\r\n");
        for name in ["Archive", "INBOX", "Sent"] {
            assert_eq!(
                read_line(&mut client).await,
                format!("* LIST () \"/\" \"{}\"\r\n", name)
            );
        }
        assert_eq!(read_line(&mut client).await, "A3 OK LIST completed\r\n");

        let mailbox = server.mailbox_backend().unwrap();
        assert_eq!(
            mailbox.list(&Identity::new("alice")),
            vec!["Archive", "INBOX", "Sent"]
        );
    }

    /// Pipelines `batches` × 8192 NOOPs, then half-closes. Nothing reads
    /// the replies.
    fn flood(
        mut write_half: tokio::net::tcp::OwnedWriteHalf,
        batches: usize,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let batch = b"a NOOP\r\n".repeat(8192);
            for _ in 0..batches {
                if write_half.write_all(&batch).await.is_err() {
                    return;
                }
            }
            let _ = write_half.shutdown().await;
        })
    }

    #[tokio::test]
    async fn test_flood_without_reading_keeps_queue_bounded() {
        let (addr, server) = create_test_server(build_server(server_config(open_policy()))).await;
        let client = connect(addr).await;
        let (_read_half, write_half) = client.into_inner().into_split();
        let writer = flood(write_half, 128);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let processed = server.stats().lines_processed.load(Ordering::Relaxed);
        let written = server.stats().responses_written.load(Ordering::Relaxed);
        writer.abort();

        assert!(processed > 0);
        assert!(processed < 128 * 8192, "read loop never stalled");
        assert!(
            processed <= written + MAX_QUEUED_RESPONSES as u64,
            "processed {} lines but wrote only {} responses",
            processed,
            written
        );
    }

    #[tokio::test]
    async fn test_non_reading_peer_is_released() {
        let mut config = server_config(open_policy());
        config.idle_timeout = Some(1);
        let (addr, server) = create_test_server(build_server(config)).await;
        let client = connect(addr).await;
        let (_read_half, write_half) = client.into_inner().into_split();
        // Half-closes once the burst is out, if the server lets it get out
        let writer = flood(write_half, 64);

        let released = tokio::time::timeout(Duration::from_secs(10), async {
            while server.stats().active_connections.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        writer.abort();

        assert!(released.is_ok(), "session never released its slot");
    }

    mod starttls {
        use super::*;
        use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
        use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
        use rustls::{DigitallySignedStruct, SignatureScheme};
        use tokio_rustls::TlsConnector;

        /// Accepts the self-signed test certificate.
        #[derive(Debug)]
        struct NoVerifier;

        impl ServerCertVerifier for NoVerifier {
            fn verify_server_cert(
                &self,
                _end_entity: &CertificateDer<'_>,
                _intermediates: &[CertificateDer<'_>],
                _server_name: &ServerName<'_>,
                _ocsp_response: &[u8],
                _now: UnixTime,
            ) -> Result<ServerCertVerified, rustls::Error> {
                Ok(ServerCertVerified::assertion())
            }

            fn verify_tls12_signature(
                &self,
                _message: &[u8],
                _cert: &CertificateDer<'_>,
                _dss: &DigitallySignedStruct,
            ) -> Result<HandshakeSignatureValid, rustls::Error> {
                Ok(HandshakeSignatureValid::assertion())
            }

            fn verify_tls13_signature(
                &self,
                _message: &[u8],
                _cert: &CertificateDer<'_>,
                _dss: &DigitallySignedStruct,
            ) -> Result<HandshakeSignatureValid, rustls::Error> {
                Ok(HandshakeSignatureValid::assertion())
            }

            fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
                rustls::crypto::ring::default_provider()
                    .signature_verification_algorithms
                    .supported_schemes()
            }
        }

        fn connector() -> TlsConnector {
            let config = rustls::ClientConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .unwrap()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();
            TlsConnector::from(Arc::new(config))
        }

        fn tls_server_config(dir: &std::path::Path, policy: PolicySet) -> ServerConfig {
            let rcgen::CertifiedKey { cert, key_pair } =
                rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
            std::fs::write(dir.join("cert.pem"), cert.pem()).unwrap();
            std::fs::write(dir.join("key.pem"), key_pair.serialize_pem()).unwrap();

            let mut config = server_config(policy);
            config.tls_config = TlsConfig {
                cert_file: dir.join("cert.pem").display().to_string(),
                key_file: dir.join("key.pem").display().to_string(),
            };
            config
        }

        fn tls_server(dir: &std::path::Path, policy: PolicySet) -> Server {
            build_server(tls_server_config(dir, policy))
        }

        /// Queues an extra reply right behind the STARTTLS go-ahead.
        struct EagerEngine {
            responses: ResponseSender,
            hooks: Arc<dyn SessionHooks>,
        }

        impl ProtocolEngine for EagerEngine {
            fn start(&mut self) -> Response {
                Response::status(Status::Ok, "ready")
            }

            fn handle_line(&mut self, line: &str) -> Flow {
                let tag = line.split_whitespace().next().unwrap_or("*").to_string();
                if line.contains("STARTTLS") {
                    if let TlsRequest::Proceed(done) = self.hooks.request_tls() {
                        let _ = self.responses.send(
                            Response::tagged(&tag, Status::Ok, "go ahead").with_done(done),
                        );
                        let _ = self
                            .responses
                            .send(Response::status(Status::Ok, "sent after go-ahead"));
                    }
                } else {
                    let _ = self
                        .responses
                        .send(Response::tagged(&tag, Status::Ok, "done"));
                }
                Flow::Continue
            }

            fn tls_completed(&mut self, _ok: bool) {}
        }

        #[tokio::test]
        async fn test_upgrade_then_commands_over_tls() {
            let dir = tempfile::tempdir().unwrap();
            let policy = PolicySet {
                require_tls: true,
                ..open_policy()
            };
            let (addr, server) = create_test_server(tls_server(dir.path(), policy)).await;
            let mut client = connect(addr).await;

            client.get_mut().write_all(b"A1 STARTTLS\r\n").await.unwrap();
            assert_eq!(
                read_line(&mut client).await,
                "A1 OK Begin TLS negotiation now\r\n"
            );

            let tcp = client.into_inner();
            let domain = ServerName::try_from("localhost").unwrap();
            let tls = connector().connect(domain, tcp).await.unwrap();
            let mut tls = BufReader::new(tls);

            tls.get_mut()
                .write_all(b"A2 LOGIN alice secret\r\n")
                .await
                .unwrap();
            tls.get_mut().flush().await.unwrap();
            assert_eq!(read_line(&mut tls).await, "A2 OK LOGIN completed\r\n");

            tls.get_mut().write_all(b"A3 STARTTLS\r\n").await.unwrap();
            tls.get_mut().flush().await.unwrap();
            assert_eq!(read_line(&mut tls).await, "A3 BAD TLS already active\r\n");

            assert_eq!(server.stats().tls_upgrades.load(Ordering::Relaxed), 1);
        }

        #[tokio::test]
        async fn test_plaintext_after_starttls_is_discarded() {
            let dir = tempfile::tempdir().unwrap();
            let (addr, _) = create_test_server(tls_server(dir.path(), open_policy())).await;
            let mut client = connect(addr).await;

            // The injected LOGOUT must never reach the engine
            client
                .get_mut()
                .write_all(b"A1 STARTTLS\r\nA2 LOGOUT\r\n")
                .await
                .unwrap();
            assert_eq!(
                read_line(&mut client).await,
                "A1 OK Begin TLS negotiation now\r\n"
            );

            let tcp = client.into_inner();
            let domain = ServerName::try_from("localhost").unwrap();
            let tls = connector().connect(domain, tcp).await.unwrap();
            let mut tls = BufReader::new(tls);

            tls.get_mut().write_all(b"A3 NOOP\r\n").await.unwrap();
            tls.get_mut().flush().await.unwrap();
            assert_eq!(read_line(&mut tls).await, "A3 OK NOOP completed\r\n");
        }

        #[tokio::test]
        async fn test_failed_handshake_ends_session() {
            let dir = tempfile::tempdir().unwrap();
            let (addr, server) = create_test_server(tls_server(dir.path(), open_policy())).await;
            let mut client = connect(addr).await;

            client.get_mut().write_all(b"A1 STARTTLS\r\n").await.unwrap();
            assert_eq!(
                read_line(&mut client).await,
                "A1 OK Begin TLS negotiation now\r\n"
            );

            // Not a ClientHello
            client
                .get_mut()
                .write_all(b"A2 NOOP\r\n")
                .await
                .unwrap();

            let mut rest = Vec::new();
            let _ = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
                .await
                .unwrap();
            assert!(!String::from_utf8_lossy(&rest).contains("A2 OK"));

            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(server.stats().active_connections.load(Ordering::Relaxed), 0);
            assert_eq!(server.stats().tls_upgrades.load(Ordering::Relaxed), 0);
        }

        #[tokio::test]
        async fn test_silent_client_handshake_times_out() {
            let dir = tempfile::tempdir().unwrap();
            let mut config = tls_server_config(dir.path(), open_policy());
            config.idle_timeout = Some(1);
            let (addr, server) = create_test_server(build_server(config)).await;
            let mut client = connect(addr).await;

            client.get_mut().write_all(b"A1 STARTTLS\r\n").await.unwrap();
            assert_eq!(
                read_line(&mut client).await,
                "A1 OK Begin TLS negotiation now\r\n"
            );

            // No ClientHello ever follows
            let mut rest = Vec::new();
            let _ = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
                .await
                .unwrap();
            assert!(rest.is_empty());

            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(server.stats().active_connections.load(Ordering::Relaxed), 0);
            assert_eq!(server.stats().tls_upgrades.load(Ordering::Relaxed), 0);
        }

        #[tokio::test]
        async fn test_reply_queued_behind_go_ahead_is_encrypted() {
            let dir = tempfile::tempdir().unwrap();
            let server = tls_server(dir.path(), open_policy()).with_engine(Arc::new(
                |ctx: EngineContext| -> Box<dyn ProtocolEngine> {
                    Box::new(EagerEngine {
                        responses: ctx.responses,
                        hooks: ctx.hooks,
                    })
                },
            ));
            let (addr, _) = create_test_server(server).await;
            let mut client = connect(addr).await;

            client.get_mut().write_all(b"A1 STARTTLS\r\n").await.unwrap();
            assert_eq!(read_line(&mut client).await, "A1 OK go ahead\r\n");
            assert!(client.buffer().is_empty());

            // Plaintext ahead of the ServerHello would break the handshake
            let tcp = client.into_inner();
            let domain = ServerName::try_from("localhost").unwrap();
            let tls = connector().connect(domain, tcp).await.unwrap();
            let mut tls = BufReader::new(tls);
            assert_eq!(read_line(&mut tls).await, "* OK sent after go-ahead\r\n");

            tls.get_mut().write_all(b"A2 NOOP\r\n").await.unwrap();
            tls.get_mut().flush().await.unwrap();
            assert_eq!(read_line(&mut tls).await, "A2 OK done\r\n");
        }
    }

    /// Counts engine calls and checks none happen while an upgrade is pending.
    struct RecordingEngine {
        responses: ResponseSender,
        hooks: Arc<dyn SessionHooks>,
        calls: Arc<AtomicUsize>,
        calls_while_pending: Arc<AtomicUsize>,
        pending: bool,
    }

    impl ProtocolEngine for RecordingEngine {
        fn start(&mut self) -> Response {
            Response::status(Status::Ok, "recorder ready")
        }

        fn handle_line(&mut self, line: &str) -> Flow {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.pending {
                self.calls_while_pending.fetch_add(1, Ordering::SeqCst);
            }
            let tag = line.split_whitespace().next().unwrap_or("*").to_string();
            if line.contains("STARTTLS") {
                if let TlsRequest::Proceed(done) = self.hooks.request_tls() {
                    self.pending = true;
                    let _ = self.responses.send(
                        Response::tagged(&tag, Status::Ok, "go ahead").with_done(done),
                    );
                }
            } else {
                let _ = self
                    .responses
                    .send(Response::tagged(&tag, Status::Ok, "recorded"));
            }
            Flow::Continue
        }

        fn tls_completed(&mut self, _ok: bool) {
            self.pending = false;
        }
    }

    #[tokio::test]
    async fn test_no_engine_calls_during_upgrade() {
        let calls = Arc::new(AtomicUsize::new(0));
        let during = Arc::new(AtomicUsize::new(0));

        let factory_calls = Arc::clone(&calls);
        let factory_during = Arc::clone(&during);
        // No certificate configured: the handshake fails after the go-ahead
        let server = build_server(server_config(open_policy())).with_engine(Arc::new(
            move |ctx: EngineContext| -> Box<dyn ProtocolEngine> {
                Box::new(RecordingEngine {
                    responses: ctx.responses,
                    hooks: ctx.hooks,
                    calls: Arc::clone(&factory_calls),
                    calls_while_pending: Arc::clone(&factory_during),
                    pending: false,
                })
            },
        ));
        let (addr, _) = create_test_server(server).await;
        let mut client = connect(addr).await;

        client
            .get_mut()
            .write_all(b"A1 STARTTLS\r\nA2 NOOP\r\nA3 NOOP\r\n")
            .await
            .unwrap();
        assert_eq!(read_line(&mut client).await, "A1 OK go ahead\r\n");
        client.get_mut().write_all(b"A4 NOOP\r\n").await.unwrap();

        let mut rest = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(during.load(Ordering::SeqCst), 0);
    }
}
