//! Protocol Engine Capability
//!
//! The session layer never interprets IMAP commands itself. It hands each
//! complete line to a [`ProtocolEngine`], which emits [`Response`] values
//! onto its response stream on its own schedule.
//!
//! The engine reaches back into the session only through [`SessionHooks`],
//! injected at construction time. This keeps the engine free of any
//! dependency on the connection types.
//!
//! ```text
//!   read loop ──handle_line()──> ProtocolEngine ──Response──> mpsc ──> dispatcher
//!       ▲                                                               │
//!       └────────────── wait_for_capacity() <── queue depth ────────────┘
//!                                     │
//!                                     └──SessionHooks──> auth backend / TLS coordinator
//! ```

use crate::backends::MailboxError;
use crate::protocol::types::{DoneCallback, Response};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::{SendError, TryRecvError};
use tokio::sync::{mpsc, Notify};

/// Responses a session may have queued before its read loop stops
/// taking input.
pub const MAX_QUEUED_RESPONSES: usize = 64;

#[derive(Debug, Default)]
struct QueueDepth {
    queued: AtomicUsize,
    drained: Notify,
}

/// Sending side of a session's response stream.
///
/// Sends never block, so an engine can emit from synchronous code. The
/// stream counts what is queued instead, and the read loop waits on
/// [`wait_for_capacity`](Self::wait_for_capacity) before handing the
/// engine another line.
#[derive(Debug, Clone)]
pub struct ResponseSender {
    tx: mpsc::UnboundedSender<Response>,
    depth: Arc<QueueDepth>,
}

impl ResponseSender {
    /// Queues a response. Fails once the dispatcher is gone.
    pub fn send(&self, response: Response) -> Result<(), SendError<Response>> {
        self.depth.queued.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.tx.send(response) {
            self.depth.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }
        Ok(())
    }

    /// Responses queued and not yet taken by the dispatcher.
    pub fn queued(&self) -> usize {
        self.depth.queued.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Waits until fewer than `limit` responses are queued.
    ///
    /// Returns `false` if the receiving side went away while waiting.
    pub async fn wait_for_capacity(&self, limit: usize) -> bool {
        loop {
            let drained = self.depth.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.tx.is_closed() {
                return false;
            }
            if self.queued() < limit {
                return true;
            }
            drained.await;
        }
    }
}

/// Receiving side of a session's response stream
#[derive(Debug)]
pub struct ResponseReceiver {
    rx: mpsc::UnboundedReceiver<Response>,
    depth: Arc<QueueDepth>,
}

impl ResponseReceiver {
    pub async fn recv(&mut self) -> Option<Response> {
        let response = self.rx.recv().await;
        if response.is_some() {
            self.taken();
        }
        response
    }

    pub fn try_recv(&mut self) -> Result<Response, TryRecvError> {
        let response = self.rx.try_recv();
        if response.is_ok() {
            self.taken();
        }
        response
    }

    fn taken(&self) {
        self.depth.queued.fetch_sub(1, Ordering::AcqRel);
        self.depth.drained.notify_waiters();
    }
}

impl Drop for ResponseReceiver {
    fn drop(&mut self) {
        self.rx.close();
        self.depth.drained.notify_waiters();
    }
}

/// Creates a fresh response stream for one session.
pub fn response_channel() -> (ResponseSender, ResponseReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(QueueDepth::default());
    (
        ResponseSender {
            tx,
            depth: Arc::clone(&depth),
        },
        ResponseReceiver { rx, depth },
    )
}

/// What the read loop should do after a line was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The peer ended the session (e.g. LOGOUT)
    Close,
}

/// Why a STARTTLS request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRefusal {
    /// The transport is already encrypted
    AlreadyActive,
    /// An upgrade is already underway
    InProgress,
    /// TLS is disabled by policy or a previous upgrade failed
    Unavailable,
}

impl fmt::Display for TlsRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsRefusal::AlreadyActive => f.write_str("TLS already active"),
            TlsRefusal::InProgress => f.write_str("TLS negotiation already in progress"),
            TlsRefusal::Unavailable => f.write_str("STARTTLS not supported"),
        }
    }
}

/// Answer to [`SessionHooks::request_tls`].
pub enum TlsRequest {
    /// Upgrade accepted. Attach the callback to the go-ahead reply; the
    /// handshake starts once that reply has been written.
    Proceed(DoneCallback),
    /// Upgrade refused; reply with an error instead.
    Refused(TlsRefusal),
}

impl fmt::Debug for TlsRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsRequest::Proceed(_) => f.write_str("Proceed(<callback>)"),
            TlsRequest::Refused(reason) => f.debug_tuple("Refused").field(reason).finish(),
        }
    }
}

/// Session capabilities offered to the engine.
pub trait SessionHooks: Send + Sync {
    /// Log sink, tagged with the session's remote address.
    fn log(&self, message: fmt::Arguments<'_>);

    /// Validates a credential exchange. Never fails loudly: any backend
    /// problem is reported as `false`.
    fn validate_auth(&self, mechanism: &str, args: &[String]) -> bool;

    /// SASL mechanisms to advertise in capability responses.
    fn mechanisms(&self) -> Vec<String>;

    /// Asks for a STARTTLS upgrade.
    fn request_tls(&self) -> TlsRequest;

    /// True when STARTTLS can be offered right now.
    fn tls_available(&self) -> bool;

    /// True when policy requires TLS before other commands are allowed.
    fn tls_required(&self) -> bool;

    /// True once the transport is encrypted.
    fn tls_active(&self) -> bool;

    /// Mailboxes visible to the authenticated user, sorted. `None` before
    /// authentication or without a mailbox backend.
    fn list_mailboxes(&self) -> Option<Vec<String>>;

    /// Creates a mailbox owned by the authenticated user.
    fn create_mailbox(&self, name: &str) -> Result<(), MailboxError>;
}

/// The protocol state machine driven by a session.
pub trait ProtocolEngine: Send {
    /// Returns the greeting sent when the session starts.
    fn start(&mut self) -> Response;

    /// Handles one complete line (CRLF included), emitting responses onto
    /// the engine's response stream.
    fn handle_line(&mut self, line: &str) -> Flow;

    /// Reports the outcome of a STARTTLS handshake.
    fn tls_completed(&mut self, ok: bool);
}

/// Everything an engine needs to be built for one session.
pub struct EngineContext {
    pub hostname: String,
    pub responses: ResponseSender,
    pub hooks: Arc<dyn SessionHooks>,
}

/// Builds one engine per accepted connection.
pub trait EngineFactory: Send + Sync {
    fn build(&self, ctx: EngineContext) -> Box<dyn ProtocolEngine>;
}

impl<F> EngineFactory for F
where
    F: Fn(EngineContext) -> Box<dyn ProtocolEngine> + Send + Sync,
{
    fn build(&self, ctx: EngineContext) -> Box<dyn ProtocolEngine> {
        self(ctx)
    }
}
