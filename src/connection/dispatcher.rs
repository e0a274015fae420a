//! Response Dispatcher
//!
//! Drains a session's response stream on its own task and writes every
//! response to the transport in the order the engine produced it.
//!
//! The writer lives in a slot shared with the session controller. The
//! controller takes the writer out of the slot, under the same lock, when
//! it swaps the transport for TLS; every write issued after that sees the
//! new transport.
//!
//! A response's completion callback runs after its bytes are flushed and
//! before the next response is written. If a [`TransportGate`] is held at
//! that point the dispatcher parks until it is released, so nothing queued
//! behind a STARTTLS go-ahead reaches the wire before the swap.
//!
//! Every write is bounded by a timeout. The first failed or timed-out
//! write stops the dispatcher; queued responses are dropped along with
//! their callbacks, which tells a waiting TLS upgrade that the go-ahead
//! reply never reached the peer.

use crate::connection::handler::ConnectionStats;
use crate::protocol::types::escape_line;
use crate::protocol::ResponseReceiver;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// The session's write half, shared between dispatcher and controller.
pub type WriterSlot<W> = Arc<Mutex<Option<W>>>;

/// Holds the dispatcher back while the session owns the transport.
#[derive(Debug, Default)]
pub struct TransportGate {
    held: AtomicBool,
    opened: Notify,
}

impl TransportGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.opened.notify_waiters();
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Returns once the gate is not held.
    pub async fn wait_open(&self) {
        loop {
            let opened = self.opened.notified();
            tokio::pin!(opened);
            opened.as_mut().enable();

            if !self.is_held() {
                return;
            }
            opened.await;
        }
    }
}

/// Handle to a running dispatcher task.
#[derive(Debug)]
pub struct ResponseDispatcher {
    handle: JoinHandle<()>,
}

impl ResponseDispatcher {
    /// Starts draining `responses` into `writer`.
    pub fn spawn<W>(
        writer: WriterSlot<W>,
        responses: ResponseReceiver,
        addr: SocketAddr,
        stats: Arc<ConnectionStats>,
        write_timeout: Duration,
        gate: Option<Arc<TransportGate>>,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let handle = tokio::spawn(dispatch_loop(
            writer,
            responses,
            addr,
            stats,
            write_timeout,
            gate,
        ));
        Self { handle }
    }

    /// Waits until every queued response has been handled.
    ///
    /// Returns once all senders of the response stream are dropped, or
    /// after the first write that fails.
    pub async fn finish(self) {
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Response dispatcher task failed");
        }
    }
}

async fn dispatch_loop<W>(
    writer: WriterSlot<W>,
    mut responses: ResponseReceiver,
    addr: SocketAddr,
    stats: Arc<ConnectionStats>,
    write_timeout: Duration,
    gate: Option<Arc<TransportGate>>,
) where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(mut response) = responses.recv().await {
        let done = response.take_done();

        match write_response(&writer, response.lines(), addr, write_timeout).await {
            Ok(written) => {
                stats.bytes_written(written);
                stats.response_written();
                if let Some(done) = done {
                    done();
                    if let Some(gate) = &gate {
                        gate.wait_open().await;
                    }
                }
            }
            Err(e) => {
                debug!(client = %addr, error = %e, "Failed to write response");
                break;
            }
        }
    }

    trace!(client = %addr, "Response stream closed");
}

async fn write_response<W>(
    writer: &WriterSlot<W>,
    lines: &[String],
    addr: SocketAddr,
    limit: Duration,
) -> io::Result<usize>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut slot = writer.lock().await;
    let stream = slot
        .as_mut()
        .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

    let write = async {
        for line in lines {
            trace!(client = %addr, bytes = line.len(), line = %escape_line(line), "Sent");
            stream.write_all(line.as_bytes()).await?;
        }
        stream.flush().await
    };
    tokio::time::timeout(limit, write)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))??;

    Ok(lines.iter().map(String::len).sum())
}
