//! STARTTLS Upgrade Coordination
//!
//! Upgrading a live connection from plaintext to TLS is where smuggling
//! bugs hide: any plaintext byte handed to the engine after the client
//! asked for TLS could have been injected by a man in the middle.
//!
//! ## State Machine
//!
//! ```text
//!   Plain ──request()──> UpgradeRequested ──begin()──> Upgrading ──finish(true)──> Secure
//!                                                          │
//!                                                          └──finish(false)──> Failed
//! ```
//!
//! While the state is `UpgradeRequested` or `Upgrading` the read loop
//! performs no socket reads and makes no engine calls. The go-ahead reply
//! carries a completion callback; the read loop waits for it before
//! starting the handshake so the reply is on the wire in plaintext first.
//!
//! The coordinator holds its [`TransportGate`] from `request()` until
//! `finish()`. The dispatcher parks on that gate right after the go-ahead
//! is flushed, so later responses go out over the new transport.
//!
//! Certificate material is loaded with `rustls-pemfile` into a rustls
//! `ServerConfig` backed by the ring provider.

use crate::connection::dispatcher::TransportGate;
use crate::protocol::{TlsRefusal, TlsRequest};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;

/// Upgrade progress of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    Plain,
    UpgradeRequested,
    Upgrading,
    Secure,
    Failed,
}

/// Errors that can occur while preparing or performing a TLS upgrade.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("no TLS certificate configured")]
    NotConfigured,

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("invalid TLS configuration: {0}")]
    Config(#[from] rustls::Error),

    #[error("go-ahead reply was never written")]
    NotFlushed,

    #[error("transport unavailable for upgrade")]
    TransportUnavailable,

    #[error("handshake failed: {0}")]
    Handshake(#[source] std::io::Error),
}

/// Per-session STARTTLS coordinator.
///
/// Only installed when the server policy allows TLS.
#[derive(Debug)]
pub struct UpgradeCoordinator {
    state: Mutex<UpgradeState>,
    /// Fires once the go-ahead reply has been written
    flushed: Mutex<Option<oneshot::Receiver<()>>>,
    gate: Arc<TransportGate>,
}

impl Default for UpgradeCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl UpgradeCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(UpgradeState::Plain),
            flushed: Mutex::new(None),
            gate: Arc::new(TransportGate::new()),
        }
    }

    /// The gate the session's dispatcher parks on during the swap.
    pub fn gate(&self) -> Arc<TransportGate> {
        Arc::clone(&self.gate)
    }

    pub fn state(&self) -> UpgradeState {
        *self.state.lock().unwrap()
    }

    /// Plain → UpgradeRequested.
    ///
    /// On success the returned callback must be attached to the go-ahead
    /// reply so the dispatcher fires it once the reply is written.
    pub fn request(&self) -> TlsRequest {
        let mut state = self.state.lock().unwrap();
        match *state {
            UpgradeState::Plain => {
                let (tx, rx) = oneshot::channel();
                *self.flushed.lock().unwrap() = Some(rx);
                *state = UpgradeState::UpgradeRequested;
                self.gate.hold();
                TlsRequest::Proceed(Box::new(move || {
                    let _ = tx.send(());
                }))
            }
            UpgradeState::UpgradeRequested | UpgradeState::Upgrading => {
                TlsRequest::Refused(TlsRefusal::InProgress)
            }
            UpgradeState::Secure => TlsRequest::Refused(TlsRefusal::AlreadyActive),
            UpgradeState::Failed => TlsRequest::Refused(TlsRefusal::Unavailable),
        }
    }

    /// True while the read loop must stay away from the socket.
    pub fn is_pending(&self) -> bool {
        matches!(
            self.state(),
            UpgradeState::UpgradeRequested | UpgradeState::Upgrading
        )
    }

    pub fn is_secure(&self) -> bool {
        self.state() == UpgradeState::Secure
    }

    /// Waits until the go-ahead reply has been written to the peer.
    ///
    /// Fails when the callback was dropped without firing, e.g. because
    /// the dispatcher hit a write error.
    pub async fn wait_flushed(&self) -> Result<(), TlsError> {
        let rx = self
            .flushed
            .lock()
            .unwrap()
            .take()
            .ok_or(TlsError::NotFlushed)?;
        rx.await.map_err(|_| TlsError::NotFlushed)
    }

    /// UpgradeRequested → Upgrading.
    pub fn begin(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == UpgradeState::UpgradeRequested {
            *state = UpgradeState::Upgrading;
        }
    }

    /// Upgrading → Secure or Failed. Releases the dispatcher.
    pub fn finish(&self, ok: bool) {
        *self.state.lock().unwrap() = if ok {
            UpgradeState::Secure
        } else {
            UpgradeState::Failed
        };
        self.gate.release();
    }
}

/// Builds a TLS acceptor from PEM certificate and key files.
pub fn load_acceptor(cert_file: &Path, key_file: &Path) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}
