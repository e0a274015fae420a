//! IMAP Server
//!
//! A [`Server`] owns everything its sessions share: the resolved backends,
//! the policy set, the lazily built TLS acceptor, the engine factory and
//! the connection statistics. One process may run several servers, each
//! on its own listener and task.
//!
//! ## Admission
//!
//! When `MaximumConnections` is non-zero every session holds a semaphore
//! permit for its lifetime. A client accepted while no permit is free gets
//! a single `* BYE` line and is disconnected.

use crate::backends::{
    load_auth, load_mailbox, resolve_path, AuthBackend, BackendConfig, BackendError,
    MailboxBackend, ResolveError,
};
use crate::commands::CommandHandler;
use crate::config::{Config, PolicySet, ServerConfig};
use crate::connection::tls::{load_acceptor, TlsError};
use crate::connection::{handle_connection, ConnectionStats};
use crate::protocol::{EngineFactory, Response, Status};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OnceCell, Semaphore};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Bound on a single response write, and on the STARTTLS handshake, when
/// no idle timeout is configured
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors that stop a single server from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// One configured IMAP listener and its shared session resources.
pub struct Server {
    config: ServerConfig,
    rel_path: PathBuf,
    auth: Option<Arc<dyn AuthBackend>>,
    mailbox: Option<Arc<dyn MailboxBackend>>,
    resolver: Option<BackendConfig>,
    tls_acceptor: OnceCell<TlsAcceptor>,
    engine: Arc<dyn EngineFactory>,
    stats: Arc<ConnectionStats>,
    limiter: Option<Arc<Semaphore>>,
}

impl Server {
    /// Resolves and loads the server's backends.
    pub fn new(config: &Config, server: &ServerConfig) -> Result<Self, ServerError> {
        let slots = &server.backends;

        let auth = match &slots.auth {
            Some(slot) => Some(load_auth(&slot.resolve(&config.backends)?, config.rel_path())?),
            None => None,
        };
        let mailbox = match &slots.mailbox {
            Some(slot) => Some(load_mailbox(&slot.resolve(&config.backends)?)?),
            None => None,
        };
        let resolver = slots
            .resolver
            .as_ref()
            .map(|slot| slot.resolve(&config.backends))
            .transpose()?;

        let maximum = server.policy_set.maximum_connections;
        let limiter = (maximum > 0).then(|| Arc::new(Semaphore::new(maximum)));

        Ok(Self {
            config: server.clone(),
            rel_path: config.rel_path().to_path_buf(),
            auth,
            mailbox,
            resolver,
            tls_acceptor: OnceCell::new(),
            engine: CommandHandler::factory(),
            stats: Arc::new(ConnectionStats::new()),
            limiter,
        })
    }

    /// Replaces the protocol engine used for new sessions.
    pub fn with_engine(mut self, engine: Arc<dyn EngineFactory>) -> Self {
        self.engine = engine;
        self
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    pub fn policy(&self) -> &PolicySet {
        &self.config.policy_set
    }

    pub fn max_buffer_length(&self) -> i64 {
        self.config.maximum_buffer_length
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.config.idle_timeout()
    }

    /// How long one response write may stall before the session gives up.
    pub fn write_timeout(&self) -> Duration {
        self.idle_timeout().unwrap_or(DEFAULT_IO_TIMEOUT)
    }

    /// How long a client may take to complete the STARTTLS handshake.
    pub fn handshake_timeout(&self) -> Duration {
        self.idle_timeout().unwrap_or(DEFAULT_IO_TIMEOUT)
    }

    pub fn auth_backend(&self) -> Option<Arc<dyn AuthBackend>> {
        self.auth.clone()
    }

    pub fn mailbox_backend(&self) -> Option<Arc<dyn MailboxBackend>> {
        self.mailbox.clone()
    }

    /// The resolved resolver definition, if one is configured.
    pub fn resolver(&self) -> Option<&BackendConfig> {
        self.resolver.as_ref()
    }

    pub fn engine_factory(&self) -> &dyn EngineFactory {
        self.engine.as_ref()
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    /// Returns the TLS acceptor, loading the certificate on first use.
    ///
    /// Relative certificate paths are resolved against the configuration
    /// file's directory.
    pub async fn tls_acceptor(&self) -> Result<TlsAcceptor, TlsError> {
        let tls = &self.config.tls_config;
        if !tls.is_configured() {
            return Err(TlsError::NotConfigured);
        }

        self.tls_acceptor
            .get_or_try_init(|| async {
                let cert = resolve_path(&self.rel_path, &tls.cert_file);
                let key = resolve_path(&self.rel_path, &tls.key_file);
                debug!(cert = %cert.display(), key = %key.display(), "Loading TLS certificate");
                load_acceptor(&cert, &key)
            })
            .await
            .cloned()
    }

    /// Binds the configured address and serves until the listener fails.
    pub async fn listen(self: Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })?;
        info!(addr = %self.config.bind_addr, hostname = %self.config.hostname, "Binding to address");

        self.serve(listener).await;
        Ok(())
    }

    /// Main loop that accepts incoming connections.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let permit = match &self.limiter {
                        Some(limiter) => match Arc::clone(limiter).try_acquire_owned() {
                            Ok(permit) => Some(permit),
                            Err(_) => {
                                self.stats.connection_rejected();
                                warn!(client = %addr, "Connection limit reached, rejecting client");
                                tokio::spawn(reject(stream, addr));
                                continue;
                            }
                        },
                        None => None,
                    };

                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        handle_connection(stream, addr, server).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn reject(mut stream: TcpStream, addr: SocketAddr) {
    let bye = Response::status(Status::Bye, "Too many connections").serialize();
    if let Err(e) = stream.write_all(&bye).await {
        debug!(client = %addr, error = %e, "Failed to send rejection");
    }
    let _ = stream.shutdown().await;
}

/// Starts every configured server and waits for all of them.
///
/// A server that fails to start is logged and does not affect the others.
pub async fn run_servers(config: Arc<Config>) {
    let mut handles = Vec::with_capacity(config.servers.len());

    for (index, server_config) in config.servers.iter().enumerate() {
        let config = Arc::clone(&config);
        let server_config = server_config.clone();

        handles.push(tokio::spawn(async move {
            let server = match Server::new(&config, &server_config) {
                Ok(server) => Arc::new(server),
                Err(e) => {
                    error!(server = index, addr = %server_config.bind_addr, error = %e, "Error creating server");
                    return;
                }
            };
            if let Err(e) = server.listen().await {
                error!(server = index, error = %e, "Server stopped");
            }
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Server task failed");
        }
    }
}
