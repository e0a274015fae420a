//! Session State and Engine Hooks
//!
//! [`SessionState`] is the part of a session shared with the protocol
//! engine: the remote address for logging, the write-once identity slot,
//! the auth and mailbox backend bridges, and the STARTTLS coordinator when
//! TLS is enabled by policy.

use crate::backends::{AuthBackend, Identity, MailboxBackend, MailboxError};
use crate::connection::tls::UpgradeCoordinator;
use crate::protocol::{SessionHooks, TlsRefusal, TlsRequest};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Session facts and capabilities handed to the engine.
#[derive(Debug)]
pub struct SessionState {
    addr: SocketAddr,
    auth: Option<Arc<dyn AuthBackend>>,
    mailbox: Option<Arc<dyn MailboxBackend>>,
    identity: OnceLock<Identity>,
    /// `None` when the policy disables TLS
    tls: Option<UpgradeCoordinator>,
    require_tls: bool,
}

impl SessionState {
    pub fn new(
        addr: SocketAddr,
        auth: Option<Arc<dyn AuthBackend>>,
        mailbox: Option<Arc<dyn MailboxBackend>>,
        tls_enabled: bool,
        require_tls: bool,
    ) -> Self {
        Self {
            addr,
            auth,
            mailbox,
            identity: OnceLock::new(),
            tls: tls_enabled.then(UpgradeCoordinator::new),
            require_tls: tls_enabled && require_tls,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The authenticated identity, once set.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.get()
    }

    /// The STARTTLS coordinator, if installed.
    pub fn coordinator(&self) -> Option<&UpgradeCoordinator> {
        self.tls.as_ref()
    }

    /// True while a requested upgrade has not completed.
    pub fn upgrade_pending(&self) -> bool {
        self.tls.as_ref().is_some_and(UpgradeCoordinator::is_pending)
    }
}

impl SessionHooks for SessionState {
    fn log(&self, message: fmt::Arguments<'_>) {
        debug!(client = %self.addr, "{}", message);
    }

    fn validate_auth(&self, mechanism: &str, args: &[String]) -> bool {
        let Some(auth) = &self.auth else {
            debug!(client = %self.addr, mechanism, "No auth backend configured");
            return false;
        };

        match auth.authenticate(mechanism, args) {
            Ok(Some(identity)) => {
                if self.identity.set(identity.clone()).is_err() {
                    warn!(client = %self.addr, "Session already authenticated");
                    return false;
                }
                info!(client = %self.addr, user = %identity, mechanism, "Authenticated");
                true
            }
            Ok(None) => {
                info!(client = %self.addr, mechanism, "Authentication rejected");
                false
            }
            Err(e) => {
                warn!(client = %self.addr, mechanism, error = %e, "error authenticating");
                false
            }
        }
    }

    fn mechanisms(&self) -> Vec<String> {
        self.auth
            .as_ref()
            .map(|auth| auth.mechanisms())
            .unwrap_or_default()
    }

    fn request_tls(&self) -> TlsRequest {
        match &self.tls {
            Some(coordinator) => {
                debug!(client = %self.addr, "STARTTLS requested");
                coordinator.request()
            }
            None => TlsRequest::Refused(TlsRefusal::Unavailable),
        }
    }

    fn tls_available(&self) -> bool {
        self.tls
            .as_ref()
            .is_some_and(|c| c.state() == crate::connection::tls::UpgradeState::Plain)
    }

    fn tls_required(&self) -> bool {
        self.require_tls
    }

    fn tls_active(&self) -> bool {
        self.tls.as_ref().is_some_and(UpgradeCoordinator::is_secure)
    }

    fn list_mailboxes(&self) -> Option<Vec<String>> {
        let identity = self.identity.get()?;
        self.mailbox.as_ref().map(|mailbox| mailbox.list(identity))
    }

    fn create_mailbox(&self, name: &str) -> Result<(), MailboxError> {
        let (Some(mailbox), Some(identity)) = (&self.mailbox, self.identity.get()) else {
            return Err(MailboxError::Unavailable);
        };
        mailbox.create(identity, name)?;
        info!(client = %self.addr, user = %identity, mailbox = name, "Mailbox created");
        Ok(())
    }
}
