//! Mailbox Backend
//!
//! Mail storage lives behind this trait. The session reaches it through
//! its hooks for `LIST` and `CREATE`; the built-in `local` backend keeps
//! per-user mailbox names in memory, with an implicit `INBOX`.

use crate::backends::{BackendConfig, BackendError, Identity};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::RwLock;
use thiserror::Error;

/// Every user owns this mailbox
pub const INBOX: &str = "INBOX";

/// Errors a mailbox backend can report.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MailboxError {
    #[error("mailbox '{0}' already exists")]
    AlreadyExists(String),

    #[error("invalid mailbox name '{0}'")]
    InvalidName(String),

    #[error("mailbox storage unavailable")]
    Unavailable,
}

/// Mailbox storage capability.
pub trait MailboxBackend: Send + Sync + fmt::Debug {
    /// Mailbox names visible to `identity`, sorted.
    fn list(&self, identity: &Identity) -> Vec<String>;

    fn create(&self, identity: &Identity, name: &str) -> Result<(), MailboxError>;
}

/// In-memory mailbox registry.
#[derive(Debug, Default)]
pub struct LocalMailbox {
    mailboxes: RwLock<HashMap<String, BTreeSet<String>>>,
    /// Created for every user on first access
    defaults: Vec<String>,
}

impl LocalMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads an optional `Mailboxes` list of default mailbox names.
    pub fn from_config(config: &BackendConfig) -> Result<Self, BackendError> {
        let defaults = match config.data.get("Mailboxes") {
            None => Vec::new(),
            Some(Value::Array(names)) => names
                .iter()
                .map(|n| {
                    n.as_str().map(str::to_string).ok_or_else(|| {
                        BackendError::InvalidData("mailbox names must be strings".to_string())
                    })
                })
                .collect::<Result<_, _>>()?,
            Some(_) => {
                return Err(BackendError::InvalidData(
                    "Mailboxes must be an array".to_string(),
                ))
            }
        };

        Ok(Self {
            mailboxes: RwLock::new(HashMap::new()),
            defaults,
        })
    }

    fn is_inbox(name: &str) -> bool {
        name.eq_ignore_ascii_case(INBOX)
    }
}

impl MailboxBackend for LocalMailbox {
    fn list(&self, identity: &Identity) -> Vec<String> {
        let mailboxes = self.mailboxes.read().unwrap();
        let mut names: BTreeSet<String> = self.defaults.iter().cloned().collect();
        names.insert(INBOX.to_string());
        if let Some(owned) = mailboxes.get(&identity.username) {
            names.extend(owned.iter().cloned());
        }
        names.into_iter().collect()
    }

    fn create(&self, identity: &Identity, name: &str) -> Result<(), MailboxError> {
        if name.is_empty() || name.contains(['\r', '\n']) {
            return Err(MailboxError::InvalidName(name.to_string()));
        }
        if Self::is_inbox(name) || self.defaults.iter().any(|d| d == name) {
            return Err(MailboxError::AlreadyExists(name.to_string()));
        }

        let mut mailboxes = self.mailboxes.write().unwrap();
        let owned = mailboxes.entry(identity.username.clone()).or_default();
        if !owned.insert(name.to_string()) {
            return Err(MailboxError::AlreadyExists(name.to_string()));
        }
        Ok(())
    }
}
