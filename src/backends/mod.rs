//! Backend Module
//!
//! Servers name their auth, mailbox and resolver backends in the
//! configuration file. Each slot holds either an inline definition
//! (`Type` plus an opaque `Data` map) or a `Ref` to an entry in the
//! process-wide `Backends` registry.
//!
//! ## Startup Flow
//!
//! ```text
//!  ServerConfig.Backends.Auth ──resolve(registry)──> BackendConfig ──load_auth()──> Arc<dyn AuthBackend>
//! ```
//!
//! Resolution is a single level of indirection. A registry entry that is
//! itself a reference fails with `UnresolvedReference` instead of being
//! followed.
//!
//! ## Example
//!
//! ```
//! use hogimap::backends::{BackendConfig, BackendRegistry};
//!
//! let mut registry = BackendRegistry::new();
//! registry.insert("local_auth".into(), BackendConfig::inline("local", Default::default()));
//!
//! let resolved = BackendConfig::reference("local_auth").resolve(&registry).unwrap();
//! assert_eq!(resolved.kind, "local");
//!
//! assert!(BackendConfig::reference("missing").resolve(&registry).is_err());
//! ```

pub mod auth;
pub mod mailbox;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

// Re-export commonly used types
pub use auth::{AuthBackend, AuthError, Identity, LocalAuth};
pub use mailbox::{LocalMailbox, MailboxBackend, MailboxError};

/// Backend type name for the built-in backends
pub const LOCAL_BACKEND: &str = "local";

/// Named backend definitions shared by every server
pub type BackendRegistry = BTreeMap<String, BackendConfig>;

/// A backend slot: inline definition or named reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(rename = "Type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,

    #[serde(rename = "Data", default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,

    #[serde(rename = "Ref", default, skip_serializing_if = "String::is_empty")]
    pub reference: String,
}

/// Errors raised while resolving backend references.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unresolved backend reference '{name}': {reason}")]
    UnresolvedReference { name: String, reason: &'static str },
}

/// Errors raised while constructing a backend from its definition.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unknown {slot} backend type '{kind}'")]
    UnknownType { slot: &'static str, kind: String },

    #[error("invalid backend data: {0}")]
    InvalidData(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl BackendConfig {
    /// Creates an inline backend definition.
    pub fn inline(kind: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            data,
            reference: String::new(),
        }
    }

    /// Creates a reference to a registry entry.
    pub fn reference(name: impl Into<String>) -> Self {
        Self {
            reference: name.into(),
            ..Default::default()
        }
    }

    /// A non-empty `Ref` takes precedence over any inline fields.
    pub fn is_reference(&self) -> bool {
        !self.reference.is_empty()
    }

    /// Resolves this slot against the registry.
    pub fn resolve(&self, registry: &BackendRegistry) -> Result<BackendConfig, ResolveError> {
        if !self.is_reference() {
            return Ok(self.clone());
        }

        match registry.get(&self.reference) {
            None => Err(ResolveError::UnresolvedReference {
                name: self.reference.clone(),
                reason: "not present in the backend registry",
            }),
            Some(entry) if entry.is_reference() => Err(ResolveError::UnresolvedReference {
                name: self.reference.clone(),
                reason: "chained references are not supported",
            }),
            Some(entry) => Ok(entry.clone()),
        }
    }

    /// Looks up a string value in `Data`.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Resolves relative file names in backend data against the config directory.
pub(crate) fn resolve_path(rel_path: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        rel_path.join(path)
    }
}

/// Instantiates an auth backend from a resolved definition.
pub fn load_auth(
    config: &BackendConfig,
    rel_path: &Path,
) -> Result<Arc<dyn AuthBackend>, BackendError> {
    match config.kind.as_str() {
        LOCAL_BACKEND => Ok(Arc::new(LocalAuth::from_config(config, rel_path)?)),
        other => Err(BackendError::UnknownType {
            slot: "auth",
            kind: other.to_string(),
        }),
    }
}

/// Instantiates a mailbox backend from a resolved definition.
pub fn load_mailbox(config: &BackendConfig) -> Result<Arc<dyn MailboxBackend>, BackendError> {
    match config.kind.as_str() {
        LOCAL_BACKEND => Ok(Arc::new(LocalMailbox::from_config(config)?)),
        other => Err(BackendError::UnknownType {
            slot: "mailbox",
            kind: other.to_string(),
        }),
    }
}
