//! Auth Backend
//!
//! Credential validation behind a small trait, plus the built-in `local`
//! backend that checks against a fixed user table.
//!
//! The `local` backend reads its users from either an inline `Users` map
//! in the backend `Data`, or a JSON file named by `Data.config`
//! (`{"alice": "secret"}`), relative to the configuration file directory.

use crate::backends::{resolve_path, BackendConfig, BackendError};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// SASL PLAIN
pub const MECHANISM_PLAIN: &str = "PLAIN";

/// The IMAP `LOGIN` command (username, password)
pub const MECHANISM_LOGIN: &str = "LOGIN";

/// An authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub username: String,
}

impl Identity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.username)
    }
}

/// Errors an auth backend can report.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("unsupported mechanism '{0}'")]
    UnsupportedMechanism(String),

    #[error("malformed credentials: {0}")]
    MalformedCredentials(&'static str),

    #[error("backend failure: {0}")]
    Backend(String),
}

/// Validates credential exchanges.
pub trait AuthBackend: Send + Sync + fmt::Debug {
    /// `Ok(Some(identity))` on success, `Ok(None)` on rejection.
    fn authenticate(&self, mechanism: &str, args: &[String]) -> Result<Option<Identity>, AuthError>;

    /// Mechanisms advertised to clients.
    fn mechanisms(&self) -> Vec<String>;
}

/// User table backed auth.
#[derive(Debug, Default)]
pub struct LocalAuth {
    users: HashMap<String, String>,
}

impl LocalAuth {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    /// Builds the backend from its configuration data.
    pub fn from_config(config: &BackendConfig, rel_path: &Path) -> Result<Self, BackendError> {
        if let Some(users) = config.data.get("Users") {
            return Ok(Self::new(parse_users(users)?));
        }

        let Some(file) = config.data_str("config") else {
            warn!("local auth backend has no users configured");
            return Ok(Self::default());
        };

        let path = resolve_path(rel_path, file);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "auth file not found, no users configured");
                return Ok(Self::default());
            }
            Err(source) => return Err(BackendError::Io { path, source }),
        };
        let value: serde_json::Value = serde_json::from_str(&contents)
            .map_err(|source| BackendError::Parse { path: path.clone(), source })?;

        let users = parse_users(&value)?;
        debug!(path = %path.display(), users = users.len(), "Loaded local auth users");
        Ok(Self::new(users))
    }

    fn check(&self, username: &str, password: &str) -> Option<Identity> {
        match self.users.get(username) {
            Some(expected) if expected == password => Some(Identity::new(username)),
            _ => None,
        }
    }

    fn authenticate_plain(&self, args: &[String]) -> Result<Option<Identity>, AuthError> {
        let encoded = args
            .first()
            .ok_or(AuthError::MalformedCredentials("missing PLAIN response"))?;
        let decoded = BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|_| AuthError::MalformedCredentials("invalid base64"))?;

        // authzid NUL authcid NUL passwd
        let mut parts = decoded.split(|b| *b == 0);
        let (Some(_authzid), Some(user), Some(pass), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::MalformedCredentials("expected three PLAIN fields"));
        };

        let user = std::str::from_utf8(user)
            .map_err(|_| AuthError::MalformedCredentials("username is not UTF-8"))?;
        let pass = std::str::from_utf8(pass)
            .map_err(|_| AuthError::MalformedCredentials("password is not UTF-8"))?;
        Ok(self.check(user, pass))
    }
}

fn parse_users(value: &serde_json::Value) -> Result<HashMap<String, String>, BackendError> {
    let object = value
        .as_object()
        .ok_or_else(|| BackendError::InvalidData("users must be an object".to_string()))?;

    object
        .iter()
        .map(|(user, pass)| match pass.as_str() {
            Some(pass) => Ok((user.clone(), pass.to_string())),
            None => Err(BackendError::InvalidData(format!(
                "password for '{}' must be a string",
                user
            ))),
        })
        .collect()
}

impl AuthBackend for LocalAuth {
    fn authenticate(&self, mechanism: &str, args: &[String]) -> Result<Option<Identity>, AuthError> {
        match mechanism.to_ascii_uppercase().as_str() {
            MECHANISM_PLAIN => self.authenticate_plain(args),
            MECHANISM_LOGIN => match args {
                [user, pass] => Ok(self.check(user, pass)),
                _ => Err(AuthError::MalformedCredentials("LOGIN takes a username and password")),
            },
            other => Err(AuthError::UnsupportedMechanism(other.to_string())),
        }
    }

    fn mechanisms(&self) -> Vec<String> {
        vec![MECHANISM_PLAIN.to_string()]
    }
}
