//! Configuration Module
//!
//! The process configuration is a JSON file with two top-level keys:
//!
//! ```text
//! {
//!   "Servers": [
//!     {
//!       "BindAddr": "0.0.0.0:143",
//!       "Hostname": "mailhog.example",
//!       "PolicySet": { "DisableTLS": false, "RequireTLS": true, "MaximumConnections": 1000 },
//!       "Backends": { "Auth": { "Ref": "local_auth" }, "Mailbox": { "Ref": "local_mailbox" } },
//!       "TLSConfig": { "CertFile": "cert.pem", "KeyFile": "key.pem" }
//!     }
//!   ],
//!   "Backends": {
//!     "local_auth": { "Type": "local", "Data": { "config": "auth.json" } }
//!   }
//! }
//! ```
//!
//! The file is loaded on top of [`Config::default`]: a `Servers` array
//! replaces the default servers, while `Backends` entries are merged into
//! the default registry. The configuration is built once at startup and
//! passed by reference; nothing here is global.

use crate::backends::{BackendConfig, BackendRegistry};
use crate::protocol::DEFAULT_MAX_BUFFER_LENGTH;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Error reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported file type: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("Error parsing JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::Read { .. } => 1,
            ConfigError::UnsupportedFormat(_) => 2,
            ConfigError::Parse { .. } => 3,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory of the loaded file, for resolving relative paths
    #[serde(skip)]
    rel_path: PathBuf,

    #[serde(rename = "Servers", default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<ServerConfig>,

    #[serde(rename = "Backends", default, skip_serializing_if = "BackendRegistry::is_empty")]
    pub backends: BackendRegistry,
}

/// Configuration of one bind address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(rename = "BindAddr", default)]
    pub bind_addr: String,

    #[serde(rename = "Hostname", default)]
    pub hostname: String,

    #[serde(rename = "PolicySet", default)]
    pub policy_set: PolicySet,

    #[serde(rename = "Backends", default)]
    pub backends: ServerBackends,

    #[serde(rename = "TLSConfig", default)]
    pub tls_config: TlsConfig,

    /// Seconds a session may wait for client input; absent means forever
    #[serde(rename = "IdleTimeout", default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<u64>,

    /// Partial-line buffer limit per session; -1 disables the limit
    #[serde(rename = "MaximumBufferLength", default = "default_max_buffer_length")]
    pub maximum_buffer_length: i64,
}

fn default_max_buffer_length() -> i64 {
    DEFAULT_MAX_BUFFER_LENGTH
}

/// Policies applied per server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySet {
    /// Disables the STARTTLS command
    #[serde(rename = "DisableTLS")]
    pub disable_tls: bool,

    /// Requires STARTTLS before any other command except CAPABILITY,
    /// NOOP and LOGOUT
    #[serde(rename = "RequireTLS")]
    pub require_tls: bool,

    /// Maximum concurrent connections; 0 means unlimited
    #[serde(rename = "MaximumConnections")]
    pub maximum_connections: usize,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            disable_tls: false,
            require_tls: true,
            maximum_connections: 1000,
        }
    }
}

impl PolicySet {
    /// Whether the STARTTLS coordinator is installed.
    pub fn tls_enabled(&self) -> bool {
        !self.disable_tls
    }

    /// Whether TLS is required. Disabling TLS takes precedence.
    pub fn tls_required(&self) -> bool {
        self.tls_enabled() && self.require_tls
    }
}

/// Backend slots of a server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerBackends {
    #[serde(rename = "Auth", default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<BackendConfig>,

    #[serde(rename = "Mailbox", default, skip_serializing_if = "Option::is_none")]
    pub mailbox: Option<BackendConfig>,

    #[serde(rename = "Resolver", default, skip_serializing_if = "Option::is_none")]
    pub resolver: Option<BackendConfig>,
}

/// Certificate material for STARTTLS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(rename = "CertFile", default, skip_serializing_if = "String::is_empty")]
    pub cert_file: String,

    #[serde(rename = "KeyFile", default, skip_serializing_if = "String::is_empty")]
    pub key_file: String,
}

impl TlsConfig {
    pub fn is_configured(&self) -> bool {
        !self.cert_file.is_empty() && !self.key_file.is_empty()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: crate::DEFAULT_BIND_ADDR.to_string(),
            hostname: crate::DEFAULT_HOSTNAME.to_string(),
            policy_set: PolicySet::default(),
            backends: ServerBackends::default(),
            tls_config: TlsConfig::default(),
            idle_timeout: None,
            maximum_buffer_length: DEFAULT_MAX_BUFFER_LENGTH,
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout.map(Duration::from_secs)
    }
}

impl Default for Config {
    /// A default (but relatively useless) configuration.
    fn default() -> Self {
        let mut backends = BackendRegistry::new();
        let mut auth_data = serde_json::Map::new();
        auth_data.insert("config".to_string(), "auth.json".into());
        backends.insert(
            "local_auth".to_string(),
            BackendConfig::inline("local", auth_data),
        );
        backends.insert(
            "local_mailbox".to_string(),
            BackendConfig::inline("local", serde_json::Map::new()),
        );

        Self {
            rel_path: PathBuf::new(),
            servers: vec![ServerConfig {
                backends: ServerBackends {
                    auth: Some(BackendConfig::reference("local_auth")),
                    mailbox: Some(BackendConfig::reference("local_mailbox")),
                    resolver: None,
                },
                ..Default::default()
            }],
            backends,
        }
    }
}

/// Partial view used to layer a file over the defaults.
#[derive(Deserialize)]
struct ConfigFile {
    #[serde(rename = "Servers")]
    servers: Option<Vec<ServerConfig>>,
    #[serde(rename = "Backends", default)]
    backends: BackendRegistry,
}

impl Config {
    /// Loads a configuration file over the defaults.
    ///
    /// Only `.json` files are supported.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            return Err(ConfigError::UnsupportedFormat(path.to_path_buf()));
        }

        let mut config = Self::from_json(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.rel_path = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(config)
    }

    /// Parses JSON text over the defaults.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let file: ConfigFile = serde_json::from_str(text)?;
        let mut config = Self::default();
        if let Some(servers) = file.servers {
            config.servers = servers;
        }
        config.backends.extend(file.backends);
        Ok(config)
    }

    /// Directory of the configuration file, used for relative paths.
    pub fn rel_path(&self) -> &Path {
        &self.rel_path
    }

    /// Pretty JSON rendering of the effective configuration.
    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}
