//! # Hogimap - The Per-Connection Session Layer of an IMAP Server
//!
//! Hogimap accepts TCP clients, frames their CRLF-terminated command lines,
//! drives a protocol engine with them, writes the engine's responses back in
//! order, and upgrades the connection to TLS in place on STARTTLS.
//!
//! ## Features
//!
//! - **Safe STARTTLS**: Plaintext sent after STARTTLS never reaches the engine
//! - **Ordered Output**: One dispatcher task per session writes every response
//!   in order and fires completion callbacks after the bytes are flushed
//! - **Bounded Buffers**: A partial line longer than `MaximumBufferLength`
//!   ends the session with a protocol error
//! - **Backpressure**: A client that stops reading stops being read, and a
//!   write that stalls past its timeout ends the session
//! - **Pluggable Backends**: Auth and mailbox backends are referenced by name
//!   from a shared registry in the configuration file
//! - **Async I/O**: Built on Tokio, one pair of tasks per client
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Hogimap                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │   Server    │───>│ Connection  │───>│  Command    │                  │
//! │  │ (Listener)  │    │  Handler    │    │  Handler    │                  │
//! │  └──────┬──────┘    └──────┬──────┘    └──────┬──────┘                  │
//! │         │                  │                  │ SessionHooks            │
//! │         ▼                  ▼                  ▼                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │  Backend    │    │  Response   │    │   Upgrade   │                  │
//! │  │  Registry   │    │ Dispatcher  │    │ Coordinator │                  │
//! │  └─────────────┘    └─────────────┘    └─────────────┘                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use hogimap::config::Config;
//! use hogimap::server::run_servers;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::load("config.json").unwrap();
//!     run_servers(Arc::new(config)).await;
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: Line framer, response values and the engine traits
//! - [`connection`]: Session controller, dispatcher and STARTTLS handling
//! - [`commands`]: The built-in IMAP command engine
//! - [`backends`]: Backend registry, auth and mailbox backends
//! - [`config`]: JSON configuration
//! - [`server`]: Listeners and connection admission

pub mod backends;
pub mod commands;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod server;

// Re-export commonly used types for convenience
pub use commands::CommandHandler;
pub use config::{Config, ConfigError, PolicySet, ServerConfig};
pub use connection::{handle_connection, ConnectionStats};
pub use protocol::{LineFramer, ProtocolEngine, Response, SessionHooks, Status};
pub use server::{run_servers, Server, ServerError};

/// The address a server binds to when none is configured
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:143";

/// The hostname announced when none is configured
pub const DEFAULT_HOSTNAME: &str = "mailhog.example";

/// Version of Hogimap
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
