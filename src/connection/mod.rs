//! Connection Handler Module
//!
//! This module manages individual IMAP client sessions. Each accepted
//! connection gets its own session: a read loop task and a response
//! dispatcher task, sharing the transport through split halves.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener                            │
//! │                    (server.rs)                              │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ accept() + admission
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │ Read bytes  │───>│ Frame lines │───>│ Engine      │     │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘     │
//! │         ▲                                     │ Response    │
//! │         │ STARTTLS swap                       ▼             │
//! │  ┌──────┴──────┐                     ┌─────────────────┐    │
//! │  │ Upgrade     │<── go-ahead flushed │ Dispatcher task │    │
//! │  │ Coordinator │                     └─────────────────┘    │
//! │  └─────────────┘                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `handler`: The session controller and connection statistics
//! - `dispatcher`: Ordered response writer with completion callbacks
//! - `session`: State shared with the engine through `SessionHooks`
//! - `stream`: Plain/TLS transport enum
//! - `tls`: STARTTLS state machine and acceptor loading

pub mod dispatcher;
pub mod handler;
pub mod session;
pub mod stream;
pub mod tls;

// Re-export commonly used types
pub use dispatcher::{ResponseDispatcher, TransportGate, WriterSlot};
pub use handler::{handle_connection, ConnectionError, ConnectionHandler, ConnectionStats};
pub use session::SessionState;
pub use stream::SessionStream;
pub use tls::{load_acceptor, TlsError, UpgradeCoordinator, UpgradeState};
