//! Command Handler Module
//!
//! This module implements the built-in IMAP engine. It receives complete
//! command lines from the session controller, executes them against the
//! session hooks, and emits responses onto the session's response stream.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  LineFramer     │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! │                 │
//! │  - Tokenize     │
//! │  - Dispatch     │
//! │  - Execute      │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ SessionHooks    │  (auth backend, STARTTLS coordinator)
//! └─────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! - `CAPABILITY`, `NOOP`, `LOGOUT`
//! - `STARTTLS`
//! - `LOGIN`, `AUTHENTICATE`

pub mod handler;

// Re-export the main command handler
pub use handler::CommandHandler;
