//! IMAP Session Protocol Plumbing
//!
//! This module provides the pieces the session controller uses to turn a
//! byte stream into protocol lines and protocol output back into bytes.
//!
//! ## Modules
//!
//! - `types`: The `Response` value and its wire rendering
//! - `framer`: Incremental CRLF line framer with a buffer limit
//! - `engine`: The engine/session capability traits
//!
//! ## Example
//!
//! ```
//! use hogimap::protocol::{LineFramer, Response, Status};
//!
//! let mut framer = LineFramer::new(1024);
//! let lines = framer.push(b"A1 NOOP\r\n").unwrap();
//! assert_eq!(lines.len(), 1);
//!
//! let reply = Response::tagged("A1", Status::Ok, "NOOP completed");
//! assert_eq!(reply.serialize(), b"A1 OK NOOP completed\r\n");
//! ```

pub mod engine;
pub mod framer;
pub mod types;

// Re-export commonly used types for convenience
pub use engine::{
    response_channel, EngineContext, EngineFactory, Flow, ProtocolEngine, ResponseReceiver,
    ResponseSender, SessionHooks, TlsRefusal, TlsRequest, MAX_QUEUED_RESPONSES,
};
pub use framer::{FrameError, FrameResult, LineFramer, DEFAULT_MAX_BUFFER_LENGTH, READ_CHUNK_SIZE};
pub use types::{DoneCallback, Response, Status, CRLF, UNTAGGED};
