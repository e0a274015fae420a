//! IMAP Response Types
//!
//! This module defines the response value that flows from the protocol
//! engine to the response dispatcher.
//!
//! ## Wire Format
//!
//! Every IMAP server line is terminated with CRLF (`\r\n`) and starts with
//! one of three prefixes:
//! - `*` Untagged data or status (`* OK IMAP4rev1 Service Ready`)
//! - `<tag>` Tagged completion of a client command (`A1 OK NOOP completed`)
//! - `+` Continuation request (`+ `)
//!
//! A single [`Response`] may carry several lines, e.g. the untagged
//! `* CAPABILITY ...` data followed by the tagged `A1 OK` completion.
//! The dispatcher writes all of them before invoking the response's
//! completion callback.

use std::fmt;

/// The CRLF terminator used by IMAP
pub const CRLF: &str = "\r\n";

/// Tag used for responses that do not complete a client command
pub const UNTAGGED: &str = "*";

/// Callback fired once a response has been fully written to the peer.
pub type DoneCallback = Box<dyn FnOnce() + Send + 'static>;

/// IMAP status condition carried by status responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
    Preauth,
    Bye,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::No => "NO",
            Status::Bad => "BAD",
            Status::Preauth => "PREAUTH",
            Status::Bye => "BYE",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol response produced by the engine.
///
/// Holds one or more already-terminated protocol lines plus an optional
/// completion callback.
///
/// # Example
/// ```
/// use hogimap::protocol::types::{Response, Status};
/// let response = Response::untagged("CAPABILITY IMAP4rev1")
///     .then_tagged("A1", Status::Ok, "CAPABILITY completed");
/// assert_eq!(
///     response.serialize(),
///     b"* CAPABILITY IMAP4rev1\r\nA1 OK CAPABILITY completed\r\n"
/// );
/// ```
#[derive(Default)]
pub struct Response {
    lines: Vec<String>,
    done: Option<DoneCallback>,
}

impl Response {
    /// Creates an empty response.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tagged status response: `<tag> <status> <text>\r\n`.
    pub fn tagged(tag: &str, status: Status, text: impl fmt::Display) -> Self {
        Self::new().then_tagged(tag, status, text)
    }

    /// Creates an untagged response: `* <text>\r\n`.
    pub fn untagged(text: impl fmt::Display) -> Self {
        Self::new().then_untagged(text)
    }

    /// Creates an untagged status response: `* <status> <text>\r\n`.
    pub fn status(status: Status, text: impl fmt::Display) -> Self {
        Self::tagged(UNTAGGED, status, text)
    }

    /// Creates a continuation request: `+ <text>\r\n`.
    pub fn continuation(text: impl fmt::Display) -> Self {
        Self::new().then_line(format_args!("+ {}", text))
    }

    /// Creates a `BAD` response describing an error.
    ///
    /// Use [`UNTAGGED`] as the tag when the command could not be parsed.
    pub fn error(tag: &str, err: impl fmt::Display) -> Self {
        Self::tagged(tag, Status::Bad, err)
    }

    /// Appends a tagged status line.
    pub fn then_tagged(self, tag: &str, status: Status, text: impl fmt::Display) -> Self {
        self.then_line(format_args!("{} {} {}", tag, status, text))
    }

    /// Appends an untagged line.
    pub fn then_untagged(self, text: impl fmt::Display) -> Self {
        self.then_line(format_args!("{} {}", UNTAGGED, text))
    }

    fn then_line(mut self, line: fmt::Arguments<'_>) -> Self {
        let mut line = line.to_string();
        line.push_str(CRLF);
        self.lines.push(line);
        self
    }

    /// Attaches a completion callback, fired after the lines are written.
    pub fn with_done(mut self, done: DoneCallback) -> Self {
        self.done = Some(done);
        self
    }

    /// The rendered lines, each terminated with CRLF.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Detaches the completion callback, if any.
    pub fn take_done(&mut self) -> Option<DoneCallback> {
        self.done.take()
    }

    pub fn has_done(&self) -> bool {
        self.done.is_some()
    }

    /// Total number of bytes in the rendered lines.
    pub fn len(&self) -> usize {
        self.lines.iter().map(String::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Serializes all lines into one contiguous buffer.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.len());
        for line in &self.lines {
            buf.extend_from_slice(line.as_bytes());
        }
        buf
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("lines", &self.lines)
            .field("done", &self.done.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

/// Escapes CR and LF so protocol lines fit on one log line.
pub fn escape_line(text: &str) -> String {
    text.replace('\r', "\\r").replace('\n', "\\n")
}
