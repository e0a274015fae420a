//! Command Handler Module
//!
//! A minimal IMAP4rev1 engine: enough of the protocol to greet a client,
//! negotiate STARTTLS, authenticate, and list or create mailboxes.
//! Everything that would touch mailbox contents is answered with `NO`.
//!
//! ## Supported Commands
//!
//! - `CAPABILITY` - Advertise capabilities
//! - `NOOP` - Do nothing
//! - `LOGOUT` - End the session
//! - `STARTTLS` - Upgrade to TLS
//! - `LOGIN user pass` - Plaintext login
//! - `AUTHENTICATE mech [initial-response]` - SASL authentication
//! - `LIST reference pattern` - List mailboxes (`*` and `%` wildcards)
//! - `CREATE mailbox` - Create a mailbox
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CommandHandler                          │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │ tokenize()  │───>│  dispatch() │───>│  cmd_*()    │     │
//! │  └─────────────┘    └─────────────┘    └─────────────┘     │
//! │                                               │             │
//! │                                               ▼             │
//! │                                      SessionHooks           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::backends::mailbox::INBOX;
use crate::protocol::{
    EngineContext, EngineFactory, Flow, ProtocolEngine, Response, ResponseSender, SessionHooks,
    Status, TlsRequest, UNTAGGED,
};
use std::sync::Arc;

/// Mailbox hierarchy delimiter
const DELIMITER: char = '/';

/// Commands allowed before STARTTLS when the policy requires TLS
const PRE_TLS_COMMANDS: &[&str] = &["CAPABILITY", "NOOP", "LOGOUT", "STARTTLS"];

/// IMAP4rev1 commands this engine recognises but does not implement
const UNIMPLEMENTED_COMMANDS: &[&str] = &[
    "SELECT", "EXAMINE", "DELETE", "RENAME", "SUBSCRIBE", "UNSUBSCRIBE", "LSUB", "STATUS", "APPEND", "CHECK", "CLOSE", "EXPUNGE", "SEARCH", "FETCH", "STORE", "COPY",
    "UID", "IDLE",
];

/// An `AUTHENTICATE` waiting for the client's continuation line.
#[derive(Debug)]
struct PendingAuth {
    tag: String,
    mechanism: String,
}

/// Handles IMAP commands for one session.
pub struct CommandHandler {
    hostname: String,
    responses: ResponseSender,
    hooks: Arc<dyn SessionHooks>,
    authenticated: bool,
    pending_auth: Option<PendingAuth>,
    /// Set between the STARTTLS go-ahead and the handshake outcome
    tls_pending: bool,
}

impl CommandHandler {
    /// Creates a command handler for one session.
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            hostname: ctx.hostname,
            responses: ctx.responses,
            hooks: ctx.hooks,
            authenticated: false,
            pending_auth: None,
            tls_pending: false,
        }
    }

    /// The factory servers use unless told otherwise.
    pub fn factory() -> Arc<dyn EngineFactory> {
        Arc::new(|ctx: EngineContext| -> Box<dyn ProtocolEngine> {
            Box::new(CommandHandler::new(ctx))
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    fn send(&self, response: Response) {
        if self.responses.send(response).is_err() {
            self.hooks
                .log(format_args!("response stream closed, reply dropped"));
        }
    }

    /// Dispatches a command to its handler.
    fn dispatch(&mut self, tag: &str, cmd: &str, args: &[String]) -> Flow {
        if self.hooks.tls_required()
            && !self.hooks.tls_active()
            && !PRE_TLS_COMMANDS.contains(&cmd)
        {
            self.send(Response::tagged(tag, Status::Bad, "STARTTLS required"));
            return Flow::Continue;
        }

        match cmd {
            "CAPABILITY" => self.cmd_capability(tag),
            "NOOP" => self.send(Response::tagged(tag, Status::Ok, "NOOP completed")),
            "LOGOUT" => {
                self.send(
                    Response::status(Status::Bye, format!("{} logging out", self.hostname))
                        .then_tagged(tag, Status::Ok, "LOGOUT completed"),
                );
                return Flow::Close;
            }
            "STARTTLS" => self.cmd_starttls(tag),
            "LOGIN" => self.cmd_login(tag, args),
            "AUTHENTICATE" => self.cmd_authenticate(tag, args),
            "LIST" => self.cmd_list(tag, args),
            "CREATE" => self.cmd_create(tag, args),
            _ if UNIMPLEMENTED_COMMANDS.contains(&cmd) => {
                self.send(Response::tagged(
                    tag,
                    Status::No,
                    format!("{} not supported", cmd),
                ));
            }
            _ => self.send(Response::tagged(tag, Status::Bad, "Unknown command")),
        }

        Flow::Continue
    }

    /// Capabilities as currently offered.
    fn capabilities(&self) -> String {
        let mut caps = vec!["IMAP4rev1".to_string()];
        if self.hooks.tls_available() {
            caps.push("STARTTLS".to_string());
        }
        if self.hooks.tls_required() && !self.hooks.tls_active() {
            caps.push("LOGINDISABLED".to_string());
        } else if !self.authenticated {
            caps.extend(
                self.hooks
                    .mechanisms()
                    .into_iter()
                    .map(|mech| format!("AUTH={}", mech)),
            );
        }
        caps.join(" ")
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn cmd_capability(&self, tag: &str) {
        self.send(
            Response::untagged(format_args!("CAPABILITY {}", self.capabilities()))
                .then_tagged(tag, Status::Ok, "CAPABILITY completed"),
        );
    }

    fn cmd_starttls(&mut self, tag: &str) {
        match self.hooks.request_tls() {
            TlsRequest::Proceed(done) => {
                self.tls_pending = true;
                self.send(
                    Response::tagged(tag, Status::Ok, "Begin TLS negotiation now").with_done(done),
                );
            }
            TlsRequest::Refused(reason) => {
                self.send(Response::tagged(tag, Status::Bad, reason));
            }
        }
    }

    /// LOGIN username password
    fn cmd_login(&mut self, tag: &str, args: &[String]) {
        if self.authenticated {
            self.send(Response::tagged(tag, Status::Bad, "Already authenticated"));
            return;
        }
        if args.len() != 2 {
            self.send(Response::tagged(
                tag,
                Status::Bad,
                "LOGIN expects a username and password",
            ));
            return;
        }

        self.finish_auth(tag, "LOGIN", "LOGIN", args);
    }

    /// AUTHENTICATE mechanism [initial-response]
    fn cmd_authenticate(&mut self, tag: &str, args: &[String]) {
        if self.authenticated {
            self.send(Response::tagged(tag, Status::Bad, "Already authenticated"));
            return;
        }

        let (mechanism, initial) = match args {
            [mechanism] => (mechanism.to_ascii_uppercase(), None),
            [mechanism, initial] => (mechanism.to_ascii_uppercase(), Some(initial)),
            _ => {
                self.send(Response::tagged(
                    tag,
                    Status::Bad,
                    "AUTHENTICATE expects a mechanism",
                ));
                return;
            }
        };

        if !self
            .hooks
            .mechanisms()
            .iter()
            .any(|m| m.eq_ignore_ascii_case(&mechanism))
        {
            self.send(Response::tagged(
                tag,
                Status::No,
                "Unsupported authentication mechanism",
            ));
            return;
        }

        match initial {
            Some(initial) => {
                self.finish_auth(tag, "AUTHENTICATE", &mechanism, std::slice::from_ref(initial))
            }
            None => {
                self.pending_auth = Some(PendingAuth {
                    tag: tag.to_string(),
                    mechanism,
                });
                self.send(Response::continuation(""));
            }
        }
    }

    /// Continuation line of a pending AUTHENTICATE.
    fn continue_auth(&mut self, pending: PendingAuth, line: &str) {
        if line == "*" {
            self.send(Response::tagged(
                &pending.tag,
                Status::Bad,
                "AUTHENTICATE cancelled",
            ));
            return;
        }
        self.finish_auth(
            &pending.tag,
            "AUTHENTICATE",
            &pending.mechanism,
            &[line.to_string()],
        );
    }

    /// LIST reference pattern
    fn cmd_list(&self, tag: &str, args: &[String]) {
        let [reference, pattern] = args else {
            self.send(Response::tagged(
                tag,
                Status::Bad,
                "LIST expects a reference and a mailbox pattern",
            ));
            return;
        };
        if !self.authenticated {
            self.send(Response::tagged(tag, Status::No, "Not authenticated"));
            return;
        }

        // An empty pattern asks for the hierarchy delimiter only
        if pattern.is_empty() {
            self.send(
                Response::untagged(format_args!("LIST (\\Noselect) \"{}\" \"\"", DELIMITER))
                    .then_tagged(tag, Status::Ok, "LIST completed"),
            );
            return;
        }

        let Some(mailboxes) = self.hooks.list_mailboxes() else {
            self.send(Response::tagged(tag, Status::No, "Mailbox storage unavailable"));
            return;
        };

        let full = format!("{}{}", reference, pattern);
        let response = mailboxes
            .iter()
            .filter(|name| mailbox_matches(&full, name))
            .fold(Response::new(), |response, name| {
                response.then_untagged(format_args!("LIST () \"{}\" {}", DELIMITER, quote(name)))
            });
        self.send(response.then_tagged(tag, Status::Ok, "LIST completed"));
    }

    /// CREATE mailbox
    fn cmd_create(&self, tag: &str, args: &[String]) {
        let [name] = args else {
            self.send(Response::tagged(tag, Status::Bad, "CREATE expects a mailbox name"));
            return;
        };
        if !self.authenticated {
            self.send(Response::tagged(tag, Status::No, "Not authenticated"));
            return;
        }

        let name = name.trim_end_matches(DELIMITER);
        match self.hooks.create_mailbox(name) {
            Ok(()) => self.send(Response::tagged(tag, Status::Ok, "CREATE completed")),
            Err(e) => self.send(Response::tagged(tag, Status::No, e)),
        }
    }

    fn finish_auth(&mut self, tag: &str, command: &str, mechanism: &str, args: &[String]) {
        if self.hooks.validate_auth(mechanism, args) {
            self.authenticated = true;
            self.send(Response::tagged(
                tag,
                Status::Ok,
                format!("{} completed", command),
            ));
        } else {
            self.send(Response::tagged(
                tag,
                Status::No,
                format!("{} failed", command),
            ));
        }
    }
}

impl ProtocolEngine for CommandHandler {
    fn start(&mut self) -> Response {
        Response::status(
            Status::Ok,
            format!("[CAPABILITY {}] {} IMAP4rev1 service ready", self.capabilities(), self.hostname),
        )
    }

    fn handle_line(&mut self, line: &str) -> Flow {
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some(pending) = self.pending_auth.take() {
            self.continue_auth(pending, line);
            return Flow::Continue;
        }

        if self.tls_pending {
            self.hooks
                .log(format_args!("line received while TLS negotiation pending"));
            return Flow::Continue;
        }

        let tokens = match tokenize(line) {
            Ok(tokens) => tokens,
            Err(reason) => {
                let tag = line.split(' ').next().filter(|t| !t.is_empty());
                self.send(Response::tagged(tag.unwrap_or(UNTAGGED), Status::Bad, reason));
                return Flow::Continue;
            }
        };

        match tokens.as_slice() {
            [] => {
                self.send(Response::error(UNTAGGED, "Empty command line"));
                Flow::Continue
            }
            [tag] => {
                self.send(Response::tagged(tag, Status::Bad, "Missing command"));
                Flow::Continue
            }
            [tag, cmd, args @ ..] => {
                let cmd = cmd.to_ascii_uppercase();
                self.hooks.log(format_args!("command {} {}", tag, cmd));
                self.dispatch(tag, &cmd, args)
            }
        }
    }

    fn tls_completed(&mut self, ok: bool) {
        self.tls_pending = false;
        self.hooks
            .log(format_args!("TLS negotiation finished, success: {}", ok));
    }
}

/// Matches a mailbox name against a LIST pattern.
///
/// `*` matches anything, `%` anything but the hierarchy delimiter. `INBOX`
/// matches case-insensitively.
fn mailbox_matches(pattern: &str, name: &str) -> bool {
    fn matches(pattern: &[char], name: &[char]) -> bool {
        match pattern.split_first() {
            None => name.is_empty(),
            Some(('*', rest)) => (0..=name.len()).any(|i| matches(rest, &name[i..])),
            Some(('%', rest)) => (0..=name.len())
                .take_while(|&i| i == 0 || name[i - 1] != DELIMITER)
                .any(|i| matches(rest, &name[i..])),
            Some((c, rest)) => name.first() == Some(c) && matches(rest, &name[1..]),
        }
    }

    if name.eq_ignore_ascii_case(INBOX) {
        let name: Vec<char> = INBOX.chars().collect();
        let pattern: Vec<char> = pattern.to_ascii_uppercase().chars().collect();
        return matches(&pattern, &name);
    }

    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    matches(&pattern, &name)
}

/// Renders a mailbox name as an IMAP quoted string.
fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Splits a command line into atoms and quoted strings.
fn tokenize(line: &str) -> Result<Vec<String>, &'static str> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' => {
                chars.next();
            }
            '"' => {
                chars.next();
                let mut token = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped @ ('"' | '\\')) => token.push(escaped),
                            _ => return Err("Invalid escape in quoted string"),
                        },
                        Some(other) => token.push(other),
                        None => return Err("Unterminated quoted string"),
                    }
                }
                tokens.push(token);
            }
            _ => {
                let mut token = String::new();
                while let Some(&c) = chars.peek() {
                    if c == ' ' {
                        break;
                    }
                    token.push(c);
                    chars.next();
                }
                tokens.push(token);
            }
        }
    }

    Ok(tokens)
}
