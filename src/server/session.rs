//! Per-connection SMTP session: the command loop, the protocol state
//! machine, handler dispatch, AUTH, STARTTLS, and body ingestion.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use tokio::time::timeout;

use crate::{
    Signal,
    address::{ForwardPath, ReversePath},
    enhanced::EnhancedCode,
    error::{Error, Result, SmtpError},
    extensions,
    reply::ReplyCode,
    textproto::{Conn, MAX_COMMAND_LINE, Transport},
};

use super::Shared;

/// Where the session is in the SMTP conversation. The ordering is
/// meaningful: commands gate on "at least" or "at most" a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum State {
    /// Connected; no EHLO/HELO yet (also right after STARTTLS).
    New,
    /// EHLO or HELO accepted.
    Greeted,
    /// MAIL FROM accepted.
    Mail,
    /// At least one RCPT TO accepted.
    Rcpt,
    /// Body ingestion in progress; transient within DATA/BDAT handling.
    Data,
}

/// Whether the command loop keeps the connection open.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

fn internal_error() -> SmtpError {
    SmtpError::new(
        ReplyCode::LOCAL_ERROR,
        EnhancedCode::TRANSIENT_NETWORK,
        "Internal error",
    )
}

/// Picks the reply for a failed handler: a handler-supplied
/// [`SmtpError`] verbatim, anything else as the fallback.
fn to_reply(err: Error, fallback: SmtpError) -> SmtpError {
    match err {
        Error::Smtp(smtp) => smtp,
        _ => fallback,
    }
}

/// Case-insensitive ASCII prefix strip, safe for UTF-8 tails.
fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let n = prefix.len();
    (s.len() >= n && s.as_bytes()[..n].eq_ignore_ascii_case(prefix.as_bytes()))
        .then(|| &s[n..])
}

pub(crate) struct Session {
    shared: Arc<Shared>,
    conn: Conn,
    peer: SocketAddr,
    state: State,
    client_hostname: String,
    esmtp: bool,
    tls: bool,
    authenticated: bool,
    invalid_commands: usize,
    reverse_path: Option<ReversePath>,
    forward_paths: Vec<ForwardPath>,
    bdat_buffer: Vec<u8>,
}

impl Session {
    pub(crate) fn new<S: Transport + 'static>(
        stream: S,
        peer: SocketAddr,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            shared,
            conn: Conn::new(stream),
            peer,
            state: State::New,
            client_hostname: String::new(),
            esmtp: false,
            tls: false,
            authenticated: false,
            invalid_commands: 0,
            reverse_path: None,
            forward_paths: Vec::new(),
            bdat_buffer: Vec::new(),
        }
    }

    /// Runs the session to completion: admission check, greeting, then
    /// the command loop until QUIT, shutdown, a fired deadline, too many
    /// invalid commands, or a transport failure.
    pub(crate) async fn run(mut self, mut signal: tokio::sync::broadcast::Receiver<Signal>) -> Result<()> {
        tracing::debug!(peer = %self.peer, "connected");

        if let Some(handler) = self.shared.handlers.connect.clone() {
            if let Err(err) = handler.on_connect(self.peer).await {
                let refusal = to_reply(
                    err,
                    SmtpError::new(
                        ReplyCode::SERVICE_NOT_AVAILABLE,
                        EnhancedCode::zero(),
                        "Connection refused",
                    ),
                );
                self.write_smtp_error(&refusal).await?;
                self.conn.shutdown().await.ok();
                return Ok(());
            }
        }

        let banner = format!("{} ESMTP ready", self.shared.config.hostname);
        self.reply(ReplyCode::SERVICE_READY, EnhancedCode::zero(), &banner)
            .await?;

        let result = self.command_loop(&mut signal).await;

        tracing::debug!(peer = %self.peer, "disconnected");
        match result {
            // A vanished peer is a normal way for a session to end.
            Err(Error::Io(err)) => {
                tracing::debug!(peer = %self.peer, %err, "transport closed");
                Ok(())
            }
            other => other,
        }
    }

    async fn command_loop(
        &mut self,
        signal: &mut tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<()> {
        loop {
            // The shutdown signal is checked ahead of the pending read so
            // an idle session still answers 421 at the command boundary.
            tokio::select! {
                biased;

                _ = signal.recv() => {
                    self.reply(
                        ReplyCode::SERVICE_NOT_AVAILABLE,
                        EnhancedCode::TRANSIENT_SYSTEM,
                        "Server shutting down",
                    )
                    .await
                    .ok();
                    return Ok(());
                }

                read = timeout(
                    self.shared.config.read_timeout(),
                    self.conn.read_line(MAX_COMMAND_LINE),
                ) => {
                    let line = match read {
                        Err(_) => {
                            tracing::debug!(peer = %self.peer, "command read deadline fired");
                            return Ok(());
                        }
                        Ok(Err(Error::Frame(err))) => {
                            tracing::debug!(peer = %self.peer, %err, "unframeable command line");
                            let flow = self
                                .reply_invalid(
                                    ReplyCode::SYNTAX_ERROR,
                                    EnhancedCode::SYNTAX_ERROR,
                                    "Line too long",
                                )
                                .await?;
                            if flow == Flow::Close {
                                return Ok(());
                            }
                            continue;
                        }
                        Ok(Err(err)) => return Err(err),
                        Ok(Ok(line)) => line,
                    };

                    if self.dispatch(&line).await? == Flow::Close {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, line: &str) -> Result<Flow> {
        if line.contains('\0') {
            return self
                .reply_invalid(
                    ReplyCode::SYNTAX_ERROR,
                    EnhancedCode::INVALID_COMMAND,
                    "NUL not allowed in commands",
                )
                .await;
        }

        let (verb, args) = match line.split_once(' ') {
            Some((verb, args)) => (verb, args.trim()),
            None => (line, ""),
        };
        let verb = verb.to_ascii_uppercase();

        match verb.as_str() {
            "EHLO" => self.handle_ehlo(args).await,
            "HELO" => self.handle_helo(args).await,
            "MAIL" => self.handle_mail(args).await,
            "RCPT" => self.handle_rcpt(args).await,
            "DATA" => self.handle_data().await,
            "BDAT" => self.handle_bdat(args).await,
            "RSET" => self.handle_rset().await,
            "NOOP" => {
                self.reply(ReplyCode::OK, EnhancedCode::OK, "OK").await?;
                Ok(Flow::Continue)
            }
            "QUIT" => {
                let farewell = format!("{} closing connection", self.shared.config.hostname);
                self.reply(ReplyCode::SERVICE_CLOSING, EnhancedCode::OK, &farewell)
                    .await?;
                Ok(Flow::Close)
            }
            "VRFY" => self.handle_vrfy(args).await,
            "EXPN" => {
                self.reply(
                    ReplyCode::NOT_IMPLEMENTED,
                    EnhancedCode::INVALID_COMMAND,
                    "EXPN not implemented",
                )
                .await?;
                Ok(Flow::Continue)
            }
            "STARTTLS" => self.handle_starttls().await,
            "AUTH" => self.handle_auth(args).await,
            _ => {
                self.reply_invalid(
                    ReplyCode::SYNTAX_ERROR,
                    EnhancedCode::INVALID_COMMAND,
                    "Command not recognized",
                )
                .await
            }
        }
    }

    // ------------------------------------------------------------------
    // Reply plumbing
    // ------------------------------------------------------------------

    async fn write_smtp_error(&mut self, reply: &SmtpError) -> Result<()> {
        let lines = reply.reply_lines();
        timeout(
            self.shared.config.write_timeout(),
            self.conn.write_reply(reply.code, &lines),
        )
        .await?
    }

    async fn reply(
        &mut self,
        code: ReplyCode,
        enhanced: EnhancedCode,
        message: &str,
    ) -> Result<()> {
        self.write_smtp_error(&SmtpError::new(code, enhanced, message))
            .await
    }

    async fn write_reply_lines(&mut self, code: ReplyCode, lines: &[String]) -> Result<()> {
        timeout(
            self.shared.config.write_timeout(),
            self.conn.write_reply(code, lines),
        )
        .await?
    }

    /// Sends an error reply that counts toward the invalid-command cap,
    /// closing the session with 421 once the cap is reached.
    async fn reply_invalid(
        &mut self,
        code: ReplyCode,
        enhanced: EnhancedCode,
        message: &str,
    ) -> Result<Flow> {
        self.reply(code, enhanced, message).await?;
        self.bump_invalid().await
    }

    async fn bump_invalid(&mut self) -> Result<Flow> {
        self.invalid_commands += 1;
        let max = self.shared.config.max_invalid_commands;
        if max > 0 && self.invalid_commands >= max {
            tracing::debug!(peer = %self.peer, "too many invalid commands");
            self.reply(
                ReplyCode::SERVICE_NOT_AVAILABLE,
                EnhancedCode::TRANSIENT_NETWORK,
                "Too many errors, closing connection",
            )
            .await?;
            return Ok(Flow::Close);
        }
        Ok(Flow::Continue)
    }

    async fn reply_sequence(&mut self, message: &str) -> Result<Flow> {
        self.reply_invalid(ReplyCode::BAD_SEQUENCE, EnhancedCode::INVALID_COMMAND, message)
            .await
    }

    // ------------------------------------------------------------------
    // Transaction state
    // ------------------------------------------------------------------

    async fn reset_transaction(&mut self) {
        self.reverse_path = None;
        self.forward_paths.clear();
        self.bdat_buffer.clear();

        if let Some(handler) = self.shared.handlers.reset.clone() {
            handler.on_reset().await;
        }
    }

    // ------------------------------------------------------------------
    // Greeting commands
    // ------------------------------------------------------------------

    async fn handle_ehlo(&mut self, args: &str) -> Result<Flow> {
        if args.is_empty() {
            return self
                .reply_invalid(
                    ReplyCode::PARAM_SYNTAX_ERROR,
                    EnhancedCode::SYNTAX_ERROR,
                    "EHLO requires a hostname",
                )
                .await;
        }

        if let Some(handler) = self.shared.handlers.helo.clone() {
            if let Err(err) = handler.on_helo(args).await {
                let reply = to_reply(err, internal_error());
                self.write_smtp_error(&reply).await?;
                return Ok(Flow::Continue);
            }
        }

        self.reset_transaction().await;
        self.client_hostname = args.to_owned();
        self.esmtp = true;
        self.state = State::Greeted;

        let config = &self.shared.config;
        let mut lines = vec![format!("{} Hello {}", config.hostname, args)];
        if config.max_message_size > 0 {
            lines.push(format!("SIZE {}", config.max_message_size));
        }
        lines.push(extensions::PIPELINING.to_owned());
        lines.push(extensions::EIGHT_BIT_MIME.to_owned());
        lines.push(extensions::ENHANCED_STATUS_CODES.to_owned());
        lines.push(extensions::DSN.to_owned());
        lines.push(extensions::SMTPUTF8.to_owned());
        lines.push(extensions::CHUNKING.to_owned());
        if self.shared.tls.is_some() && !self.tls {
            lines.push(extensions::STARTTLS.to_owned());
        }
        if self.shared.handlers.auth.is_some() && !self.authenticated {
            lines.push(format!("{} PLAIN LOGIN CRAM-MD5", extensions::AUTH));
        }

        self.write_reply_lines(ReplyCode::OK, &lines).await?;
        Ok(Flow::Continue)
    }

    async fn handle_helo(&mut self, args: &str) -> Result<Flow> {
        if args.is_empty() {
            return self
                .reply_invalid(
                    ReplyCode::PARAM_SYNTAX_ERROR,
                    EnhancedCode::SYNTAX_ERROR,
                    "HELO requires a hostname",
                )
                .await;
        }

        if let Some(handler) = self.shared.handlers.helo.clone() {
            if let Err(err) = handler.on_helo(args).await {
                let reply = to_reply(err, internal_error());
                self.write_smtp_error(&reply).await?;
                return Ok(Flow::Continue);
            }
        }

        self.reset_transaction().await;
        self.client_hostname = args.to_owned();
        self.esmtp = false;
        self.state = State::Greeted;

        let greeting = format!("{} Hello {}", self.shared.config.hostname, args);
        self.reply(ReplyCode::OK, EnhancedCode::OK, &greeting).await?;
        Ok(Flow::Continue)
    }

    // ------------------------------------------------------------------
    // Mail transaction
    // ------------------------------------------------------------------

    async fn handle_mail(&mut self, args: &str) -> Result<Flow> {
        if self.state < State::Greeted {
            return self.reply_sequence("Send EHLO/HELO first").await;
        }
        if self.state > State::Greeted {
            return self.reply_sequence("MAIL already specified").await;
        }

        // Submission servers require authentication first (RFC 6409).
        if self.shared.config.submission_mode && !self.authenticated {
            self.reply(
                ReplyCode::AUTH_REQUIRED,
                EnhancedCode::AUTH_REQUIRED,
                "Authentication required",
            )
            .await?;
            return Ok(Flow::Continue);
        }

        let Some(rest) = strip_prefix_ci(args, "FROM:") else {
            return self
                .reply_invalid(
                    ReplyCode::PARAM_SYNTAX_ERROR,
                    EnhancedCode::SYNTAX_ERROR,
                    "Syntax: MAIL FROM:<address>",
                )
                .await;
        };

        let rest = rest.trim_start();
        let (path_str, params_str) = rest.split_once(' ').unwrap_or((rest, ""));

        let from = match ReversePath::parse(path_str) {
            Ok(from) => from,
            Err(_) => {
                return self
                    .reply_invalid(
                        ReplyCode::PARAM_SYNTAX_ERROR,
                        EnhancedCode::BAD_SENDER_SYNTAX,
                        "Invalid sender address",
                    )
                    .await;
            }
        };

        if let Err(reply) = self.check_mail_params(params_str) {
            let syntax = reply.code == ReplyCode::PARAM_SYNTAX_ERROR;
            self.write_smtp_error(&reply).await?;
            return if syntax {
                self.bump_invalid().await
            } else {
                Ok(Flow::Continue)
            };
        }

        if let Some(handler) = self.shared.handlers.mail.clone() {
            if let Err(err) = handler.on_mail(&from).await {
                let reply = to_reply(err, internal_error());
                self.write_smtp_error(&reply).await?;
                return Ok(Flow::Continue);
            }
        }

        self.reverse_path = Some(from);
        self.forward_paths.clear();
        self.state = State::Mail;

        self.reply(ReplyCode::OK, EnhancedCode::SENDER_OK, "Originator ok")
            .await?;
        Ok(Flow::Continue)
    }

    /// Validates MAIL FROM extension parameters (RFC 5321 Section 4.1.2).
    /// The declared SIZE is checked against the configured maximum
    /// (RFC 1870 Section 4); other recognized parameters are validated
    /// for syntax and otherwise passed through.
    fn check_mail_params(&self, params: &str) -> std::result::Result<(), SmtpError> {
        let syntax = |message: &str| {
            SmtpError::new(
                ReplyCode::PARAM_SYNTAX_ERROR,
                EnhancedCode::INVALID_ARGUMENTS,
                message,
            )
        };

        let mut seen: Vec<String> = Vec::new();
        for token in params.split_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key.to_ascii_uppercase(), Some(value)),
                None => (token.to_ascii_uppercase(), None),
            };

            if seen.contains(&key) {
                return Err(syntax(&format!("Duplicate parameter {key}")));
            }

            match key.as_str() {
                "SIZE" => {
                    let declared: u64 = value
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| syntax("Invalid SIZE value"))?;
                    let max = self.shared.config.max_message_size;
                    if max > 0 && declared > max {
                        return Err(SmtpError::new(
                            ReplyCode::EXCEEDED_STORAGE,
                            EnhancedCode::MESSAGE_TOO_LARGE,
                            "Declared message size exceeds maximum",
                        ));
                    }
                }
                "BODY" => {
                    let valid = value.is_some_and(|v| {
                        v.eq_ignore_ascii_case("7BIT") || v.eq_ignore_ascii_case("8BITMIME")
                    });
                    if !valid {
                        return Err(syntax("Invalid BODY value"));
                    }
                }
                "SMTPUTF8" => {
                    if value.is_some() {
                        return Err(syntax("SMTPUTF8 takes no value"));
                    }
                }
                // Recognized-with-value and unknown parameters pass through.
                _ => {}
            }

            seen.push(key);
        }

        Ok(())
    }

    async fn handle_rcpt(&mut self, args: &str) -> Result<Flow> {
        if self.state < State::Mail {
            return self.reply_sequence("Send MAIL first").await;
        }

        if self.forward_paths.len() >= self.shared.config.max_recipients {
            self.reply(
                ReplyCode::INSUFFICIENT_STORAGE,
                EnhancedCode::TOO_MANY_RECIPIENTS,
                "Too many recipients",
            )
            .await?;
            return Ok(Flow::Continue);
        }

        let Some(rest) = strip_prefix_ci(args, "TO:") else {
            return self
                .reply_invalid(
                    ReplyCode::PARAM_SYNTAX_ERROR,
                    EnhancedCode::SYNTAX_ERROR,
                    "Syntax: RCPT TO:<address>",
                )
                .await;
        };

        let rest = rest.trim_start();
        let (path_str, _params) = rest.split_once(' ').unwrap_or((rest, ""));

        let to = match ForwardPath::parse(path_str) {
            Ok(to) => to,
            Err(_) => {
                return self
                    .reply_invalid(
                        ReplyCode::PARAM_SYNTAX_ERROR,
                        EnhancedCode::BAD_RECIPIENT_SYNTAX,
                        "Invalid recipient address",
                    )
                    .await;
            }
        };

        if let Some(handler) = self.shared.handlers.rcpt.clone() {
            if let Err(err) = handler.on_rcpt(&to).await {
                let reply = to_reply(err, internal_error());
                self.write_smtp_error(&reply).await?;
                return Ok(Flow::Continue);
            }
        }

        self.forward_paths.push(to);
        if self.state < State::Rcpt {
            self.state = State::Rcpt;
        }

        self.reply(ReplyCode::OK, EnhancedCode::RECIPIENT_OK, "Recipient ok")
            .await?;
        Ok(Flow::Continue)
    }

    async fn handle_data(&mut self) -> Result<Flow> {
        if self.state < State::Rcpt {
            return self.reply_sequence("Send RCPT first").await;
        }

        self.reply(
            ReplyCode::START_MAIL_INPUT,
            EnhancedCode::zero(),
            "Start mail input; end with <CRLF>.<CRLF>",
        )
        .await?;
        self.state = State::Data;

        let from = self.reverse_path.clone().unwrap_or(ReversePath::Null);
        let rcpts = self.forward_paths.clone();
        let handler = self.shared.handlers.data.clone();
        let read_deadline = self.shared.config.read_timeout();

        let handler_result = timeout(read_deadline, async {
            let mut body = self.conn.dot_reader()?;
            let result = match &handler {
                Some(handler) => handler.on_data(&from, &rcpts, &mut body).await,
                None => Ok(()),
            };
            // Whatever the handler consumed, drain to the terminator so
            // the stream stays aligned on the next command.
            tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
            Ok::<_, Error>(result)
        })
        .await??;

        match handler_result {
            Ok(()) => {
                self.reply(ReplyCode::OK, EnhancedCode::OK, "Message accepted")
                    .await?;
            }
            Err(err) => {
                let reply = to_reply(err, internal_error());
                self.write_smtp_error(&reply).await?;
            }
        }

        self.reset_transaction().await;
        self.state = State::Greeted;
        Ok(Flow::Continue)
    }

    async fn handle_bdat(&mut self, args: &str) -> Result<Flow> {
        if self.state < State::Rcpt {
            return self.reply_sequence("Send RCPT first").await;
        }

        let mut tokens = args.split_whitespace();
        let size: u64 = match tokens.next().and_then(|t| t.parse().ok()) {
            Some(size) => size,
            None => {
                return self
                    .reply_invalid(
                        ReplyCode::PARAM_SYNTAX_ERROR,
                        EnhancedCode::SYNTAX_ERROR,
                        "Syntax: BDAT <size> [LAST]",
                    )
                    .await;
            }
        };
        let last = tokens
            .next()
            .is_some_and(|t| t.eq_ignore_ascii_case("LAST"));

        self.state = State::Data;
        let read_deadline = self.shared.config.read_timeout();
        let max = self.shared.config.max_message_size;

        let accumulated = self.bdat_buffer.len() as u64;
        let too_large = max > 0 && accumulated.saturating_add(size) > max;

        let chunk_len = usize::try_from(size).ok().filter(|_| !too_large);
        let Some(chunk_len) = chunk_len else {
            // The chunk is already in flight; consume it to keep the
            // stream aligned, then reject.
            timeout(read_deadline, self.conn.read_discard(size)).await??;
            self.reply(
                ReplyCode::EXCEEDED_STORAGE,
                EnhancedCode::MESSAGE_TOO_LARGE,
                "Message exceeds maximum size",
            )
            .await?;
            self.reset_transaction().await;
            self.state = State::Greeted;
            return Ok(Flow::Continue);
        };

        let chunk = timeout(read_deadline, self.conn.read_exact_body(chunk_len)).await??;
        self.bdat_buffer.extend_from_slice(&chunk);

        if !last {
            let received = format!("{size} bytes received");
            self.reply(ReplyCode::OK, EnhancedCode::OK, &received).await?;
            self.state = State::Rcpt;
            return Ok(Flow::Continue);
        }

        let from = self.reverse_path.clone().unwrap_or(ReversePath::Null);
        let rcpts = self.forward_paths.clone();
        let handler = self.shared.handlers.data.clone();

        let result = match &handler {
            Some(handler) => {
                let mut body: &[u8] = &self.bdat_buffer;
                handler.on_data(&from, &rcpts, &mut body).await
            }
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                self.reply(ReplyCode::OK, EnhancedCode::OK, "Message accepted")
                    .await?;
            }
            Err(err) => {
                let reply = to_reply(err, internal_error());
                self.write_smtp_error(&reply).await?;
            }
        }

        self.reset_transaction().await;
        self.state = State::Greeted;
        Ok(Flow::Continue)
    }

    async fn handle_rset(&mut self) -> Result<Flow> {
        self.reset_transaction().await;
        if self.state > State::Greeted {
            self.state = State::Greeted;
        }
        self.reply(ReplyCode::OK, EnhancedCode::OK, "Reset ok").await?;
        Ok(Flow::Continue)
    }

    async fn handle_vrfy(&mut self, args: &str) -> Result<Flow> {
        if self.state != State::Greeted {
            return self.reply_sequence("VRFY not allowed here").await;
        }

        match self.shared.handlers.vrfy.clone() {
            Some(handler) => match handler.on_vrfy(args).await {
                Ok(text) => {
                    self.reply(ReplyCode::OK, EnhancedCode::OK, &text).await?;
                }
                Err(err) => {
                    let reply = to_reply(err, internal_error());
                    self.write_smtp_error(&reply).await?;
                }
            },
            // Do not reveal user information (RFC 5321 Section 7.3).
            None => {
                self.reply(
                    ReplyCode::CANNOT_VRFY,
                    EnhancedCode::OK,
                    "Cannot VRFY user, but will accept message",
                )
                .await?;
            }
        }

        Ok(Flow::Continue)
    }

    // ------------------------------------------------------------------
    // STARTTLS
    // ------------------------------------------------------------------

    async fn handle_starttls(&mut self) -> Result<Flow> {
        let Some(acceptor) = self.shared.tls.clone() else {
            self.reply(
                ReplyCode::NOT_IMPLEMENTED,
                EnhancedCode::INVALID_COMMAND,
                "STARTTLS not available",
            )
            .await?;
            return Ok(Flow::Continue);
        };

        if self.tls {
            return self.reply_sequence("Already running TLS").await;
        }
        if self.state != State::Greeted {
            return self.reply_sequence("Send EHLO/HELO first").await;
        }

        self.reply(
            ReplyCode::SERVICE_READY,
            EnhancedCode::zero(),
            "Ready to start TLS",
        )
        .await?;

        let deadline = self.shared.config.read_timeout();
        match timeout(deadline, self.conn.upgrade_server(&acceptor)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(peer = %self.peer, %err, "TLS handshake failed");
                return Ok(Flow::Close);
            }
            Err(_) => {
                tracing::warn!(peer = %self.peer, "TLS handshake deadline fired");
                return Ok(Flow::Close);
            }
        }

        // Fresh session over the secured channel: everything is wiped
        // except the TLS flag (RFC 3207 Section 4.2).
        self.tls = true;
        self.reset_transaction().await;
        self.state = State::New;
        self.client_hostname.clear();
        self.esmtp = false;
        self.authenticated = false;

        tracing::debug!(peer = %self.peer, "connection upgraded to TLS");
        Ok(Flow::Continue)
    }

    // ------------------------------------------------------------------
    // AUTH
    // ------------------------------------------------------------------

    async fn handle_auth(&mut self, args: &str) -> Result<Flow> {
        let Some(handler) = self.shared.handlers.auth.clone() else {
            self.reply(
                ReplyCode::NOT_IMPLEMENTED,
                EnhancedCode::INVALID_COMMAND,
                "AUTH not available",
            )
            .await?;
            return Ok(Flow::Continue);
        };
        if self.state < State::Greeted {
            return self.reply_sequence("Send EHLO/HELO first").await;
        }
        if self.state > State::Greeted {
            return self.reply_sequence("AUTH not allowed during mail transaction").await;
        }
        if self.authenticated {
            return self.reply_sequence("Already authenticated").await;
        }

        let (mechanism, initial) = match args.split_once(' ') {
            Some((mechanism, initial)) => (mechanism.to_ascii_uppercase(), initial),
            None => (args.to_ascii_uppercase(), ""),
        };

        match mechanism.as_str() {
            "PLAIN" => self.auth_plain(&handler, initial).await?,
            "LOGIN" => self.auth_login(&handler).await?,
            "CRAM-MD5" => self.auth_cram_md5(&handler).await?,
            _ => {
                self.reply(
                    ReplyCode::PARAM_NOT_IMPLEMENTED,
                    EnhancedCode::INVALID_ARGUMENTS,
                    "Unrecognized authentication mechanism",
                )
                .await?;
            }
        }

        Ok(Flow::Continue)
    }

    /// Sends a 334 challenge (empty for the bare continuation request).
    async fn write_challenge(&mut self, challenge: &[u8]) -> Result<()> {
        let line = if challenge.is_empty() {
            String::new()
        } else {
            BASE64.encode(challenge)
        };
        self.write_reply_lines(ReplyCode::AUTH_CONTINUE, &[line]).await
    }

    /// Reads one base64 AUTH continuation line. `None` means the
    /// exchange ended early (cancel or malformed data) and a reply has
    /// already been sent.
    async fn read_auth_line(&mut self) -> Result<Option<Vec<u8>>> {
        let read = timeout(
            self.shared.config.read_timeout(),
            self.conn.read_line(MAX_COMMAND_LINE),
        )
        .await?;

        let line = match read {
            Ok(line) => line,
            Err(Error::Frame(_)) => {
                self.reply(
                    ReplyCode::PARAM_SYNTAX_ERROR,
                    EnhancedCode::SYNTAX_ERROR,
                    "Invalid response",
                )
                .await?;
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        if line == "*" {
            self.reply(
                ReplyCode::PARAM_SYNTAX_ERROR,
                EnhancedCode::INVALID_COMMAND,
                "Authentication cancelled",
            )
            .await?;
            return Ok(None);
        }

        match BASE64.decode(&line) {
            Ok(decoded) => Ok(Some(decoded)),
            Err(_) => {
                self.reply(
                    ReplyCode::PARAM_SYNTAX_ERROR,
                    EnhancedCode::SYNTAX_ERROR,
                    "Invalid base64",
                )
                .await?;
                Ok(None)
            }
        }
    }

    async fn finish_auth(
        &mut self,
        handler: &Arc<dyn super::handler::AuthHandler>,
        mechanism: &str,
        username: &str,
        password: &str,
    ) -> Result<()> {
        if let Err(err) = handler.authenticate(mechanism, username, password).await {
            let reply = to_reply(
                err,
                SmtpError::new(
                    ReplyCode::AUTH_FAILED,
                    EnhancedCode::BAD_CREDENTIALS,
                    "Authentication failed",
                ),
            );
            self.write_smtp_error(&reply).await?;
            return Ok(());
        }

        self.authenticated = true;
        self.reply(ReplyCode::AUTH_OK, EnhancedCode::OK, "Authentication successful")
            .await
    }

    async fn auth_plain(
        &mut self,
        handler: &Arc<dyn super::handler::AuthHandler>,
        initial: &str,
    ) -> Result<()> {
        let decoded = if initial.is_empty() || initial == "=" {
            self.write_challenge(b"").await?;
            match self.read_auth_line().await? {
                Some(decoded) => decoded,
                None => return Ok(()),
            }
        } else {
            match BASE64.decode(initial) {
                Ok(decoded) => decoded,
                Err(_) => {
                    return self
                        .reply(
                            ReplyCode::PARAM_SYNTAX_ERROR,
                            EnhancedCode::SYNTAX_ERROR,
                            "Invalid base64",
                        )
                        .await;
                }
            }
        };

        // authzid NUL authcid NUL passwd (RFC 4616).
        let fields: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
        if fields.len() != 3 {
            return self
                .reply(
                    ReplyCode::PARAM_SYNTAX_ERROR,
                    EnhancedCode::SYNTAX_ERROR,
                    "Invalid PLAIN data",
                )
                .await;
        }

        let username = String::from_utf8_lossy(fields[1]).into_owned();
        let password = String::from_utf8_lossy(fields[2]).into_owned();
        self.finish_auth(handler, "PLAIN", &username, &password).await
    }

    async fn auth_login(&mut self, handler: &Arc<dyn super::handler::AuthHandler>) -> Result<()> {
        self.write_challenge(b"Username:").await?;
        let Some(username) = self.read_auth_line().await? else {
            return Ok(());
        };

        self.write_challenge(b"Password:").await?;
        let Some(password) = self.read_auth_line().await? else {
            return Ok(());
        };

        let username = String::from_utf8_lossy(&username).into_owned();
        let password = String::from_utf8_lossy(&password).into_owned();
        self.finish_auth(handler, "LOGIN", &username, &password).await
    }

    async fn auth_cram_md5(&mut self, handler: &Arc<dyn super::handler::AuthHandler>) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let challenge = format!(
            "<{}.{}@{}>",
            now.as_nanos(),
            now.as_secs(),
            self.shared.config.hostname
        );

        self.write_challenge(challenge.as_bytes()).await?;
        let Some(decoded) = self.read_auth_line().await? else {
            return Ok(());
        };

        let response = String::from_utf8_lossy(&decoded).into_owned();
        let Some((username, digest)) = response.rsplit_once(' ') else {
            return self
                .reply(
                    ReplyCode::PARAM_SYNTAX_ERROR,
                    EnhancedCode::SYNTAX_ERROR,
                    "Invalid CRAM-MD5 response",
                )
                .await;
        };

        // The server cannot verify the HMAC without the shared secret, so
        // the handler receives the challenge it committed to alongside
        // the client's digest.
        let password = format!("{challenge}:{digest}");
        let username = username.to_owned();
        self.finish_auth(handler, "CRAM-MD5", &username, &password).await
    }
}
