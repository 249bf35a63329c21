//! The SMTP server: listener loop, admission control, graceful shutdown,
//! and per-connection session spawning.

pub mod handler;
mod session;
mod tls;

use std::{sync::Arc, time::Duration};

use serde::Deserialize;
use tokio::{
    net::TcpListener,
    sync::{Semaphore, broadcast, watch},
    task::JoinSet,
    time::timeout,
};
use tokio_rustls::TlsAcceptor;

pub use tls::{TlsContext, TlsError};

use crate::{
    Signal,
    enhanced::EnhancedCode,
    error::{Error, Result},
    reply::ReplyCode,
    textproto::Conn,
};

use self::{
    handler::{
        AuthHandler, ConnectionHandler, DataHandler, HeloHandler, MailHandler, RcptHandler,
        ResetHandler, VrfyHandler,
    },
    session::Session,
};

const fn default_hostname() -> &'static str {
    "localhost"
}

fn default_listen_address() -> String {
    "0.0.0.0:25".to_owned()
}

const fn default_timeout_secs() -> u64 {
    300 // 5 minutes per RFC 5321 Section 4.5.3.2
}

const fn default_max_message_size() -> u64 {
    10 * 1024 * 1024
}

const fn default_max_recipients() -> usize {
    100
}

const fn default_max_invalid_commands() -> usize {
    10
}

fn default_hostname_string() -> String {
    default_hostname().to_owned()
}

/// Plain-data server settings. All fields have defaults, so a
/// deserialized configuration may specify only what it overrides.
#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    /// Address [`Server::listen_and_serve`] binds to.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Hostname reported in the greeting banner and EHLO response.
    #[serde(default = "default_hostname_string")]
    pub hostname: String,

    /// Per-command read deadline, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Per-reply write deadline, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub write_timeout_secs: u64,

    /// Maximum message size in bytes, advertised via SIZE (RFC 1870).
    /// Zero disables the limit and the SIZE line.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u64,

    /// Hard cap on recipients per transaction.
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Maximum concurrent connections; zero means unlimited.
    #[serde(default)]
    pub max_connections: usize,

    /// Invalid commands tolerated per session before disconnecting.
    #[serde(default = "default_max_invalid_commands")]
    pub max_invalid_commands: usize,

    /// Message submission semantics (RFC 6409): require AUTH before MAIL.
    #[serde(default)]
    pub submission_mode: bool,

    /// PEM paths enabling STARTTLS.
    #[serde(default)]
    pub tls: Option<TlsContext>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            hostname: default_hostname_string(),
            read_timeout_secs: default_timeout_secs(),
            write_timeout_secs: default_timeout_secs(),
            max_message_size: default_max_message_size(),
            max_recipients: default_max_recipients(),
            max_connections: 0,
            max_invalid_commands: default_max_invalid_commands(),
            submission_mode: false,
            tls: None,
        }
    }
}

impl ServerConfig {
    pub(crate) const fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub(crate) const fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// The optional application callbacks, one per protocol stage.
#[derive(Default, Clone)]
pub(crate) struct Handlers {
    pub connect: Option<Arc<dyn ConnectionHandler>>,
    pub helo: Option<Arc<dyn HeloHandler>>,
    pub mail: Option<Arc<dyn MailHandler>>,
    pub rcpt: Option<Arc<dyn RcptHandler>>,
    pub data: Option<Arc<dyn DataHandler>>,
    pub reset: Option<Arc<dyn ResetHandler>>,
    pub vrfy: Option<Arc<dyn VrfyHandler>>,
    pub auth: Option<Arc<dyn AuthHandler>>,
}

/// State shared by the listener loop and every session.
pub(crate) struct Shared {
    pub config: ServerConfig,
    pub handlers: Handlers,
    pub tls: Option<TlsAcceptor>,
}

/// Builds a [`Server`].
#[derive(Default)]
pub struct ServerBuilder {
    config: ServerConfig,
    handlers: Handlers,
    tls_config: Option<Arc<tokio_rustls::rustls::ServerConfig>>,
}

impl ServerBuilder {
    /// A builder with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole plain-data configuration, e.g. one deserialized
    /// from a config file.
    #[must_use]
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the address [`Server::listen_and_serve`] binds to
    /// (default `0.0.0.0:25`).
    #[must_use]
    pub fn with_listen_address(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_address = addr.into();
        self
    }

    /// Sets the hostname used in the greeting and EHLO response.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.hostname = hostname.into();
        self
    }

    /// Sets the per-command read deadline.
    #[must_use]
    pub const fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout_secs = timeout.as_secs();
        self
    }

    /// Sets the per-reply write deadline.
    #[must_use]
    pub const fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout_secs = timeout.as_secs();
        self
    }

    /// Sets the advertised maximum message size; zero disables the limit.
    #[must_use]
    pub const fn with_max_message_size(mut self, bytes: u64) -> Self {
        self.config.max_message_size = bytes;
        self
    }

    /// Sets the per-transaction recipient cap.
    #[must_use]
    pub const fn with_max_recipients(mut self, count: usize) -> Self {
        self.config.max_recipients = count;
        self
    }

    /// Sets the concurrent connection cap; zero means unlimited.
    #[must_use]
    pub const fn with_max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Sets how many invalid commands a session tolerates before being
    /// dropped.
    #[must_use]
    pub const fn with_max_invalid_commands(mut self, count: usize) -> Self {
        self.config.max_invalid_commands = count;
        self
    }

    /// Enables submission mode (RFC 6409): MAIL requires authentication.
    #[must_use]
    pub const fn with_submission_mode(mut self, enabled: bool) -> Self {
        self.config.submission_mode = enabled;
        self
    }

    /// Enables STARTTLS from PEM certificate and key paths.
    #[must_use]
    pub fn with_tls_context(mut self, tls: TlsContext) -> Self {
        self.config.tls = Some(tls);
        self
    }

    /// Enables STARTTLS with a prebuilt rustls configuration.
    #[must_use]
    pub fn with_tls_config(mut self, config: Arc<tokio_rustls::rustls::ServerConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Sets the connection-admission callback.
    #[must_use]
    pub fn with_connection_handler(mut self, handler: Arc<dyn ConnectionHandler>) -> Self {
        self.handlers.connect = Some(handler);
        self
    }

    /// Sets the EHLO/HELO callback.
    #[must_use]
    pub fn with_helo_handler(mut self, handler: Arc<dyn HeloHandler>) -> Self {
        self.handlers.helo = Some(handler);
        self
    }

    /// Sets the MAIL FROM callback.
    #[must_use]
    pub fn with_mail_handler(mut self, handler: Arc<dyn MailHandler>) -> Self {
        self.handlers.mail = Some(handler);
        self
    }

    /// Sets the RCPT TO callback.
    #[must_use]
    pub fn with_rcpt_handler(mut self, handler: Arc<dyn RcptHandler>) -> Self {
        self.handlers.rcpt = Some(handler);
        self
    }

    /// Sets the message body callback.
    #[must_use]
    pub fn with_data_handler(mut self, handler: Arc<dyn DataHandler>) -> Self {
        self.handlers.data = Some(handler);
        self
    }

    /// Sets the transaction-reset callback.
    #[must_use]
    pub fn with_reset_handler(mut self, handler: Arc<dyn ResetHandler>) -> Self {
        self.handlers.reset = Some(handler);
        self
    }

    /// Sets the VRFY callback. Without one, VRFY answers 252.
    #[must_use]
    pub fn with_vrfy_handler(mut self, handler: Arc<dyn VrfyHandler>) -> Self {
        self.handlers.vrfy = Some(handler);
        self
    }

    /// Sets the credential-verification callback. Setting one makes the
    /// server advertise `AUTH PLAIN LOGIN CRAM-MD5`.
    #[must_use]
    pub fn with_auth_handler(mut self, handler: Arc<dyn AuthHandler>) -> Self {
        self.handlers.auth = Some(handler);
        self
    }

    /// Validates the configuration and assembles the server. TLS material
    /// referenced by path is loaded here so misconfiguration surfaces
    /// before the listener starts.
    ///
    /// # Errors
    ///
    /// [`Error::TlsConfig`] when the certificate or key cannot be loaded.
    pub fn build(self) -> Result<Server> {
        let tls = match (self.tls_config, &self.config.tls) {
            (Some(config), _) => Some(TlsAcceptor::from(config)),
            (None, Some(context)) => Some(TlsAcceptor::from(context.load()?)),
            (None, None) => None,
        };

        let (shutdown_tx, _) = broadcast::channel(1);
        let (drained_tx, drained_rx) = watch::channel(false);

        Ok(Server {
            shared: Arc::new(Shared {
                config: self.config,
                handlers: self.handlers,
                tls,
            }),
            shutdown_tx,
            drained_tx,
            drained_rx,
        })
    }
}

/// An SMTP server. Each accepted connection runs as an independent task;
/// the only cross-session state is the admission semaphore and the
/// shutdown broadcast.
pub struct Server {
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<Signal>,
    drained_tx: watch::Sender<bool>,
    drained_rx: watch::Receiver<bool>,
}

impl Server {
    /// Starts configuring a server.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Binds the configured listen address and serves until shutdown.
    ///
    /// # Errors
    ///
    /// Binding failures and fatal listener errors.
    pub async fn listen_and_serve(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.shared.config.listen_address).await?;
        self.serve(listener).await
    }

    /// Accepts connections on an existing listener until shutdown, then
    /// waits for the remaining sessions to finish.
    ///
    /// # Errors
    ///
    /// Propagates nothing from individual sessions; only listener-level
    /// failures surface here.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let semaphore = (self.shared.config.max_connections > 0)
            .then(|| Arc::new(Semaphore::new(self.shared.config.max_connections)));
        let mut sessions = JoinSet::new();

        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "smtp server listening");
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,

                // Reap finished sessions so the set stays small.
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}

                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::error!(%err, "accept failed");
                            continue;
                        }
                    };

                    let permit = match &semaphore {
                        None => None,
                        Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                            Ok(permit) => Some(permit),
                            Err(_) => {
                                tracing::warn!(%peer, "connection limit reached, refusing");
                                sessions.spawn(refuse_over_capacity(stream));
                                continue;
                            }
                        },
                    };

                    let session = Session::new(stream, peer, Arc::clone(&self.shared));
                    let signal = self.shutdown_tx.subscribe();
                    sessions.spawn(async move {
                        // Hold the admission permit for the session's whole
                        // lifetime, whatever its exit path.
                        let _permit = permit;
                        if let Err(err) = session.run(signal).await {
                            tracing::debug!(%peer, %err, "session ended with error");
                        }
                    });
                }
            }
        }

        drop(listener);
        while sessions.join_next().await.is_some() {}
        let _ = self.drained_tx.send(true);

        Ok(())
    }

    /// Signals shutdown and waits until every live session has finished,
    /// up to the deadline. New connections are refused immediately.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] when sessions do not drain in time.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        let _ = self.shutdown_tx.send(Signal::Shutdown);

        let mut drained = self.drained_rx.clone();
        timeout(deadline, drained.wait_for(|done| *done))
            .await
            .map_err(Error::from)?
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "server task gone",
                ))
            })?;

        Ok(())
    }

    /// Closes the listener without waiting for sessions to finish.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(Signal::Shutdown);
    }
}

async fn refuse_over_capacity(stream: tokio::net::TcpStream) {
    let mut conn = Conn::new(stream);
    let refusal = crate::error::SmtpError::new(
        ReplyCode::SERVICE_NOT_AVAILABLE,
        EnhancedCode::TRANSIENT_POLICY,
        "Too many connections, try again later",
    );
    let _ = conn
        .write_reply(refusal.code, &refusal.reply_lines())
        .await;
    let _ = conn.shutdown().await;
}
