//! The SMTP client: connection establishment with EHLO/HELO negotiation,
//! the mail transaction commands, STARTTLS upgrade, SASL authentication,
//! and a submission convenience wrapper (RFC 6409).

mod options;

use std::{sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{
        self, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};

pub use options::{BodyKind, DsnReturn, MailOptions, RcptOptions};

use crate::{
    address::{ForwardPath, ReversePath},
    enhanced::EnhancedCode,
    error::{Error, Result, SmtpError},
    extensions::{self, Extensions},
    reply::ReplyCode,
    sasl::Mechanism,
    textproto::{Conn, Reply, Transport, parse_enhanced_code},
};

/// Overall deadline for dial + greeting + EHLO, and for each later
/// command exchange.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configures and establishes a [`Client`] connection.
#[derive(Clone)]
pub struct ClientBuilder {
    local_name: String,
    timeout: Duration,
    tls_config: Option<Arc<ClientConfig>>,
    accept_invalid_certs: bool,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            local_name: "localhost".to_owned(),
            timeout: DEFAULT_TIMEOUT,
            tls_config: None,
            accept_invalid_certs: false,
        }
    }
}

impl ClientBuilder {
    /// A builder with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the hostname announced in EHLO/HELO (default `localhost`).
    #[must_use]
    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = name.into();
        self
    }

    /// Sets the deadline applied to connection establishment and to every
    /// command exchange (default 30 seconds).
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Supplies the TLS configuration used for STARTTLS. Without one, a
    /// configuration trusting the platform root store is built on demand.
    #[must_use]
    pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Skips certificate verification during STARTTLS. For testing with
    /// self-signed certificates only.
    #[must_use]
    pub const fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Connects over TCP, reads the greeting, and negotiates EHLO (with
    /// HELO fallback). The configured timeout covers the whole sequence.
    ///
    /// # Errors
    ///
    /// Any transport failure, a greeting other than 220, or rejection of
    /// both EHLO and HELO.
    pub async fn dial(self, addr: &str) -> Result<Client> {
        let server_name = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
        let deadline = self.timeout;

        timeout(deadline, async {
            let stream = TcpStream::connect(addr).await?;
            self.handshake(stream, server_name).await
        })
        .await?
    }

    /// Wraps an already-established transport (for example a connection
    /// the caller pre-wrapped in TLS for implicit-TLS submission) and
    /// performs the greeting and EHLO exchange. `server_name` is used for
    /// certificate validation if STARTTLS is negotiated later.
    ///
    /// # Errors
    ///
    /// Same as [`ClientBuilder::dial`].
    pub async fn handshake<S: Transport + 'static>(
        self,
        stream: S,
        server_name: &str,
    ) -> Result<Client> {
        let mut client = Client {
            conn: Conn::new(stream),
            server_hostname: String::new(),
            server_name: server_name.to_owned(),
            local_name: self.local_name,
            timeout: self.timeout,
            tls_config: self.tls_config,
            accept_invalid_certs: self.accept_invalid_certs,
            extensions: None,
            tls: false,
        };

        timeout(client.timeout, async {
            let greeting = client.conn.read_reply().await?;
            if greeting.code != ReplyCode::SERVICE_READY {
                client.conn.shutdown().await.ok();
                return Err(reply_to_error(greeting));
            }
            if let Some(line) = greeting.lines.first() {
                client.server_hostname.clone_from(line);
            }

            client.ehlo().await
        })
        .await??;

        tracing::debug!(
            server = %client.server_hostname,
            esmtp = client.extensions.is_some(),
            "connected"
        );

        Ok(client)
    }
}

/// An SMTP client connection.
///
/// Created through [`ClientBuilder`]; all command methods run under the
/// builder's timeout and surface unexpected replies as [`Error::Smtp`].
pub struct Client {
    conn: Conn,
    server_hostname: String,
    server_name: String,
    local_name: String,
    timeout: Duration,
    tls_config: Option<Arc<ClientConfig>>,
    accept_invalid_certs: bool,
    extensions: Option<Extensions>,
    tls: bool,
}

impl Client {
    /// Connects with the default configuration.
    ///
    /// # Errors
    ///
    /// See [`ClientBuilder::dial`].
    pub async fn dial(addr: &str) -> Result<Self> {
        ClientBuilder::new().dial(addr).await
    }

    /// Sends EHLO, falling back to HELO when the server rejects it with
    /// 500 or 502 (RFC 5321 Section 4.1.1.1).
    async fn ehlo(&mut self) -> Result<()> {
        let reply = self.conn.cmd(&format!("EHLO {}", self.local_name)).await?;

        if reply.code == ReplyCode::OK {
            self.extensions = Some(Extensions::parse_ehlo_response(&reply.lines));
            return Ok(());
        }

        if reply.code == ReplyCode::SYNTAX_ERROR || reply.code == ReplyCode::NOT_IMPLEMENTED {
            let reply = self.conn.cmd(&format!("HELO {}", self.local_name)).await?;
            if reply.code != ReplyCode::OK {
                return Err(reply_to_error(reply));
            }
            self.extensions = None;
            return Ok(());
        }

        Err(reply_to_error(reply))
    }

    /// The hostname the server announced in its greeting.
    #[must_use]
    pub fn server_hostname(&self) -> &str {
        &self.server_hostname
    }

    /// The extensions from the last EHLO response, or `None` when the
    /// server only speaks HELO.
    #[must_use]
    pub const fn extensions(&self) -> Option<&Extensions> {
        self.extensions.as_ref()
    }

    /// Whether the connection has been upgraded to TLS.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        self.tls
    }

    /// The SIZE limit advertised by the server, or 0 when absent.
    #[must_use]
    pub fn server_max_size(&self) -> u64 {
        self.extensions
            .as_ref()
            .and_then(Extensions::max_message_size)
            .unwrap_or(0)
    }

    async fn exchange(&mut self, command: &str, expect: ReplyCode) -> Result<Reply> {
        let reply = timeout(self.timeout, self.conn.cmd(command)).await??;
        if reply.code == expect {
            Ok(reply)
        } else {
            Err(reply_to_error(reply))
        }
    }

    /// Sends MAIL FROM with the given ESMTP parameters.
    ///
    /// # Errors
    ///
    /// [`Error::Smtp`] for any reply other than 250.
    pub async fn mail(&mut self, from: &ReversePath, opts: &MailOptions) -> Result<()> {
        let mut command = format!("MAIL FROM:{from}");
        opts.append_to(&mut command);
        self.exchange(&command, ReplyCode::OK).await?;
        Ok(())
    }

    /// Sends RCPT TO with the given DSN parameters.
    ///
    /// # Errors
    ///
    /// [`Error::Smtp`] for any reply other than 250.
    pub async fn rcpt(&mut self, to: &ForwardPath, opts: &RcptOptions) -> Result<()> {
        let mut command = format!("RCPT TO:{to}");
        opts.append_to(&mut command);
        self.exchange(&command, ReplyCode::OK).await?;
        Ok(())
    }

    /// Sends DATA and streams the body through the dot-stuffing writer.
    /// The body is not sent unless the server answers 354.
    ///
    /// # Errors
    ///
    /// [`Error::Smtp`] when 354 is refused or the final reply is not 250.
    pub async fn data<R: AsyncRead + Unpin>(&mut self, mut body: R) -> Result<()> {
        self.exchange("DATA", ReplyCode::START_MAIL_INPUT).await?;

        let reply = timeout(self.timeout, async {
            let mut writer = self.conn.dot_writer()?;
            let mut buf = [0_u8; 4096];
            loop {
                let n = body.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                writer.write(&buf[..n]).await?;
            }
            writer.close().await?;
            self.conn.read_reply().await
        })
        .await??;

        if reply.code != ReplyCode::OK {
            return Err(reply_to_error(reply));
        }
        Ok(())
    }

    /// Sends one BDAT chunk of exactly `chunk.len()` raw bytes (RFC 3030).
    ///
    /// # Errors
    ///
    /// [`Error::Smtp`] for any reply other than 250.
    pub async fn bdat(&mut self, chunk: &[u8], last: bool) -> Result<()> {
        let command = if last {
            format!("BDAT {} LAST", chunk.len())
        } else {
            format!("BDAT {}", chunk.len())
        };

        let reply = timeout(self.timeout, async {
            self.conn.write_line(&command).await?;
            self.conn.write_raw(chunk).await?;
            self.conn.read_reply().await
        })
        .await??;

        if reply.code != ReplyCode::OK {
            return Err(reply_to_error(reply));
        }
        Ok(())
    }

    /// Aborts the current mail transaction.
    ///
    /// # Errors
    ///
    /// [`Error::Smtp`] for any reply other than 250.
    pub async fn rset(&mut self) -> Result<()> {
        self.exchange("RSET", ReplyCode::OK).await?;
        Ok(())
    }

    /// Sends a NOOP keepalive.
    ///
    /// # Errors
    ///
    /// [`Error::Smtp`] for any reply other than 250.
    pub async fn noop(&mut self) -> Result<()> {
        self.exchange("NOOP", ReplyCode::OK).await?;
        Ok(())
    }

    /// Asks the server to verify an address. Servers commonly answer 252
    /// without revealing anything; the raw reply is returned.
    ///
    /// # Errors
    ///
    /// [`Error::Smtp`] for 4xx/5xx replies.
    pub async fn vrfy(&mut self, param: &str) -> Result<Reply> {
        let reply = timeout(self.timeout, self.conn.cmd(&format!("VRFY {param}"))).await??;
        if reply.code.is_positive() {
            Ok(reply)
        } else {
            Err(reply_to_error(reply))
        }
    }

    /// Upgrades the connection with STARTTLS (RFC 3207) and re-issues
    /// EHLO so the extension list reflects the secured channel.
    ///
    /// # Errors
    ///
    /// [`Error::Smtp`] when the server refuses, [`Error::Tls`] or
    /// [`Error::Io`] when the handshake fails; the connection is then
    /// unusable.
    pub async fn starttls(&mut self) -> Result<()> {
        self.exchange("STARTTLS", ReplyCode::SERVICE_READY).await?;

        let config = self.effective_tls_config();
        let connector = TlsConnector::from(config);
        let server_name = ServerName::try_from(self.server_name.clone())
            .map_err(|err| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, err)))?;

        timeout(self.timeout, self.conn.upgrade_client(&connector, server_name)).await??;
        self.tls = true;
        tracing::debug!(server = %self.server_name, "connection upgraded to TLS");

        timeout(self.timeout, self.ehlo()).await?
    }

    fn effective_tls_config(&self) -> Arc<ClientConfig> {
        if let Some(config) = &self.tls_config {
            return Arc::clone(config);
        }

        if self.accept_invalid_certs {
            let config = ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth();
            return Arc::new(config);
        }

        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            let _ = roots.add(cert);
        }
        if !native.errors.is_empty() {
            tracing::warn!(errors = ?native.errors, "some platform certificates failed to load");
        }

        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }

    /// Runs a SASL exchange (RFC 4954): the mechanism's initial response
    /// on the AUTH line, then one response per 334 challenge. When the
    /// mechanism cannot continue, the exchange is cancelled with `*`.
    ///
    /// # Errors
    ///
    /// [`Error::Smtp`] for a server rejection, [`Error::Sasl`] when the
    /// mechanism fails mid-exchange.
    pub async fn auth(&mut self, mechanism: &mut dyn Mechanism) -> Result<()> {
        use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

        let command = match mechanism.start()? {
            Some(initial) => format!("AUTH {} {}", mechanism.name(), BASE64.encode(initial)),
            None => format!("AUTH {}", mechanism.name()),
        };

        timeout(self.timeout, async {
            self.conn.write_line(&command).await?;

            loop {
                let reply = self.conn.read_reply().await?;

                if reply.code == ReplyCode::AUTH_OK {
                    return Ok(());
                }
                if reply.code != ReplyCode::AUTH_CONTINUE {
                    return Err(reply_to_error(reply));
                }

                let challenge = reply.lines.first().map_or("", String::as_str);
                let challenge = BASE64
                    .decode(challenge)
                    .map_err(|err| Error::Sasl(format!("invalid challenge encoding: {err}")))?;

                match mechanism.next(&challenge) {
                    Ok(response) => {
                        self.conn.write_line(&BASE64.encode(response)).await?;
                    }
                    Err(err) => {
                        // Abort the exchange and consume the final reply.
                        self.conn.write_line("*").await.ok();
                        self.conn.read_reply().await.ok();
                        return Err(err);
                    }
                }
            }
        })
        .await?
    }

    /// MAIL, one RCPT per recipient, then DATA.
    ///
    /// # Errors
    ///
    /// The first failing step's error.
    pub async fn send_mail<R: AsyncRead + Unpin>(
        &mut self,
        from: &ReversePath,
        to: &[ForwardPath],
        body: R,
    ) -> Result<()> {
        self.mail(from, &MailOptions::new()).await?;
        for rcpt in to {
            self.rcpt(rcpt, &RcptOptions::new()).await?;
        }
        self.data(body).await
    }

    /// The message submission workflow (RFC 6409): STARTTLS when the
    /// server offers it and the connection is still plaintext, then AUTH,
    /// then the mail transaction.
    ///
    /// # Errors
    ///
    /// The first failing step's error.
    pub async fn submit_message<R: AsyncRead + Unpin>(
        &mut self,
        mechanism: &mut dyn Mechanism,
        from: &ReversePath,
        to: &[ForwardPath],
        body: R,
    ) -> Result<()> {
        let starttls_available = self
            .extensions
            .as_ref()
            .is_some_and(|exts| exts.has(extensions::STARTTLS));

        if !self.tls
            && starttls_available
            && (self.tls_config.is_some() || self.accept_invalid_certs)
        {
            self.starttls().await?;
        }

        self.auth(mechanism).await?;
        self.send_mail(from, to, body).await
    }

    /// Sends QUIT (best effort) and closes the connection.
    pub async fn close(mut self) {
        if let Ok(Ok(reply)) = timeout(self.timeout, self.conn.cmd("QUIT")).await {
            if reply.code != ReplyCode::SERVICE_CLOSING {
                tracing::debug!(code = %reply.code, "unexpected QUIT reply");
            }
        }
        self.conn.shutdown().await.ok();
    }
}

/// Converts an unexpected reply into an [`Error::Smtp`], lifting the
/// enhanced status code off the first line when one is present.
fn reply_to_error(reply: Reply) -> Error {
    let (enhanced, first_rest) = reply
        .lines
        .first()
        .map_or((EnhancedCode::zero(), ""), |line| parse_enhanced_code(line));

    let message = if enhanced.is_zero() {
        reply.text()
    } else {
        let mut lines: Vec<&str> = reply.lines.iter().map(String::as_str).collect();
        lines[0] = first_rest;
        lines.join("\n")
    };

    Error::Smtp(SmtpError::new(reply.code, enhanced, message))
}

/// Accepts any certificate. Used when the builder was configured with
/// [`ClientBuilder::danger_accept_invalid_certs`].
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}
