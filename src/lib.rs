//! An SMTP client and server library (RFC 5321), offered as reusable
//! protocol machinery: applications attach to the server through handler
//! callbacks and drive the client through command-level calls.
//!
//! Supported extensions: STARTTLS (RFC 3207), AUTH (RFC 4954) with
//! PLAIN/LOGIN/CRAM-MD5, submission mode (RFC 6409), SIZE (RFC 1870),
//! PIPELINING (RFC 2920), 8BITMIME (RFC 6152), DSN (RFC 3461),
//! ENHANCEDSTATUSCODES (RFC 2034), SMTPUTF8 (RFC 6531), and
//! CHUNKING/BDAT (RFC 3030).
//!
//! Not covered here: DNS/MX routing, queueing, message parsing,
//! certificate provisioning, and implicit-TLS listening (pre-wrap the
//! connection and use [`ClientBuilder::handshake`] instead).
//!
//! # Sending a message
//!
//! ```no_run
//! use postrider::{
//!     address::{ForwardPath, ReversePath},
//!     client::Client,
//! };
//!
//! # async fn send() -> postrider::Result<()> {
//! let mut client = Client::dial("mail.example.com:587").await?;
//!
//! let from = ReversePath::parse("sender@example.org")?;
//! let to = [ForwardPath::parse("rcpt@example.com")?];
//! let body = &b"Subject: hello\r\n\r\nhi there\r\n"[..];
//! client.send_mail(&from, &to, body).await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Serving
//!
//! ```no_run
//! use postrider::server::Server;
//!
//! # async fn serve() -> postrider::Result<()> {
//! let server = Server::builder()
//!     .with_listen_address("0.0.0.0:25")
//!     .with_hostname("mail.example.com")
//!     .build()?;
//! server.listen_and_serve().await
//! # }
//! ```

pub mod address;
pub mod client;
pub mod enhanced;
pub mod error;
pub mod extensions;
pub mod reply;
pub mod sasl;
pub mod server;
pub mod textproto;

pub use address::{AddressError, ForwardPath, Mailbox, ReversePath};
pub use client::{Client, ClientBuilder};
pub use enhanced::EnhancedCode;
pub use error::{Error, FrameError, Result, SmtpError};
pub use extensions::Extensions;
pub use reply::ReplyCode;
pub use server::{Server, ServerBuilder, ServerConfig, TlsContext};

/// Control signal broadcast from the server to its live sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Stop accepting work; sessions answer 421 at the next command.
    Shutdown,
}
