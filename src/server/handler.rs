//! Application callbacks invoked by the server session.
//!
//! Every handler is optional. Returning an [`Error::Smtp`] makes the
//! server send that exact reply (multi-line when the message contains
//! newlines); any other error is reported to the client as
//! `451 4.4.0 Internal error`. Handlers run inside the session task, so
//! their latency directly delays the next command on that connection,
//! and they must be safe to call from concurrently running sessions.
//!
//! [`Error::Smtp`]: crate::Error::Smtp

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::{
    address::{ForwardPath, ReversePath},
    error::Result,
};

/// Called when a client connects, before the greeting banner. An error
/// refuses the connection.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn on_connect(&self, remote: SocketAddr) -> Result<()>;
}

/// Called on EHLO/HELO with the name the client announced.
#[async_trait]
pub trait HeloHandler: Send + Sync {
    async fn on_helo(&self, client_name: &str) -> Result<()>;
}

/// Called on MAIL FROM with the parsed reverse path.
#[async_trait]
pub trait MailHandler: Send + Sync {
    async fn on_mail(&self, from: &ReversePath) -> Result<()>;
}

/// Called on each RCPT TO with the parsed forward path.
#[async_trait]
pub trait RcptHandler: Send + Sync {
    async fn on_rcpt(&self, to: &ForwardPath) -> Result<()>;
}

/// Called with the message body once DATA or the final BDAT chunk
/// arrives. For DATA the reader streams the destuffed body directly off
/// the wire; bytes the handler does not consume are drained afterwards.
#[async_trait]
pub trait DataHandler: Send + Sync {
    async fn on_data(
        &self,
        from: &ReversePath,
        to: &[ForwardPath],
        body: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()>;
}

/// Called whenever the transaction state is wiped: RSET, EHLO/HELO
/// re-issue, STARTTLS, or completion of a DATA/BDAT transaction.
#[async_trait]
pub trait ResetHandler: Send + Sync {
    async fn on_reset(&self);
}

/// Called on VRFY. The returned text is sent in a 250 reply; without a
/// handler the server answers 252 without revealing anything.
#[async_trait]
pub trait VrfyHandler: Send + Sync {
    async fn on_vrfy(&self, param: &str) -> Result<String>;
}

/// Verifies AUTH credentials. `mechanism` is `"PLAIN"`, `"LOGIN"`, or
/// `"CRAM-MD5"`. For CRAM-MD5 the password field carries
/// `challenge:digest` so the application can recompute the HMAC against
/// its stored secret.
#[async_trait]
pub trait AuthHandler: Send + Sync {
    async fn authenticate(&self, mechanism: &str, username: &str, password: &str) -> Result<()>;
}
