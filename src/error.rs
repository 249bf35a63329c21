//! Error types shared by the client and server halves of the crate.

use core::fmt::{self, Display, Formatter};
use std::io;

use thiserror::Error;

use crate::{address::AddressError, enhanced::EnhancedCode, reply::ReplyCode};

/// An SMTP protocol error: a reply code, an optional enhanced status code,
/// and human-readable text.
///
/// Carries enough to render a full on-wire reply. A message containing
/// embedded newlines renders as a multi-line reply with the enhanced code
/// repeated on every line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpError {
    pub code: ReplyCode,
    pub enhanced: EnhancedCode,
    pub message: String,
}

impl SmtpError {
    /// Creates a protocol error.
    pub fn new(code: ReplyCode, enhanced: EnhancedCode, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced,
            message: message.into(),
        }
    }

    /// Returns `true` for 4xx codes (the failure may clear on retry).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.code.is_transient()
    }

    /// Renders the reply text lines, one per line of the message, each
    /// prefixed with the enhanced code when one is present. The reply code
    /// itself is added by the wire writer.
    #[must_use]
    pub fn reply_lines(&self) -> Vec<String> {
        let message = if self.message.is_empty() {
            "Error"
        } else {
            &self.message
        };

        message
            .split('\n')
            .map(|line| {
                if self.enhanced.is_zero() {
                    line.to_owned()
                } else {
                    format!("{} {line}", self.enhanced)
                }
            })
            .collect()
    }
}

impl Display for SmtpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.enhanced.is_zero() {
            write!(f, "{} {}", self.code, self.message)
        } else {
            write!(f, "{} {} {}", self.code, self.enhanced, self.message)
        }
    }
}

impl std::error::Error for SmtpError {}

/// Errors raised by the wire codec while framing lines and replies.
#[derive(Debug, Error)]
pub enum FrameError {
    /// A line exceeded the maximum length for its kind.
    #[error("line too long ({length} bytes, max {max})")]
    LineTooLong { length: usize, max: usize },

    /// A line was not valid UTF-8.
    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    /// A reply line was shorter than the three-digit code.
    #[error("reply line too short: {0:?}")]
    ReplyTooShort(String),

    /// The first three characters of a reply line were not a number.
    #[error("invalid reply code: {0:?}")]
    InvalidReplyCode(String),

    /// The byte after the reply code was neither space nor hyphen.
    #[error("invalid reply separator: {0:?}")]
    InvalidReplySeparator(char),

    /// A continuation line changed the reply code mid-reply.
    #[error("reply code changed mid-reply: expected {expected}, got {got}")]
    CodeMismatch { expected: u16, got: u16 },
}

/// The crate-wide error type.
///
/// Client operations surface every failure through this enum;
/// [`Error::is_transient`] classifies them for retry decisions.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS configuration or handshake error.
    #[error("TLS error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    /// Malformed data on the wire.
    #[error("protocol framing error: {0}")]
    Frame(#[from] FrameError),

    /// The peer answered with a negative or unexpected reply.
    #[error("server replied {0}")]
    Smtp(#[from] SmtpError),

    /// An envelope address failed to parse.
    #[error("invalid address: {0}")]
    Address(#[from] AddressError),

    /// The server's STARTTLS material could not be loaded.
    #[error("TLS configuration: {0}")]
    TlsConfig(#[from] crate::server::TlsError),

    /// A SASL mechanism could not produce a response.
    #[error("authentication exchange failed: {0}")]
    Sasl(String),

    /// A deadline elapsed before the operation completed.
    #[error("operation timed out")]
    Timeout,
}

impl Error {
    /// Returns `true` when retrying later may succeed: transport failures,
    /// timeouts, and 4xx replies.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(_) | Self::Timeout => true,
            Self::Smtp(err) => err.is_transient(),
            Self::Tls(_) | Self::TlsConfig(_) | Self::Frame(_) | Self::Address(_) | Self::Sasl(_) => {
                false
            }
        }
    }

    /// The SMTP reply code carried by this error, if any.
    #[must_use]
    pub const fn reply_code(&self) -> Option<ReplyCode> {
        match self {
            Self::Smtp(err) => Some(err.code),
            _ => None,
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}

/// Specialized `Result` for crate operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_enhanced() {
        let err = SmtpError::new(ReplyCode::MAILBOX_NOT_FOUND, EnhancedCode::new(5, 1, 1), "No such user");
        assert_eq!(err.to_string(), "550 5.1.1 No such user");
    }

    #[test]
    fn display_without_enhanced() {
        let err = SmtpError::new(ReplyCode::SERVICE_READY, EnhancedCode::zero(), "Ready");
        assert_eq!(err.to_string(), "220 Ready");
    }

    #[test]
    fn reply_lines_single() {
        let err = SmtpError::new(ReplyCode::MAILBOX_BUSY, EnhancedCode::new(4, 2, 1), "Busy");
        assert_eq!(err.reply_lines(), vec!["4.2.1 Busy"]);
    }

    #[test]
    fn reply_lines_multi_repeat_enhanced() {
        let err = SmtpError::new(
            ReplyCode::MAILBOX_NOT_FOUND,
            EnhancedCode::new(5, 7, 1),
            "Spam detected\nContact postmaster",
        );
        assert_eq!(
            err.reply_lines(),
            vec!["5.7.1 Spam detected", "5.7.1 Contact postmaster"]
        );
    }

    #[test]
    fn reply_lines_empty_message() {
        let err = SmtpError::new(ReplyCode::LOCAL_ERROR, EnhancedCode::zero(), "");
        assert_eq!(err.reply_lines(), vec!["Error"]);
    }

    #[test]
    fn transient_classification() {
        let transient = Error::Smtp(SmtpError::new(
            ReplyCode::SERVICE_NOT_AVAILABLE,
            EnhancedCode::zero(),
            "try later",
        ));
        assert!(transient.is_transient());

        let permanent = Error::Smtp(SmtpError::new(
            ReplyCode::MAILBOX_NOT_FOUND,
            EnhancedCode::zero(),
            "no",
        ));
        assert!(!permanent.is_transient());

        assert!(Error::Timeout.is_transient());
        assert!(Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset")).is_transient());
        assert!(!Error::Sasl("no more steps".into()).is_transient());
    }
}
