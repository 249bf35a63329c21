//! SMTP reply codes (RFC 5321 Section 4.2).

use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// A three-digit SMTP reply code.
///
/// The first digit is the reply class: 2xx and 3xx are positive, 4xx is a
/// transient failure, and 5xx is a permanent failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplyCode(u16);

impl ReplyCode {
    /// 211 System status.
    pub const SYSTEM_STATUS: Self = Self(211);
    /// 214 Help message.
    pub const HELP_MESSAGE: Self = Self(214);
    /// 220 Service ready.
    pub const SERVICE_READY: Self = Self(220);
    /// 221 Service closing transmission channel.
    pub const SERVICE_CLOSING: Self = Self(221);
    /// 235 Authentication successful (RFC 4954).
    pub const AUTH_OK: Self = Self(235);
    /// 250 Requested mail action okay, completed.
    pub const OK: Self = Self(250);
    /// 251 User not local; will forward.
    pub const USER_NOT_LOCAL: Self = Self(251);
    /// 252 Cannot VRFY user, but will accept message.
    pub const CANNOT_VRFY: Self = Self(252);
    /// 334 Server challenge during AUTH (RFC 4954).
    pub const AUTH_CONTINUE: Self = Self(334);
    /// 354 Start mail input.
    pub const START_MAIL_INPUT: Self = Self(354);
    /// 421 Service not available, closing transmission channel.
    pub const SERVICE_NOT_AVAILABLE: Self = Self(421);
    /// 450 Mailbox unavailable (busy).
    pub const MAILBOX_BUSY: Self = Self(450);
    /// 451 Local error in processing.
    pub const LOCAL_ERROR: Self = Self(451);
    /// 452 Insufficient system storage.
    pub const INSUFFICIENT_STORAGE: Self = Self(452);
    /// 454 Temporary authentication failure (RFC 4954).
    pub const TEMP_AUTH_FAILURE: Self = Self(454);
    /// 500 Syntax error, command unrecognized.
    pub const SYNTAX_ERROR: Self = Self(500);
    /// 501 Syntax error in parameters or arguments.
    pub const PARAM_SYNTAX_ERROR: Self = Self(501);
    /// 502 Command not implemented.
    pub const NOT_IMPLEMENTED: Self = Self(502);
    /// 503 Bad sequence of commands.
    pub const BAD_SEQUENCE: Self = Self(503);
    /// 504 Command parameter not implemented.
    pub const PARAM_NOT_IMPLEMENTED: Self = Self(504);
    /// 530 Authentication required (RFC 4954).
    pub const AUTH_REQUIRED: Self = Self(530);
    /// 535 Authentication credentials invalid (RFC 4954).
    pub const AUTH_FAILED: Self = Self(535);
    /// 550 Mailbox unavailable (not found, access denied).
    pub const MAILBOX_NOT_FOUND: Self = Self(550);
    /// 551 User not local; please try forward path.
    pub const USER_NOT_LOCAL_TRY: Self = Self(551);
    /// 552 Exceeded storage allocation.
    pub const EXCEEDED_STORAGE: Self = Self(552);
    /// 553 Mailbox name not allowed.
    pub const MAILBOX_NAME_INVALID: Self = Self(553);
    /// 554 Transaction failed.
    pub const TRANSACTION_FAILED: Self = Self(554);
    /// 555 MAIL/RCPT parameters not recognized or not implemented.
    pub const MAIL_RCPT_PARAM_ERROR: Self = Self(555);

    /// Creates a reply code from its numeric value.
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Returns the numeric value of the code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns the reply class, i.e. the first digit of the code.
    #[must_use]
    pub const fn class(self) -> u16 {
        self.0 / 100
    }

    /// Returns `true` for 2xx and 3xx codes.
    #[must_use]
    pub const fn is_positive(self) -> bool {
        matches!(self.class(), 2 | 3)
    }

    /// Returns `true` for 4xx codes (temporary failures).
    #[must_use]
    pub const fn is_transient(self) -> bool {
        self.class() == 4
    }

    /// Returns `true` for 5xx codes (permanent failures).
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        self.class() == 5
    }
}

impl Display for ReplyCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for ReplyCode {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes() {
        assert_eq!(ReplyCode::OK.class(), 2);
        assert_eq!(ReplyCode::START_MAIL_INPUT.class(), 3);
        assert_eq!(ReplyCode::SERVICE_NOT_AVAILABLE.class(), 4);
        assert_eq!(ReplyCode::SYNTAX_ERROR.class(), 5);
    }

    #[test]
    fn positive_codes() {
        assert!(ReplyCode::SERVICE_READY.is_positive());
        assert!(ReplyCode::AUTH_CONTINUE.is_positive());
        assert!(ReplyCode::START_MAIL_INPUT.is_positive());
        assert!(!ReplyCode::MAILBOX_BUSY.is_positive());
        assert!(!ReplyCode::MAILBOX_NOT_FOUND.is_positive());
    }

    #[test]
    fn transient_and_permanent() {
        assert!(ReplyCode::SERVICE_NOT_AVAILABLE.is_transient());
        assert!(ReplyCode::TEMP_AUTH_FAILURE.is_transient());
        assert!(!ReplyCode::SERVICE_NOT_AVAILABLE.is_permanent());

        assert!(ReplyCode::AUTH_FAILED.is_permanent());
        assert!(ReplyCode::TRANSACTION_FAILED.is_permanent());
        assert!(!ReplyCode::AUTH_FAILED.is_transient());
    }

    #[test]
    fn display() {
        assert_eq!(ReplyCode::OK.to_string(), "250");
        assert_eq!(ReplyCode::new(199).to_string(), "199");
    }
}
