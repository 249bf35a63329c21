//! Enhanced mail system status codes (RFC 3463, RFC 2034).

use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// An enhanced status code triple, serialized as `class.subject.detail`.
///
/// The all-zero triple stands for "no enhanced code"; replies carrying it
/// are rendered without an enhanced prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnhancedCode {
    pub class: u16,
    pub subject: u16,
    pub detail: u16,
}

impl EnhancedCode {
    /// 2.0.0: generic success.
    pub const OK: Self = Self::new(2, 0, 0);
    /// 2.1.0: other address status (originator accepted).
    pub const SENDER_OK: Self = Self::new(2, 1, 0);
    /// 2.1.5: destination address valid.
    pub const RECIPIENT_OK: Self = Self::new(2, 1, 5);
    /// 4.4.0: other network or routing status (transient).
    pub const TRANSIENT_NETWORK: Self = Self::new(4, 4, 0);
    /// 4.3.0: other mail system status (transient); used at shutdown.
    pub const TRANSIENT_SYSTEM: Self = Self::new(4, 3, 0);
    /// 4.5.3: too many recipients (transient).
    pub const TOO_MANY_RECIPIENTS: Self = Self::new(4, 5, 3);
    /// 4.7.0: other security or policy status (transient).
    pub const TRANSIENT_POLICY: Self = Self::new(4, 7, 0);
    /// 5.1.3: bad destination mailbox address syntax.
    pub const BAD_RECIPIENT_SYNTAX: Self = Self::new(5, 1, 3);
    /// 5.1.7: bad sender's mailbox address syntax.
    pub const BAD_SENDER_SYNTAX: Self = Self::new(5, 1, 7);
    /// 5.3.4: message too big for system.
    pub const MESSAGE_TOO_LARGE: Self = Self::new(5, 3, 4);
    /// 5.5.1: invalid command.
    pub const INVALID_COMMAND: Self = Self::new(5, 5, 1);
    /// 5.5.2: syntax error.
    pub const SYNTAX_ERROR: Self = Self::new(5, 5, 2);
    /// 5.5.4: invalid command arguments.
    pub const INVALID_ARGUMENTS: Self = Self::new(5, 5, 4);
    /// 5.7.0: other security or policy status (permanent).
    pub const AUTH_REQUIRED: Self = Self::new(5, 7, 0);
    /// 5.7.8: authentication credentials invalid.
    pub const BAD_CREDENTIALS: Self = Self::new(5, 7, 8);

    /// Creates an enhanced code from its three components.
    #[must_use]
    pub const fn new(class: u16, subject: u16, detail: u16) -> Self {
        Self {
            class,
            subject,
            detail,
        }
    }

    /// The absent-code marker.
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0, 0, 0)
    }

    /// Returns `true` if this is the absent-code marker.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.class == 0 && self.subject == 0 && self.detail == 0
    }
}

impl Display for EnhancedCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}
