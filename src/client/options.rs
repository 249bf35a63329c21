//! ESMTP parameters for the MAIL and RCPT commands.

use core::fmt::{self, Display, Formatter, Write as _};

/// The BODY parameter of MAIL FROM (RFC 6152).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    SevenBit,
    EightBitMime,
}

impl Display for BodyKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SevenBit => "7BIT",
            Self::EightBitMime => "8BITMIME",
        })
    }
}

/// The RET parameter of MAIL FROM for delivery status notifications
/// (RFC 3461): return the full message or only its headers in a bounce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsnReturn {
    Full,
    Headers,
}

impl Display for DsnReturn {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Full => "FULL",
            Self::Headers => "HDRS",
        })
    }
}

/// Optional parameters appended to MAIL FROM.
#[derive(Debug, Clone, Default)]
pub struct MailOptions {
    size: Option<u64>,
    body: Option<BodyKind>,
    smtputf8: bool,
    dsn_return: Option<DsnReturn>,
    envelope_id: Option<String>,
}

impl MailOptions {
    /// No parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the message size in bytes (RFC 1870).
    #[must_use]
    pub const fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Declares the body encoding (RFC 6152).
    #[must_use]
    pub const fn with_body(mut self, body: BodyKind) -> Self {
        self.body = Some(body);
        self
    }

    /// Requests UTF-8 envelope handling (RFC 6531).
    #[must_use]
    pub const fn with_smtputf8(mut self) -> Self {
        self.smtputf8 = true;
        self
    }

    /// Sets the DSN RET parameter (RFC 3461).
    #[must_use]
    pub const fn with_dsn_return(mut self, ret: DsnReturn) -> Self {
        self.dsn_return = Some(ret);
        self
    }

    /// Sets the DSN ENVID parameter (RFC 3461).
    #[must_use]
    pub fn with_envelope_id(mut self, envid: impl Into<String>) -> Self {
        self.envelope_id = Some(envid.into());
        self
    }

    pub(crate) fn append_to(&self, command: &mut String) {
        if let Some(size) = self.size {
            let _ = write!(command, " SIZE={size}");
        }
        if let Some(body) = self.body {
            let _ = write!(command, " BODY={body}");
        }
        if self.smtputf8 {
            command.push_str(" SMTPUTF8");
        }
        if let Some(ret) = self.dsn_return {
            let _ = write!(command, " RET={ret}");
        }
        if let Some(envid) = &self.envelope_id {
            let _ = write!(command, " ENVID={envid}");
        }
    }
}

/// Optional parameters appended to RCPT TO.
#[derive(Debug, Clone, Default)]
pub struct RcptOptions {
    notify: Option<String>,
    original_recipient: Option<String>,
}

impl RcptOptions {
    /// No parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the DSN NOTIFY parameter, e.g. `"SUCCESS,FAILURE"` or
    /// `"NEVER"` (RFC 3461).
    #[must_use]
    pub fn with_notify(mut self, notify: impl Into<String>) -> Self {
        self.notify = Some(notify.into());
        self
    }

    /// Sets the DSN ORCPT parameter, e.g. `"rfc822;user@example.com"`
    /// (RFC 3461).
    #[must_use]
    pub fn with_original_recipient(mut self, orcpt: impl Into<String>) -> Self {
        self.original_recipient = Some(orcpt.into());
        self
    }

    pub(crate) fn append_to(&self, command: &mut String) {
        if let Some(notify) = &self.notify {
            let _ = write!(command, " NOTIFY={notify}");
        }
        if let Some(orcpt) = &self.original_recipient {
            let _ = write!(command, " ORCPT={orcpt}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_options_append_nothing() {
        let mut command = String::from("MAIL FROM:<a@x>");
        MailOptions::new().append_to(&mut command);
        assert_eq!(command, "MAIL FROM:<a@x>");
    }

    #[test]
    fn mail_parameters_in_order() {
        let mut command = String::from("MAIL FROM:<a@x>");
        MailOptions::new()
            .with_size(1000)
            .with_body(BodyKind::EightBitMime)
            .with_smtputf8()
            .with_dsn_return(DsnReturn::Headers)
            .with_envelope_id("abc123")
            .append_to(&mut command);
        assert_eq!(
            command,
            "MAIL FROM:<a@x> SIZE=1000 BODY=8BITMIME SMTPUTF8 RET=HDRS ENVID=abc123"
        );
    }

    #[test]
    fn rcpt_parameters() {
        let mut command = String::from("RCPT TO:<b@y>");
        RcptOptions::new()
            .with_notify("SUCCESS,FAILURE")
            .with_original_recipient("rfc822;b@y")
            .append_to(&mut command);
        assert_eq!(
            command,
            "RCPT TO:<b@y> NOTIFY=SUCCESS,FAILURE ORCPT=rfc822;b@y"
        );
    }
}
