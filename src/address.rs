//! RFC 5321 envelope address types and parsing.
//!
//! Implements the path grammar of RFC 5321 Section 4.1.2:
//!
//! ```text
//! Reverse-path   = Path / "<>"
//! Forward-path   = Path
//! Path           = "<" Mailbox ">"
//! Mailbox        = Local-part "@" ( Domain / address-literal )
//! Local-part     = Dot-string / Quoted-string
//! ```
//!
//! Domains may contain code points above U+007F for internationalized
//! names (RFC 6531). Wire serialization always emits angle brackets.

use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of a local-part in octets (RFC 5321 Section 4.5.3.1.1).
const MAX_LOCAL_PART: usize = 64;

/// Maximum length of a domain in octets (RFC 5321 Section 4.5.3.1.2).
const MAX_DOMAIN: usize = 255;

/// Maximum length of a single domain label.
const MAX_LABEL: usize = 63;

/// Errors produced while parsing an envelope address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("empty address")]
    Empty,
    #[error("missing '@' in address")]
    MissingAtSign,
    #[error("empty local-part")]
    EmptyLocalPart,
    #[error("local-part exceeds {MAX_LOCAL_PART} octets")]
    LocalPartTooLong,
    #[error("invalid character in local-part")]
    InvalidLocalPart,
    #[error("malformed dot-string in local-part")]
    InvalidDotString,
    #[error("malformed quoted-string in local-part")]
    InvalidQuotedString,
    #[error("empty domain")]
    EmptyDomain,
    #[error("domain exceeds {MAX_DOMAIN} octets")]
    DomainTooLong,
    #[error("unclosed address literal")]
    UnclosedAddressLiteral,
    #[error("malformed domain label")]
    InvalidDomainLabel,
    #[error("empty forward path")]
    EmptyForwardPath,
}

/// An email address split into local-part and domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mailbox {
    local_part: String,
    domain: String,
}

impl Mailbox {
    /// Parses a bare `local-part@domain` address (no angle brackets).
    ///
    /// # Errors
    ///
    /// Returns an [`AddressError`] describing the first grammar violation.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        if s.is_empty() {
            return Err(AddressError::Empty);
        }

        // The local-part may contain a quoted '@', so split on the last one.
        let at = s.rfind('@').ok_or(AddressError::MissingAtSign)?;
        let (local_part, domain) = (&s[..at], &s[at + 1..]);

        validate_local_part(local_part)?;
        validate_domain(domain)?;

        Ok(Self {
            local_part: local_part.to_owned(),
            domain: domain.to_owned(),
        })
    }

    /// The part before the `@`.
    #[must_use]
    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    /// The part after the `@`.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl Display for Mailbox {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

/// The MAIL FROM path: either a mailbox or the null path `<>` used for
/// bounce notifications.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReversePath {
    Null,
    Mailbox(Mailbox),
}

impl ReversePath {
    /// Parses a reverse path, accepting `<>`, `<local@domain>`, or a bare
    /// `local@domain`.
    ///
    /// # Errors
    ///
    /// Returns an [`AddressError`] if the inner mailbox is malformed.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let s = s.trim();

        if s == "<>" {
            return Ok(Self::Null);
        }

        let inner = strip_angles(s);
        if inner.is_empty() {
            return Ok(Self::Null);
        }

        Mailbox::parse(inner).map(Self::Mailbox)
    }

    /// Returns `true` for the null path.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The inner mailbox, unless this is the null path.
    #[must_use]
    pub const fn mailbox(&self) -> Option<&Mailbox> {
        match self {
            Self::Null => None,
            Self::Mailbox(mailbox) => Some(mailbox),
        }
    }
}

impl Display for ReversePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("<>"),
            Self::Mailbox(mailbox) => write!(f, "<{mailbox}>"),
        }
    }
}

impl From<Mailbox> for ReversePath {
    fn from(mailbox: Mailbox) -> Self {
        Self::Mailbox(mailbox)
    }
}

/// The RCPT TO path. The null path is not permitted here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardPath(pub Mailbox);

impl ForwardPath {
    /// Parses a forward path, accepting `<local@domain>` or a bare
    /// `local@domain`. An empty path is rejected.
    ///
    /// # Errors
    ///
    /// Returns an [`AddressError`] if the path is empty or malformed.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let s = s.trim();

        let inner = strip_angles(s);
        if inner.is_empty() {
            return Err(AddressError::EmptyForwardPath);
        }

        Mailbox::parse(inner).map(Self)
    }

    /// The recipient mailbox.
    #[must_use]
    pub const fn mailbox(&self) -> &Mailbox {
        &self.0
    }
}

impl Display for ForwardPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

impl From<Mailbox> for ForwardPath {
    fn from(mailbox: Mailbox) -> Self {
        Self(mailbox)
    }
}

fn strip_angles(s: &str) -> &str {
    s.strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(s)
}

fn validate_local_part(local: &str) -> Result<(), AddressError> {
    if local.is_empty() {
        return Err(AddressError::EmptyLocalPart);
    }
    if local.len() > MAX_LOCAL_PART {
        return Err(AddressError::LocalPartTooLong);
    }

    if local.len() >= 2 && local.starts_with('"') && local.ends_with('"') {
        return validate_quoted_string(&local[1..local.len() - 1]);
    }

    validate_dot_string(local)
}

fn validate_dot_string(s: &str) -> Result<(), AddressError> {
    if s.starts_with('.') || s.ends_with('.') || s.contains("..") {
        return Err(AddressError::InvalidDotString);
    }

    if s.chars().all(|c| c == '.' || is_atext(c)) {
        Ok(())
    } else {
        Err(AddressError::InvalidLocalPart)
    }
}

/// atext per RFC 5321 Section 4.1.2.
fn is_atext(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '-'
                | '/'
                | '='
                | '?'
                | '^'
                | '_'
                | '`'
                | '{'
                | '|'
                | '}'
                | '~'
        )
}

fn validate_quoted_string(s: &str) -> Result<(), AddressError> {
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                // The escaped character must exist.
                if chars.next().is_none() {
                    return Err(AddressError::InvalidQuotedString);
                }
            }
            '"' => return Err(AddressError::InvalidQuotedString),
            _ => {}
        }
    }
    Ok(())
}

fn validate_domain(domain: &str) -> Result<(), AddressError> {
    if domain.is_empty() {
        return Err(AddressError::EmptyDomain);
    }
    if domain.len() > MAX_DOMAIN {
        return Err(AddressError::DomainTooLong);
    }

    // Address literal: accepted without deep validation of the inner form.
    if domain.starts_with('[') {
        return if domain.ends_with(']') {
            Ok(())
        } else {
            Err(AddressError::UnclosedAddressLiteral)
        };
    }

    if domain.starts_with('.') || domain.ends_with('.') {
        return Err(AddressError::InvalidDomainLabel);
    }

    for label in domain.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL {
            return Err(AddressError::InvalidDomainLabel);
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(AddressError::InvalidDomainLabel);
        }
        if !label.chars().all(is_domain_char) {
            return Err(AddressError::InvalidDomainLabel);
        }
    }

    Ok(())
}

/// Letters, digits, hyphen, and anything above ASCII (RFC 6531).
fn is_domain_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || !c.is_ascii()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_mailbox() {
        let mailbox = Mailbox::parse("user@example.com").unwrap();
        assert_eq!(mailbox.local_part(), "user");
        assert_eq!(mailbox.domain(), "example.com");
        assert_eq!(mailbox.to_string(), "user@example.com");
    }

    #[test]
    fn specials_in_local_part() {
        for addr in [
            "user+tag@example.com",
            "first.last@example.com",
            "!#$%&'*+-/=?^_`{|}~@example.com",
        ] {
            assert!(Mailbox::parse(addr).is_ok(), "{addr} should parse");
        }
    }

    #[test]
    fn quoted_local_part() {
        assert!(Mailbox::parse(r#""john doe"@example.com"#).is_ok());
        assert!(Mailbox::parse(r#""john\"doe"@example.com"#).is_ok());
        assert!(Mailbox::parse(r#""trailing\"@example.com"#).is_err());
    }

    #[test]
    fn local_part_rejections() {
        assert_eq!(Mailbox::parse("@example.com"), Err(AddressError::EmptyLocalPart));
        assert_eq!(
            Mailbox::parse(".user@example.com"),
            Err(AddressError::InvalidDotString)
        );
        assert_eq!(
            Mailbox::parse("us..er@example.com"),
            Err(AddressError::InvalidDotString)
        );
        assert_eq!(
            Mailbox::parse("us er@example.com"),
            Err(AddressError::InvalidLocalPart)
        );

        let long = format!("{}@example.com", "a".repeat(65));
        assert_eq!(Mailbox::parse(&long), Err(AddressError::LocalPartTooLong));
    }

    #[test]
    fn domain_rejections() {
        assert_eq!(Mailbox::parse("user@"), Err(AddressError::EmptyDomain));
        assert_eq!(
            Mailbox::parse("user@-bad.com"),
            Err(AddressError::InvalidDomainLabel)
        );
        assert_eq!(
            Mailbox::parse("user@bad-.com"),
            Err(AddressError::InvalidDomainLabel)
        );
        assert_eq!(
            Mailbox::parse("user@a..b"),
            Err(AddressError::InvalidDomainLabel)
        );
        assert_eq!(
            Mailbox::parse("user@.example.com"),
            Err(AddressError::InvalidDomainLabel)
        );

        let long = format!("user@{}", "a.".repeat(130));
        assert_eq!(Mailbox::parse(&long), Err(AddressError::DomainTooLong));
    }

    #[test]
    fn internationalized_domain() {
        assert!(Mailbox::parse("user@bücher.example").is_ok());
    }

    #[test]
    fn address_literal_domain() {
        assert!(Mailbox::parse("user@[127.0.0.1]").is_ok());
        assert!(Mailbox::parse("user@[IPv6:::1]").is_ok());
        assert_eq!(
            Mailbox::parse("user@[127.0.0.1"),
            Err(AddressError::UnclosedAddressLiteral)
        );
    }

    #[test]
    fn reverse_path_null() {
        assert_eq!(ReversePath::parse("<>"), Ok(ReversePath::Null));
        assert_eq!(ReversePath::parse("  <>  "), Ok(ReversePath::Null));
        assert_eq!(ReversePath::Null.to_string(), "<>");
        assert!(ReversePath::Null.is_null());
    }

    #[test]
    fn reverse_path_forms() {
        let bracketed = ReversePath::parse("<a@x.test>").unwrap();
        let bare = ReversePath::parse("a@x.test").unwrap();
        assert_eq!(bracketed, bare);
        assert_eq!(bracketed.to_string(), "<a@x.test>");
    }

    #[test]
    fn forward_path_rejects_null() {
        assert_eq!(ForwardPath::parse("<>"), Err(AddressError::EmptyForwardPath));
        assert_eq!(ForwardPath::parse(""), Err(AddressError::EmptyForwardPath));
    }

    #[test]
    fn forward_path_forms() {
        let path = ForwardPath::parse("<b@y.test>").unwrap();
        assert_eq!(path.mailbox().local_part(), "b");
        assert_eq!(path.to_string(), "<b@y.test>");
        assert_eq!(ForwardPath::parse("b@y.test").unwrap(), path);
    }
}
