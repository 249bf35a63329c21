//! SMTP service extension keywords and the EHLO keyword table (RFC 5321
//! Section 2.2).

use std::collections::HashMap;

/// STARTTLS (RFC 3207).
pub const STARTTLS: &str = "STARTTLS";
/// AUTH (RFC 4954).
pub const AUTH: &str = "AUTH";
/// SIZE (RFC 1870).
pub const SIZE: &str = "SIZE";
/// PIPELINING (RFC 2920).
pub const PIPELINING: &str = "PIPELINING";
/// 8BITMIME (RFC 6152).
pub const EIGHT_BIT_MIME: &str = "8BITMIME";
/// DSN (RFC 3461).
pub const DSN: &str = "DSN";
/// ENHANCEDSTATUSCODES (RFC 2034).
pub const ENHANCED_STATUS_CODES: &str = "ENHANCEDSTATUSCODES";
/// SMTPUTF8 (RFC 6531).
pub const SMTPUTF8: &str = "SMTPUTF8";
/// CHUNKING / BDAT (RFC 3030).
pub const CHUNKING: &str = "CHUNKING";

/// The extensions a server advertised in its EHLO response, mapped from
/// uppercase keyword to parameter string (e.g. `"AUTH"` → `"PLAIN LOGIN"`).
///
/// Keyword lookup is case-insensitive; unknown keywords are retained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions {
    map: HashMap<String, String>,
}

impl Extensions {
    /// Creates an empty extension set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the lines of a 250 EHLO reply. The first line is the greeting
    /// (hostname) and is skipped; every following line is split at the
    /// first space into keyword and parameter. Duplicate keywords keep the
    /// last occurrence.
    #[must_use]
    pub fn parse_ehlo_response(lines: &[String]) -> Self {
        let mut extensions = Self::new();

        for line in lines.iter().skip(1) {
            let (keyword, params) = match line.split_once(' ') {
                Some((keyword, params)) => (keyword, params),
                None => (line.as_str(), ""),
            };
            extensions
                .map
                .insert(keyword.to_ascii_uppercase(), params.to_owned());
        }

        extensions
    }

    /// Returns `true` if the keyword was advertised.
    #[must_use]
    pub fn has(&self, keyword: &str) -> bool {
        self.map.contains_key(&keyword.to_ascii_uppercase())
    }

    /// Returns the parameter string for a keyword, if advertised.
    #[must_use]
    pub fn param(&self, keyword: &str) -> Option<&str> {
        self.map.get(&keyword.to_ascii_uppercase()).map(String::as_str)
    }

    /// The numeric parameter of the SIZE extension, or `None` when SIZE
    /// was not advertised or carried no parseable value.
    #[must_use]
    pub fn max_message_size(&self) -> Option<u64> {
        self.param(SIZE)?.parse().ok()
    }

    /// Number of advertised keywords.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` when no keywords were advertised.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn skips_greeting_line() {
        let exts = Extensions::parse_ehlo_response(&lines(&["mail.test Hello c.test"]));
        assert!(exts.is_empty());
    }

    #[test]
    fn parses_keywords_and_params() {
        let exts = Extensions::parse_ehlo_response(&lines(&[
            "mail.test Hello c.test",
            "SIZE 10485760",
            "PIPELINING",
            "AUTH PLAIN LOGIN CRAM-MD5",
        ]));

        assert!(exts.has(SIZE));
        assert!(exts.has(PIPELINING));
        assert_eq!(exts.param(AUTH), Some("PLAIN LOGIN CRAM-MD5"));
        assert_eq!(exts.param(PIPELINING), Some(""));
        assert_eq!(exts.max_message_size(), Some(10_485_760));
        assert!(!exts.has(STARTTLS));
    }

    #[test]
    fn keywords_are_case_insensitive() {
        let exts = Extensions::parse_ehlo_response(&lines(&["greeting", "size 100", "8bitmime"]));
        assert!(exts.has("SIZE"));
        assert!(exts.has("Size"));
        assert!(exts.has(EIGHT_BIT_MIME));
        assert_eq!(exts.max_message_size(), Some(100));
    }

    #[test]
    fn unknown_keywords_are_retained() {
        let exts = Extensions::parse_ehlo_response(&lines(&["greeting", "X-CUSTOM flag"]));
        assert!(exts.has("X-CUSTOM"));
        assert_eq!(exts.param("x-custom"), Some("flag"));
    }

    #[test]
    fn duplicate_keyword_last_wins() {
        let exts =
            Extensions::parse_ehlo_response(&lines(&["greeting", "SIZE 100", "SIZE 200"]));
        assert_eq!(exts.max_message_size(), Some(200));
        assert_eq!(exts.len(), 1);
    }

    #[test]
    fn missing_size_is_none() {
        let exts = Extensions::parse_ehlo_response(&lines(&["greeting", "PIPELINING"]));
        assert_eq!(exts.max_message_size(), None);
    }
}
