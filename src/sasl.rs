//! Client-side SASL mechanisms for SMTP AUTH (RFC 4954).
//!
//! Three mechanisms are provided: PLAIN (RFC 4616), LOGIN
//! (draft-murchison-sasl-login, still widely deployed), and CRAM-MD5
//! (RFC 2195). The client drives them through [`Mechanism`]: an optional
//! initial response from [`Mechanism::start`], then one
//! [`Mechanism::next`] call per 334 challenge.

use core::fmt::Write as _;

use hmac::{Hmac, Mac};
use md5::Md5;

use crate::error::{Error, Result};

type HmacMd5 = Hmac<Md5>;

/// A client-side SASL authentication mechanism.
pub trait Mechanism: Send {
    /// The IANA-registered mechanism name, e.g. `"PLAIN"`.
    fn name(&self) -> &'static str;

    /// Begins the exchange. `Some` is sent as the initial response on the
    /// AUTH command line; `None` means the server speaks first.
    fn start(&mut self) -> Result<Option<Vec<u8>>>;

    /// Produces the response to a decoded server challenge.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sasl`] when the mechanism has no further step; the
    /// client then aborts the exchange with `*`.
    fn next(&mut self, challenge: &[u8]) -> Result<Vec<u8>>;
}

/// SASL PLAIN (RFC 4616). The whole exchange is the single initial
/// response `authzid NUL authcid NUL passwd`; the authorization identity
/// is usually empty.
pub struct Plain {
    identity: String,
    username: String,
    password: String,
}

impl Plain {
    /// Creates a PLAIN mechanism with an empty authorization identity.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::with_identity("", username, password)
    }

    /// Creates a PLAIN mechanism with an explicit authorization identity.
    #[must_use]
    pub fn with_identity(
        identity: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Mechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn start(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(Some(
            format!("{}\0{}\0{}", self.identity, self.username, self.password).into_bytes(),
        ))
    }

    fn next(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
        Err(Error::Sasl("unexpected challenge for PLAIN".into()))
    }
}

/// SASL LOGIN. The server prompts for the username and password in turn.
pub struct Login {
    username: String,
    password: String,
    step: u8,
}

impl Login {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            step: 0,
        }
    }
}

impl Mechanism for Login {
    fn name(&self) -> &'static str {
        "LOGIN"
    }

    fn start(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn next(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
        self.step += 1;
        match self.step {
            1 => Ok(self.username.clone().into_bytes()),
            2 => Ok(self.password.clone().into_bytes()),
            step => Err(Error::Sasl(format!(
                "unexpected LOGIN challenge at step {step}"
            ))),
        }
    }
}

/// SASL CRAM-MD5 (RFC 2195). The response is
/// `username SP hex(HMAC-MD5(secret, challenge))`.
pub struct CramMd5 {
    username: String,
    secret: String,
}

impl CramMd5 {
    #[must_use]
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }
}

impl Mechanism for CramMd5 {
    fn name(&self) -> &'static str {
        "CRAM-MD5"
    }

    fn start(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn next(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        let mut mac = HmacMd5::new_from_slice(self.secret.as_bytes())
            .map_err(|err| Error::Sasl(err.to_string()))?;
        mac.update(challenge);

        let digest = mac.finalize().into_bytes();
        let mut response = String::with_capacity(self.username.len() + 1 + digest.len() * 2);
        response.push_str(&self.username);
        response.push(' ');
        for byte in digest {
            // Writing into a String cannot fail.
            let _ = write!(response, "{byte:02x}");
        }

        Ok(response.into_bytes())
    }
}
