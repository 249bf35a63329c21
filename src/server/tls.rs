//! STARTTLS server configuration from PEM certificate and key files.

use std::{fs::File, io::BufReader, path::PathBuf, sync::Arc};

use serde::Deserialize;
use thiserror::Error;
use tokio_rustls::rustls::{
    ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer},
};

/// Errors raised while assembling the STARTTLS configuration.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to load TLS certificate from {path}: {source}")]
    CertificateLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load TLS private key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    #[error("TLS error: {0}")]
    Rustls(#[from] tokio_rustls::rustls::Error),
}

/// Paths to the PEM-encoded certificate chain and private key enabling
/// STARTTLS on the server.
#[derive(Clone, Debug, Deserialize)]
pub struct TlsContext {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

impl TlsContext {
    /// Loads the certificate chain and key into a rustls server
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`TlsError`] when either file is unreadable, the key
    /// format is unrecognized, or rustls rejects the material.
    pub fn load(&self) -> Result<Arc<ServerConfig>, TlsError> {
        let certs = self.load_certs()?;
        let key = self.load_key()?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(Arc::new(config))
    }

    fn load_certs(&self) -> Result<Vec<CertificateDer<'static>>, TlsError> {
        let open = |err| TlsError::CertificateLoad {
            path: self.certificate.display().to_string(),
            source: err,
        };

        let mut reader = BufReader::new(File::open(&self.certificate).map_err(open)?);
        rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(open)
    }

    fn load_key(&self) -> Result<PrivateKeyDer<'static>, TlsError> {
        let path = self.key.display().to_string();
        let mut reader =
            BufReader::new(File::open(&self.key).map_err(|err| TlsError::KeyLoad {
                path: path.clone(),
                reason: err.to_string(),
            })?);

        match rustls_pemfile::read_one(&mut reader).map_err(|err| TlsError::KeyLoad {
            path: path.clone(),
            reason: err.to_string(),
        })? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
            _ => Err(TlsError::KeyLoad {
                path,
                reason: "unrecognized key format (expected PKCS1, PKCS8, or SEC1)".to_owned(),
            }),
        }
    }
}
