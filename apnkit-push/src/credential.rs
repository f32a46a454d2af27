//! Client certificate material for gateway sessions.

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fmt;
use std::path::Path;

use crate::{PushError, Result};

/// Certificate and private key authenticating a TLS session to Apple.
///
/// Holds the PEM text as exported for the app, certificate chain and
/// private key in one document. The material is opaque until a session
/// is opened.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pem: Vec<u8>,
}

impl Credential {
    /// Create a credential from PEM bytes.
    pub fn from_pem(pem: impl Into<Vec<u8>>) -> Self {
        Self { pem: pem.into() }
    }

    /// Load a credential from a PEM file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let pem = std::fs::read(path).map_err(|e| {
            PushError::MissingCredential(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(Self::from_pem(pem))
    }

    /// Whether any certificate material is present.
    pub fn is_empty(&self) -> bool {
        self.pem.iter().all(u8::is_ascii_whitespace)
    }

    /// Raw PEM bytes.
    pub fn as_pem(&self) -> &[u8] {
        &self.pem
    }

    /// Parse the certificate chain.
    pub fn certificates(&self) -> Result<Vec<CertificateDer<'static>>> {
        let certs = CertificateDer::pem_slice_iter(&self.pem)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| PushError::Certificate(format!("failed to parse certificates: {e}")))?;
        if certs.is_empty() {
            return Err(PushError::Certificate("no certificates found".into()));
        }
        Ok(certs)
    }

    /// Parse the private key.
    pub fn private_key(&self) -> Result<PrivateKeyDer<'static>> {
        PrivateKeyDer::from_pem_slice(&self.pem)
            .map_err(|e| PushError::Certificate(format!("failed to parse private key: {e}")))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("pem", &format_args!("<{} bytes>", self.pem.len()))
            .finish()
    }
}

/// Reject absent or empty certificate material before any network I/O.
pub fn require_credential<'a>(credential: Option<&'a Credential>, scope: &str) -> Result<&'a Credential> {
    match credential {
        Some(credential) if !credential.is_empty() => Ok(credential),
        _ => Err(PushError::MissingCredential(format!(
            "no certificate configured for {}",
            scope
        ))),
    }
}
