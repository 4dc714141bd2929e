//! Trust anchors for verifying the backend's certificate.
//!
//! The client ships its own CA bundle rather than relying on the platform
//! store. The bundle is a PEM file that may hold many certificates; each is
//! added as a root to every HTTP client the multiplexer builds.
//!
//! ```ignore
//! use chatcube_net::tls::Certificate;
//!
//! let roots = Certificate::from_pem_bundle_file("/etc/chatcube/ca-bundle.pem")?;
//! ```

use std::io::{BufReader, Cursor};
use std::path::Path;

use rustls_pki_types::CertificateDer;

use crate::error::{NetworkError, Result};

/// A DER-encoded CA certificate to add to the trust store.
#[derive(Clone)]
pub struct Certificate {
    der: CertificateDer<'static>,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("der_len", &self.der.as_ref().len())
            .finish()
    }
}

impl Certificate {
    /// Wrap DER-encoded certificate bytes.
    pub fn from_der(der_data: impl Into<Vec<u8>>) -> Self {
        Self {
            der: CertificateDer::from(der_data.into()),
        }
    }

    /// Parse every certificate in PEM-encoded bytes.
    ///
    /// Fails if the data holds no certificate at all.
    pub fn from_pem_bundle(pem_data: impl AsRef<[u8]>) -> Result<Vec<Self>> {
        let mut reader = BufReader::new(Cursor::new(pem_data.as_ref()));
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| NetworkError::Tls(format!("Failed to parse PEM bundle: {e}")))?;

        if certs.is_empty() {
            return Err(NetworkError::Tls(
                "No certificates found in PEM bundle".to_string(),
            ));
        }

        Ok(certs.into_iter().map(|der| Certificate { der }).collect())
    }

    /// Load a certificate bundle from a PEM-encoded file.
    pub fn from_pem_bundle_file(path: impl AsRef<Path>) -> Result<Vec<Self>> {
        let pem_data = std::fs::read(path.as_ref()).map_err(|e| {
            NetworkError::Tls(format!(
                "Failed to read certificate bundle '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_pem_bundle(pem_data)
    }

    /// The DER encoding.
    pub fn der(&self) -> &[u8] {
        self.der.as_ref()
    }

    /// Convert to a reqwest root certificate.
    pub(crate) fn to_reqwest(&self) -> Result<reqwest::Certificate> {
        reqwest::Certificate::from_der(self.der.as_ref())
            .map_err(|e| NetworkError::Tls(format!("Unusable CA certificate: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TEST_CA: &str = r#"-----BEGIN CERTIFICATE-----
MIIBkTCB+wIJAKHBfpegE3jEMA0GCSqGSIb3DQEBCwUAMBExDzANBgNVBAMMBnRl
c3RjYTAeFw0yMzAxMDEwMDAwMDBaFw0yNDAxMDEwMDAwMDBaMBExDzANBgNVBAMM
BnRlc3RjYTBcMA0GCSqGSIb3DQEBAQUAA0sAMEgCQQC7o96HtiK7onnPevKSE2LL
oSXwnmfYwZPV2bvfGS18lK8F+DL+42IjT3ucMXnLBhzNCLNKE8yCVK6LPlsvpNlX
AgMBAAGjUzBRMB0GA1UdDgQWBBQgHGHqPcVi1N4CG7IxDJaFMvP6XTAfBgNVHSME
GDAWgBQgHGHqPcVi1N4CG7IxDJaFMvP6XTAPBgNVHRMBAf8EBTADAQH/MA0GCSqG
SIb3DQEBCwUAA0EAGLJHfg9dS/T39L6VQLJeZcpH7mY8vKaM9dM/Zn3HMhfc0Yjv
3hxMPmPGjjpQ9JKaLI0Rq7n5oEUP+xluoAAfrQ==
-----END CERTIFICATE-----
"#;

    #[test]
    fn test_bundle_with_two_certificates() {
        let bundle = format!("{TEST_CA}{TEST_CA}");
        let certs = Certificate::from_pem_bundle(bundle).unwrap();
        assert_eq!(certs.len(), 2);
        assert!(!certs[0].der().is_empty());
    }

    #[test]
    fn test_empty_bundle_is_rejected() {
        let err = Certificate::from_pem_bundle("not a certificate").unwrap_err();
        assert!(matches!(err, NetworkError::Tls(_)));
    }

    #[test]
    fn test_bundle_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TEST_CA.as_bytes()).unwrap();

        let certs = Certificate::from_pem_bundle_file(file.path()).unwrap();
        assert_eq!(certs.len(), 1);
    }

    #[test]
    fn test_missing_bundle_file() {
        let err = Certificate::from_pem_bundle_file("/nonexistent/ca.pem").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }
}
