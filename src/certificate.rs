//! Certificate persistence and metadata: parses the issued PEM chain's validity window,
//! issuer/subject, and SAN list via the RFC 5280 X.509 codec (`x509-parser`, not a
//! hand-rolled ASN.1 grammar — see spec.md §9), and builds the `rustls` secure-context
//! value AutoTLS hands to the TLS stack.

use std::path::Path;
use std::sync::Arc;

use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use time::OffsetDateTime;
use tokio::fs;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::{AcmeError, AcmeResult, CryptoError};
use crate::fs_util::write_atomic;
use crate::identity::Identity;

/// Validity and identity fields pulled out of the leaf certificate, per spec.md §4.9.
#[derive(Debug, Clone)]
pub struct CertificateMetadata {
    pub issuer_cn: String,
    pub subject_cn: String,
    pub dns_names: Vec<String>,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub serial_hex: String,
}

impl CertificateMetadata {
    /// Parses the leaf certificate (the first PEM block) out of `pem_chain`.
    ///
    /// # Errors
    /// Returns [`AcmeError::CertificateParse`] if the chain has no valid leading PEM
    /// block or the DER inside it does not parse as an X.509 certificate.
    pub fn parse(pem_chain: &str) -> AcmeResult<Self> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(pem_chain.as_bytes())
            .map_err(|e| AcmeError::CertificateParse(e.to_string()))?;
        let (_, cert) = X509Certificate::from_der(&pem.contents)
            .map_err(|e| AcmeError::CertificateParse(e.to_string()))?;
        Self::from_x509(&cert)
    }

    fn from_x509(cert: &X509Certificate<'_>) -> AcmeResult<Self> {
        let issuer_cn = common_name(&cert.issuer().to_string());
        let subject_cn = common_name(&cert.subject().to_string());
        let dns_names = cert
            .subject_alternative_name()
            .map_err(|e| AcmeError::CertificateParse(e.to_string()))?
            .map(|ext| {
                ext.value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        x509_parser::extensions::GeneralName::DNSName(dns) => {
                            Some((*dns).to_string())
                        }
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            issuer_cn,
            subject_cn,
            dns_names,
            not_before: cert.validity().not_before.to_datetime(),
            not_after: cert.validity().not_after.to_datetime(),
            serial_hex: cert.raw_serial_as_string(),
        })
    }

    /// True once `now` is within `renew_before` of `not_after` (spec.md §4.9's "`now ≥
    /// notAfter − 30 days`" renewal trigger, parameterized by configuration).
    #[must_use]
    pub fn needs_renewal(&self, now: OffsetDateTime, renew_before: std::time::Duration) -> bool {
        let renew_before = time::Duration::try_from(renew_before).unwrap_or(time::Duration::MAX);
        now >= self.not_after - renew_before
    }
}

fn common_name(rdn_string: &str) -> String {
    // x509-parser's `X509Name::to_string()` renders an RFC 4514-ish DN; pull the CN
    // attribute out of it rather than walking the RDN sequence by hand.
    rdn_string
        .split(',')
        .find_map(|part| part.trim().strip_prefix("CN="))
        .unwrap_or_default()
        .to_string()
}

/// An issued certificate: its PEM chain, parsed metadata, and the cached `rustls`
/// signing material AutoTLS serves on the TLS handshake hot path.
pub struct Certificate {
    pem_chain: String,
    metadata: CertificateMetadata,
    certified_key: Arc<CertifiedKey>,
}

impl Certificate {
    /// Builds a `Certificate` from a freshly issued (or freshly loaded) PEM chain and
    /// the identity whose private key matches the leaf's public key.
    ///
    /// # Errors
    /// Returns an error if the chain fails to parse or the key material can't be
    /// turned into an `rustls` signing key.
    pub fn from_pem_chain(pem_chain: String, certificate_identity: &Identity) -> AcmeResult<Self> {
        let metadata = CertificateMetadata::parse(&pem_chain)?;
        let certified_key = build_certified_key(&pem_chain, certificate_identity)?;
        Ok(Self {
            pem_chain,
            metadata,
            certified_key,
        })
    }

    /// Loads a previously persisted certificate chain from `path`, if present.
    ///
    /// # Errors
    /// Returns an error if the file exists but fails to read or parse.
    pub async fn load(path: &Path, certificate_identity: &Identity) -> AcmeResult<Option<Self>> {
        match fs::read_to_string(path).await {
            Ok(pem_chain) => Self::from_pem_chain(pem_chain, certificate_identity).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(AcmeError::Io(err)),
        }
    }

    /// Atomically writes the PEM chain to `path` (write-temp-then-rename, spec.md §5).
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn persist(&self, path: &Path) -> AcmeResult<()> {
        write_atomic(path, self.pem_chain.as_bytes())
            .await
            .map_err(|e| AcmeError::InvalidState(e.to_string()))
    }

    #[must_use]
    pub fn metadata(&self) -> &CertificateMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn serial(&self) -> &str {
        &self.metadata.serial_hex
    }

    #[must_use]
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }

    #[must_use]
    pub fn pem_chain(&self) -> &str {
        &self.pem_chain
    }
}

fn build_certified_key(pem_chain: &str, certificate_identity: &Identity) -> AcmeResult<Arc<CertifiedKey>> {
    let mut reader = std::io::Cursor::new(pem_chain.as_bytes());
    let der_chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| AcmeError::CertificateParse(e.to_string()))?;
    if der_chain.is_empty() {
        return Err(AcmeError::CertificateParse("no certificates in PEM chain".into()));
    }

    let key_der: PrivateKeyDer<'static> =
        PrivatePkcs8KeyDer::from(certificate_identity.pkcs8_der().to_vec()).into();
    let signing_key = any_supported_type(&key_der)
        .map_err(|e| AcmeError::Crypto(CryptoError::new(e.to_string())))?;

    Ok(Arc::new(CertifiedKey::new(der_chain, signing_key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn common_name_extracts_cn() {
        assert_eq!(common_name("CN=example.com"), "example.com");
        assert_eq!(common_name("C=US, O=Example, CN=example.com"), "example.com");
        assert_eq!(common_name(""), "");
    }

    #[test]
    fn test_common_name_extracts_cn() {
        common_name_extracts_cn();
    }

    #[test]
    fn test_needs_renewal_at_threshold() {
        let metadata = CertificateMetadata {
            issuer_cn: "Test CA".to_string(),
            subject_cn: "example.com".to_string(),
            dns_names: vec!["example.com".to_string()],
            not_before: OffsetDateTime::UNIX_EPOCH,
            not_after: OffsetDateTime::UNIX_EPOCH + time::Duration::days(30),
            serial_hex: "01".to_string(),
        };

        let renew_before = std::time::Duration::from_secs(30 * 24 * 60 * 60);
        assert!(metadata.needs_renewal(OffsetDateTime::UNIX_EPOCH, renew_before));
        assert!(!metadata.needs_renewal(
            OffsetDateTime::UNIX_EPOCH - time::Duration::seconds(1),
            renew_before
        ));
    }

    #[tokio::test]
    async fn test_load_returns_none_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let identity = Identity::load_or_generate(&tmp.path().join("id.pem")).await.unwrap();

        let loaded = Certificate::load(&dir.path().join("certificate.pem"), &identity)
            .await
            .unwrap();
        assert!(loaded.is_none());
    }
}
