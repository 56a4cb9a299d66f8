//! RSA-2048 identity: a keypair plus its derived public JWK and RFC 7638 thumbprint.
//!
//! An [`Identity`] backs both the ACME account (signs protocol messages) and each
//! certificate order (the subject key embedded in the CSR). Key generation happens once,
//! on first use; the PEM file persisted afterwards is loaded verbatim on every later run.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use ring::digest::{Context as DigestContext, SHA256};
use ring::rand::SystemRandom;
use ring::signature::{RSA_PKCS1_SHA256, RsaKeyPair};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use serde::Serialize;
use tokio::fs;

use crate::error::{AcmeError, AcmeResult, CryptoError};

const RSA_KEY_BITS: usize = 2048;

/// Canonical RSA public JWK, field order `e, kty, n` per RFC 7638 §3.
#[derive(Debug, Clone, Serialize)]
pub struct Jwk {
    pub e: String,
    pub kty: &'static str,
    pub n: String,
}

pub struct Identity {
    signing_key: RsaKeyPair,
    pkcs8_der: Vec<u8>,
    jwk: Jwk,
    thumbprint: String,
}

impl Identity {
    /// Loads the identity from `path` if it exists, otherwise generates a fresh RSA-2048
    /// keypair and persists it as PKCS#8 PEM. This is the only public constructor; there
    /// is no synchronous `new()` that bypasses the filesystem.
    ///
    /// # Errors
    /// Returns an error if key generation, parsing, or the PEM read/write fails.
    pub async fn load_or_generate(path: &Path) -> AcmeResult<Self> {
        let private_key = match fs::read_to_string(path).await {
            Ok(pem) => RsaPrivateKey::from_pkcs8_pem(&pem)
                .map_err(|e| AcmeError::UnsupportedIdentityType(e.to_string()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let private_key = generate_rsa_key()?;
                let pem = private_key
                    .to_pkcs8_pem(LineEnding::LF)
                    .map_err(|e| AcmeError::Crypto(CryptoError::new(e.to_string())))?;
                if let Some(parent) = path.parent() {
                    crate::fs_util::ensure_secrets_dir(parent)
                        .await
                        .map_err(|e| AcmeError::InvalidState(e.to_string()))?;
                }
                fs::write(path, pem.as_bytes()).await?;
                crate::fs_util::set_key_permissions(path)
                    .await
                    .map_err(|e| AcmeError::InvalidState(e.to_string()))?;
                private_key
            }
            Err(err) => return Err(AcmeError::Io(err)),
        };

        Self::from_rsa_private_key(&private_key)
    }

    fn from_rsa_private_key(private_key: &RsaPrivateKey) -> AcmeResult<Self> {
        let der = private_key
            .to_pkcs8_der()
            .map_err(|e| AcmeError::Crypto(CryptoError::new(e.to_string())))?;
        let pkcs8_der = der.as_bytes().to_vec();
        let signing_key = RsaKeyPair::from_pkcs8(&pkcs8_der)
            .map_err(|e| AcmeError::Crypto(CryptoError::new(format!("{e:?}"))))?;

        let jwk = Jwk {
            e: B64.encode(private_key.e().to_bytes_be()),
            kty: "RSA",
            n: B64.encode(private_key.n().to_bytes_be()),
        };
        let thumbprint = thumbprint_of(&jwk)?;

        Ok(Self {
            signing_key,
            pkcs8_der,
            jwk,
            thumbprint,
        })
    }

    /// Returns the PKCS#8 DER encoding of the private key, for handing to `rcgen` when
    /// building a CSR that must carry this exact keypair rather than a freshly
    /// generated one.
    #[must_use]
    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8_der
    }

    #[must_use]
    pub fn public_jwk(&self) -> &Jwk {
        &self.jwk
    }

    #[must_use]
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    /// Computes `token + "." + thumbprint`, the HTTP-01 key-authorization body.
    #[must_use]
    pub fn key_authorization(&self, token: &str) -> String {
        format!("{token}.{}", self.thumbprint)
    }

    /// Signs `input` with RS256.
    ///
    /// # Errors
    /// Returns an error if the underlying RSA signing operation fails.
    pub fn sign_rs256(&self, input: &[u8]) -> AcmeResult<Vec<u8>> {
        let rng = SystemRandom::new();
        let mut signature = vec![0u8; self.signing_key.public().modulus_len()];
        self.signing_key
            .sign(&RSA_PKCS1_SHA256, &rng, input, &mut signature)
            .map_err(|_| AcmeError::Crypto(CryptoError::new("RSA signing failed")))?;
        Ok(signature)
    }
}

fn generate_rsa_key() -> AcmeResult<RsaPrivateKey> {
    let mut rng = rand::thread_rng();
    RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
        .map_err(|e| AcmeError::Crypto(CryptoError::new(e.to_string())))
}

fn thumbprint_of(jwk: &Jwk) -> AcmeResult<String> {
    // RFC 7638: canonical member ordering e, kty, n with no insignificant whitespace.
    let canonical = serde_json::to_string(jwk)?;
    let mut ctx = DigestContext::new(&SHA256);
    ctx.update(canonical.as_bytes());
    Ok(B64.encode(ctx.finish().as_ref()))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_generates_and_persists_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.pem");

        let identity = Identity::load_or_generate(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(identity.public_jwk().kty, "RSA");
        assert!(!identity.thumbprint().is_empty());
    }

    #[tokio::test]
    async fn test_reloads_same_identity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.pem");

        let first = Identity::load_or_generate(&path).await.unwrap();
        let second = Identity::load_or_generate(&path).await.unwrap();

        assert_eq!(first.thumbprint(), second.thumbprint());
        assert_eq!(first.public_jwk().n, second.public_jwk().n);
    }

    #[tokio::test]
    async fn test_key_authorization_shape() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.pem");
        let identity = Identity::load_or_generate(&path).await.unwrap();

        let ka = identity.key_authorization("token-abc");
        let parts: Vec<&str> = ka.split('.').collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], "token-abc");
        assert!(!parts[1].contains('='));
    }

    #[test]
    fn test_jwk_field_order_is_canonical() {
        let jwk = Jwk {
            e: "AQAB".to_string(),
            kty: "RSA",
            n: "abc".to_string(),
        };
        let json = serde_json::to_string(&jwk).unwrap();
        assert_eq!(json, r#"{"e":"AQAB","kty":"RSA","n":"abc"}"#);
    }
}
