//! Builds and transports JWS-signed ACME requests (RFC 7515) over HTTPS, feeding and
//! draining the shared [`Nonce`] slot and retrying exactly once on a `badNonce` problem.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::acme::directory::Directory;
use crate::acme::nonce::Nonce;
use crate::config::AcmeSettings;
use crate::error::{AcmeError, AcmeResult};
use crate::identity::{Identity, Jwk};

const CONTENT_TYPE_JOSE_JSON: &str = "application/jose+json";
const CONTENT_TYPE_PROBLEM_JSON: &str = "application/problem+json";
const BAD_NONCE_TYPE: &str = "urn:ietf:params:acme:error:badNonce";
const HEADER_REPLAY_NONCE: &str = "replay-nonce";

/// Which key identifies the requester in the JWS protected header — exactly one of these
/// is ever present, never both (RFC 8555 §6.2).
pub enum Auth<'a> {
    Kid(&'a str),
    EmbeddedJwk,
}

#[derive(Serialize)]
struct JwsHeader<'a> {
    alg: &'static str,
    nonce: &'a str,
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<&'a Jwk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<&'a str>,
}

#[derive(Deserialize)]
struct ProblemDocument {
    #[serde(rename = "type")]
    problem_type: Option<String>,
    detail: Option<String>,
}

pub struct SignedResponse {
    pub status: StatusCode,
    headers: reqwest::header::HeaderMap,
    pub body: Bytes,
}

impl SignedResponse {
    /// Parses the response body as JSON.
    ///
    /// # Errors
    /// Returns an error if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> AcmeResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Transport for the signed-request protocol: directory resolution, nonce management,
/// JWS construction, and response discrimination all live here so callers only ever deal
/// in operation-level calls.
pub struct AcmeTransport {
    client: reqwest::Client,
    directory: Directory,
    nonce: Nonce,
}

impl AcmeTransport {
    /// Discovers the directory at `directory_url` and builds a transport around it. The
    /// only public constructor — direct construction without discovery is not possible.
    ///
    /// # Errors
    /// Returns an error if directory discovery fails or the HTTP client cannot be built.
    pub async fn discover(directory_url: &str, settings: &AcmeSettings) -> AcmeResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("acme-autotls/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(AcmeError::Http)?;
        let directory = Directory::discover(&client, directory_url, settings).await?;
        Ok(Self {
            client,
            directory,
            nonce: Nonce::new(),
        })
    }

    #[must_use]
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Sends a signed POST. `payload = None` produces a POST-as-GET (RFC 8555 §6.3).
    /// Retries exactly once if the server rejects the first attempt with `badNonce`.
    ///
    /// # Errors
    /// Returns [`AcmeError::Request`] if the response status isn't in `accepted`, or a
    /// transport/serialization error otherwise.
    pub async fn request(
        &self,
        identity: &Identity,
        url: &str,
        auth: Auth<'_>,
        payload: Option<&serde_json::Value>,
        accepted: &[StatusCode],
    ) -> AcmeResult<SignedResponse> {
        match self.request_once(identity, url, &auth, payload, accepted).await {
            Err(AcmeError::Request(ref msg)) if msg.contains(BAD_NONCE_TYPE) => {
                debug!("retrying after badNonce");
                self.request_once(identity, url, &auth, payload, accepted).await
            }
            other => other,
        }
    }

    /// Convenience for POST-as-GET requests (empty payload).
    ///
    /// # Errors
    /// See [`Self::request`].
    pub async fn post_as_get(
        &self,
        identity: &Identity,
        url: &str,
        kid: &str,
        accepted: &[StatusCode],
    ) -> AcmeResult<SignedResponse> {
        self.request(identity, url, Auth::Kid(kid), None, accepted).await
    }

    async fn request_once(
        &self,
        identity: &Identity,
        url: &str,
        auth: &Auth<'_>,
        payload: Option<&serde_json::Value>,
        accepted: &[StatusCode],
    ) -> AcmeResult<SignedResponse> {
        let body = self.build_jws(identity, url, auth, payload).await?;

        let resp = self
            .client
            .post(url)
            .header("Content-Type", CONTENT_TYPE_JOSE_JSON)
            .header("Accept-Language", "en-US")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let headers = resp.headers().clone();
        self.nonce
            .set(
                headers
                    .get(HEADER_REPLAY_NONCE)
                    .and_then(|v| v.to_str().ok())
                    .map(ToString::to_string),
            )
            .await;

        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let bytes = resp.bytes().await?;

        if !accepted.contains(&status) {
            if content_type.starts_with(CONTENT_TYPE_PROBLEM_JSON) {
                if let Ok(problem) = serde_json::from_slice::<ProblemDocument>(&bytes) {
                    return Err(AcmeError::Request(format!(
                        "{} {}",
                        problem.problem_type.unwrap_or_default(),
                        problem.detail.unwrap_or_default()
                    )));
                }
            }
            return Err(AcmeError::Request(format!(
                "unexpected status {status}: {}",
                String::from_utf8_lossy(&bytes)
            )));
        }

        Ok(SignedResponse {
            status,
            headers,
            body: bytes,
        })
    }

    async fn build_jws(
        &self,
        identity: &Identity,
        url: &str,
        auth: &Auth<'_>,
        payload: Option<&serde_json::Value>,
    ) -> AcmeResult<serde_json::Value> {
        let nonce = self.nonce.get(&self.client, self.directory.new_nonce_url()).await?;

        let (kid, jwk) = match auth {
            Auth::Kid(kid) => (Some(*kid), None),
            Auth::EmbeddedJwk => (None, Some(identity.public_jwk())),
        };

        let header = JwsHeader {
            alg: "RS256",
            nonce: &nonce,
            url,
            jwk,
            kid,
        };

        let protected_b64 = B64.encode(serde_json::to_vec(&header)?);
        let payload_b64 = match payload {
            Some(p) => B64.encode(serde_json::to_vec(p)?),
            None => String::new(),
        };

        let signing_input = format!("{protected_b64}.{payload_b64}");
        let signature = identity.sign_rs256(signing_input.as_bytes())?;

        Ok(serde_json::json!({
            "protected": protected_b64,
            "payload": payload_b64,
            "signature": B64.encode(signature),
        }))
    }
}
