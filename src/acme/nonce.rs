//! Anti-replay nonce slot (RFC 8555 §7.2). Holds at most one fresh nonce; every
//! successful response supersedes it, and consuming it empties the slot so the next use
//! forces a HEAD fetch.

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{AcmeError, AcmeResult};

const HEADER_REPLAY_NONCE: &str = "replay-nonce";

#[derive(Default)]
pub struct Nonce {
    slot: Mutex<Option<String>>,
}

impl Nonce {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the queued nonce if present; otherwise issues a HEAD request to
    /// `new_nonce_url` and returns the `Replay-Nonce` header from the response.
    ///
    /// # Errors
    /// Returns an error if the HEAD request fails or the response has no nonce header.
    pub(crate) async fn get(&self, client: &reqwest::Client, new_nonce_url: &str) -> AcmeResult<String> {
        {
            let mut slot = self.slot.lock().await;
            if let Some(nonce) = slot.take() {
                return Ok(nonce);
            }
        }

        let resp = client.head(new_nonce_url).send().await?;
        resp.headers()
            .get(HEADER_REPLAY_NONCE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .ok_or(AcmeError::MissingExpectedHeader("Replay-Nonce"))
    }

    /// Stores `value` iff it is a non-empty base64url string; `None`, empty, and
    /// malformed values are ignored so the slot never holds invalid data.
    pub(crate) async fn set(&self, value: Option<String>) {
        let Some(value) = value else { return };
        if value.is_empty() || !is_base64url(&value) {
            return;
        }
        debug!("stored fresh replay-nonce");
        *self.slot.lock().await = Some(value);
    }
}

fn is_base64url(value: &str) -> bool {
    value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_'))
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn test_get_fetches_when_empty() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/nonce"))
            .respond_with(ResponseTemplate::new(200).insert_header("replay-nonce", "nonce-1"))
            .mount(&server)
            .await;

        let nonce = Nonce::new();
        let client = reqwest::Client::new();
        let value = nonce
            .get(&client, &format!("{}/nonce", server.uri()))
            .await
            .unwrap();
        assert_eq!(value, "nonce-1");
    }

    #[tokio::test]
    async fn test_set_then_get_consumes_queued_nonce() {
        let nonce = Nonce::new();
        nonce.set(Some("queued-nonce".to_string())).await;

        let server = MockServer::start().await;
        let client = reqwest::Client::new();
        let value = nonce
            .get(&client, &format!("{}/nonce", server.uri()))
            .await
            .unwrap();
        assert_eq!(value, "queued-nonce");
    }

    #[tokio::test]
    async fn test_set_ignores_empty_and_none() {
        let nonce = Nonce::new();
        nonce.set(None).await;
        nonce.set(Some(String::new())).await;
        assert!(nonce.slot.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_set_ignores_malformed_base64url() {
        let nonce = Nonce::new();
        nonce.set(Some("%%".to_string())).await;
        assert!(nonce.slot.lock().await.is_none());
    }
}
