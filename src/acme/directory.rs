//! ACME directory document (RFC 8555 §7.1.1): the map from operation name to URL that
//! every other component resolves its endpoints through.

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::AcmeSettings;
use crate::error::{AcmeError, AcmeResult};

#[derive(Debug, Deserialize, Clone)]
pub struct Directory {
    #[serde(rename = "newNonce")]
    new_nonce: String,
    #[serde(rename = "newAccount")]
    new_account: String,
    #[serde(rename = "newOrder")]
    new_order: String,
    #[serde(rename = "termsOfService")]
    terms_of_service: Option<String>,
    website: Option<String>,
}

impl Directory {
    /// Fetches and parses the directory document at `url`, retrying transient failures
    /// with exponential backoff. This is the only way to obtain a `Directory` — there is
    /// no synchronous constructor, so a caller cannot observe an uninitialised directory.
    ///
    /// # Errors
    /// Returns an error if every retry attempt fails.
    pub(crate) async fn discover(
        client: &reqwest::Client,
        url: &str,
        settings: &AcmeSettings,
    ) -> AcmeResult<Self> {
        info!("fetching ACME directory from {url}");
        let mut last_err = None;
        let mut delay_secs = settings.directory_fetch_base_delay_secs;

        for attempt in 1..=settings.directory_fetch_attempts {
            match client.get(url).send().await {
                Ok(resp) => match resp.json::<Directory>().await {
                    Ok(dir) => return Ok(dir),
                    Err(err) => last_err = Some(AcmeError::Http(err)),
                },
                Err(err) => last_err = Some(AcmeError::Http(err)),
            }

            if attempt < settings.directory_fetch_attempts {
                warn!(
                    attempt,
                    max_attempts = settings.directory_fetch_attempts,
                    delay_secs,
                    "directory fetch failed, retrying"
                );
                tokio::time::sleep(std::time::Duration::from_secs(delay_secs)).await;
                delay_secs = delay_secs.saturating_mul(2).min(settings.directory_fetch_max_delay_secs);
            }
        }

        Err(last_err.unwrap_or(AcmeError::Request("directory fetch failed".into())))
    }

    #[must_use]
    pub fn new_nonce_url(&self) -> &str {
        &self.new_nonce
    }

    #[must_use]
    pub fn new_account_url(&self) -> &str {
        &self.new_account
    }

    #[must_use]
    pub fn new_order_url(&self) -> &str {
        &self.new_order
    }

    #[must_use]
    pub fn terms_of_service(&self) -> Option<&str> {
        self.terms_of_service.as_deref()
    }

    #[must_use]
    pub fn website(&self) -> Option<&str> {
        self.website.as_deref()
    }
}
