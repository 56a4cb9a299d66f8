//! ACME account: load-or-register, persisted as `{kid}` JSON next to the account
//! identity. The account's `kid` is read-only after creation — there is no setter.

use std::path::{Path, PathBuf};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::acme::signed_request::{AcmeTransport, Auth};
use crate::error::{AcmeError, AcmeResult};
use crate::identity::Identity;

#[derive(Debug, Serialize, Deserialize)]
struct AccountRecord {
    kid: String,
}

pub struct Account {
    kid: String,
}

impl Account {
    /// Loads a persisted account record from `record_path`, or registers a fresh one
    /// with the CA and persists the result. The only public constructor.
    ///
    /// # Errors
    /// Returns an error if registration fails or the record cannot be read/written.
    pub async fn load_or_register(
        record_path: &Path,
        transport: &AcmeTransport,
        identity: &Identity,
        contact_email: Option<&str>,
    ) -> AcmeResult<Self> {
        if let Some(kid) = read_record(record_path).await? {
            return Ok(Self { kid });
        }

        let kid = register(transport, identity, contact_email).await?;
        write_record(record_path, &kid).await?;
        info!(kid, "account registered");
        Ok(Self { kid })
    }

    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }
}

async fn read_record(path: &Path) -> AcmeResult<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(contents) => {
            let record: AccountRecord = serde_json::from_str(&contents)?;
            Ok(Some(record.kid))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(AcmeError::Io(err)),
    }
}

async fn write_record(path: &Path, kid: &str) -> AcmeResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let record = AccountRecord { kid: kid.to_string() };
    fs::write(path, serde_json::to_vec_pretty(&record)?).await?;
    Ok(())
}

async fn register(
    transport: &AcmeTransport,
    identity: &Identity,
    contact_email: Option<&str>,
) -> AcmeResult<String> {
    let mut payload = serde_json::json!({ "termsOfServiceAgreed": true });
    if let Some(email) = contact_email {
        payload["contact"] = serde_json::json!([contact_uri(email)]);
    }

    let resp = transport
        .request(
            identity,
            transport.directory().new_account_url(),
            Auth::EmbeddedJwk,
            Some(&payload),
            &[StatusCode::CREATED, StatusCode::OK],
        )
        .await?;

    resp.header("location")
        .map(ToString::to_string)
        .ok_or(AcmeError::MissingExpectedHeader("Location"))
}

fn contact_uri(email: &str) -> String {
    if email.starts_with("mailto:") {
        email.to_string()
    } else {
        format!("mailto:{email}")
    }
}

#[must_use]
pub fn record_path(root: &Path) -> PathBuf {
    root.join("account.json")
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path as wpath};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::AcmeSettings;

    fn test_settings() -> AcmeSettings {
        AcmeSettings {
            http_challenge_port: 80,
            directory_fetch_attempts: 1,
            directory_fetch_base_delay_secs: 1,
            directory_fetch_max_delay_secs: 1,
            poll_attempts: 15,
            poll_interval_secs: 2,
        }
    }

    #[test]
    fn test_contact_uri_adds_mailto_prefix() {
        assert_eq!(contact_uri("a@example.com"), "mailto:a@example.com");
        assert_eq!(contact_uri("mailto:a@example.com"), "mailto:a@example.com");
    }

    #[tokio::test]
    async fn test_load_or_register_loads_existing_record() {
        let dir = tempfile::tempdir().unwrap();
        let record_path = dir.path().join("account.json");
        fs::write(&record_path, r#"{"kid":"https://ca/acct/1"}"#)
            .await
            .unwrap();

        let server = MockServer::start().await;
        let body = serde_json::json!({
            "newNonce": format!("{}/nonce", server.uri()),
            "newAccount": format!("{}/account", server.uri()),
            "newOrder": format!("{}/order", server.uri()),
        });
        Mock::given(method("GET"))
            .and(wpath("/directory"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&body))
            .mount(&server)
            .await;

        let transport = AcmeTransport::discover(&format!("{}/directory", server.uri()), &test_settings())
            .await
            .unwrap();
        let identity = Identity::load_or_generate(&dir.path().join("id.pem")).await.unwrap();

        let account = Account::load_or_register(&record_path, &transport, &identity, None)
            .await
            .unwrap();
        assert_eq!(account.kid(), "https://ca/acct/1");
    }

    #[tokio::test]
    async fn test_load_or_register_registers_new_account() {
        let dir = tempfile::tempdir().unwrap();
        let record_path = dir.path().join("account.json");

        let server = MockServer::start().await;
        let body = serde_json::json!({
            "newNonce": format!("{}/nonce", server.uri()),
            "newAccount": format!("{}/account", server.uri()),
            "newOrder": format!("{}/order", server.uri()),
        });
        Mock::given(method("GET"))
            .and(wpath("/directory"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&body))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(wpath("/nonce"))
            .respond_with(ResponseTemplate::new(200).insert_header("replay-nonce", "n1"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(wpath("/account"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("location", "https://ca/acct/42")
                    .set_body_json(serde_json::json!({"status":"valid"})),
            )
            .mount(&server)
            .await;

        let transport = AcmeTransport::discover(&format!("{}/directory", server.uri()), &test_settings())
            .await
            .unwrap();
        let identity = Identity::load_or_generate(&dir.path().join("id.pem")).await.unwrap();

        let account = Account::load_or_register(&record_path, &transport, &identity, Some("a@example.com"))
            .await
            .unwrap();
        assert_eq!(account.kid(), "https://ca/acct/42");
        assert!(record_path.exists());
    }
}
