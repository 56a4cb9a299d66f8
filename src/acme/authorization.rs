//! Drives one HTTP-01 authorization from `pending` to `valid`: registers the challenge
//! response, signals readiness, then polls to a terminal state.

use std::time::{Duration, Instant};

use reqwest::StatusCode;
use tracing::{debug, info};

use crate::acme::challenge_responder::{self, ChallengeStore};
use crate::acme::signed_request::{AcmeTransport, Auth};
use crate::acme::types::{AuthorizationDocument, AuthorizationStatus, ChallengeStatus, ChallengeType};
use crate::error::{AcmeError, AcmeResult};
use crate::identity::Identity;

const POLL_INTERVAL_FLOOR: Duration = Duration::from_secs(1);
const MAX_WAIT: Duration = Duration::from_secs(120);

/// Validates the authorization at `authz_url`, returning once it reaches `valid`.
///
/// # Errors
/// Returns an error if the CA reports `invalid`, if no HTTP-01 challenge is offered, or
/// if validation doesn't complete within the two-minute poll budget.
pub async fn validate(
    transport: &AcmeTransport,
    identity: &Identity,
    kid: &str,
    authz_url: &str,
    challenges: &ChallengeStore,
) -> AcmeResult<()> {
    let authz = fetch(transport, identity, kid, authz_url).await?;
    if authz.status == AuthorizationStatus::Valid {
        debug!(authz_url, "authorization already valid");
        return Ok(());
    }

    let challenge = authz
        .challenges
        .iter()
        .find(|c| c.r#type == ChallengeType::Http01)
        .ok_or_else(|| AcmeError::MissingExpectedField("http-01 challenge"))?
        .clone();

    let key_authorization = identity.key_authorization(&challenge.token);
    challenge_responder::register(challenges, &challenge.token, &key_authorization).await;

    let result = drive_challenge(transport, identity, kid, authz_url, &challenge.url, &challenge.token).await;

    challenge_responder::deregister(challenges, &challenge.token).await;
    result
}

async fn drive_challenge(
    transport: &AcmeTransport,
    identity: &Identity,
    kid: &str,
    authz_url: &str,
    challenge_url: &str,
    challenge_token: &str,
) -> AcmeResult<()> {
    transport
        .request(
            identity,
            challenge_url,
            Auth::Kid(kid),
            Some(&serde_json::json!({})),
            &[StatusCode::OK],
        )
        .await?;
    info!(challenge_url, "http-01 challenge marked ready");

    let deadline = Instant::now() + MAX_WAIT;
    let mut poll_interval = POLL_INTERVAL_FLOOR;
    loop {
        tokio::time::sleep(poll_interval).await;
        let (authz, retry_after) = fetch(transport, identity, kid, authz_url).await?;
        poll_interval = retry_after.unwrap_or(POLL_INTERVAL_FLOOR);

        match authz.status {
            AuthorizationStatus::Valid => {
                info!(authz_url, "authorization validated");
                return Ok(());
            }
            AuthorizationStatus::Invalid => {
                let detail = authz
                    .challenges
                    .iter()
                    .find(|c| c.token == challenge_token && c.status == ChallengeStatus::Invalid)
                    .and_then(|c| c.error.as_ref())
                    .map(ToString::to_string)
                    .unwrap_or_default();
                return Err(AcmeError::Request(format!("authorization invalid: {detail}")));
            }
            _ => {}
        }

        if Instant::now() >= deadline {
            return Err(AcmeError::PollTimeout("authorization"));
        }
    }
}

async fn fetch(
    transport: &AcmeTransport,
    identity: &Identity,
    kid: &str,
    authz_url: &str,
) -> AcmeResult<(AuthorizationDocument, Option<Duration>)> {
    let resp = transport
        .post_as_get(identity, authz_url, kid, &[StatusCode::OK])
        .await?;
    let retry_after = resp.header("retry-after").and_then(parse_retry_after);
    Ok((resp.json()?, retry_after))
}

/// Parses a `Retry-After` header's delay-seconds form (RFC 8555's order/authorization
/// polling only ever uses seconds, never an HTTP-date).
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
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

    #[tokio::test]
    async fn test_validate_short_circuits_when_already_valid() {
        let server = MockServer::start().await;
        let dir_body = serde_json::json!({
            "newNonce": format!("{}/nonce", server.uri()),
            "newAccount": format!("{}/account", server.uri()),
            "newOrder": format!("{}/order", server.uri()),
        });
        Mock::given(method("GET"))
            .and(path("/directory"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&dir_body))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/nonce"))
            .respond_with(ResponseTemplate::new(200).insert_header("replay-nonce", "n1"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/authz/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "valid",
                "identifier": {"type": "dns", "value": "example.com"},
                "challenges": []
            })))
            .mount(&server)
            .await;

        let transport = AcmeTransport::discover(&format!("{}/directory", server.uri()), &test_settings())
            .await
            .unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let identity = Identity::load_or_generate(&tmp.path().join("id.pem")).await.unwrap();
        let store = challenge_responder::new_store();

        validate(
            &transport,
            &identity,
            "kid-1",
            &format!("{}/authz/1", server.uri()),
            &store,
        )
        .await
        .unwrap();
    }
}
