//! Plain HTTP listener on port 80 with two mutually exclusive modes: serving HTTP-01
//! challenges while a certificate is being provisioned, redirecting to HTTPS otherwise.
//! Built on `poem` the way the teacher's `acme/http01.rs::start_http01_server` does,
//! generalized from a single-route challenge server into the two-mode switch spec.md
//! §4.11 describes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use poem::http::StatusCode;
use poem::listener::TcpListener;
use poem::web::Data;
use poem::{EndpointExt, IntoResponse, Request, Response, Route, Server, handler};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::acme::ChallengeStore;

const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";
const CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

struct FrontDoorState {
    challenge_mode: Arc<AtomicBool>,
    challenges: ChallengeStore,
}

async fn serve_challenge(req: &Request, challenges: &ChallengeStore) -> Response {
    let path = req.uri().path();
    let Some(token) = path.strip_prefix(CHALLENGE_PREFIX) else {
        return StatusCode::FORBIDDEN.into_response();
    };
    if token.is_empty() || token.contains('/') {
        return StatusCode::FORBIDDEN.into_response();
    }

    let guard = challenges.lock().await;
    guard.get(token).map_or_else(
        || StatusCode::FORBIDDEN.into_response(),
        |key_auth| {
            (
                StatusCode::OK,
                [("content-type", CONTENT_TYPE_OCTET_STREAM)],
                key_auth.clone(),
            )
                .into_response()
        },
    )
}

fn serve_redirect(req: &Request) -> Response {
    let Some(host) = req.header("host") else {
        return StatusCode::FORBIDDEN.into_response();
    };
    if !is_valid_host(host) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let path_and_query = req
        .uri()
        .path_and_query()
        .map_or("/", poem::http::uri::PathAndQuery::as_str);
    let location = format!("https://{host}{path_and_query}");

    if poem::http::Uri::try_from(location.as_str()).is_err() {
        return StatusCode::FORBIDDEN.into_response();
    }

    Response::builder()
        .status(StatusCode::TEMPORARY_REDIRECT)
        .header("location", location)
        .finish()
}

/// A bare host header (optionally `host:port`) containing only characters valid in a
/// DNS name or IP literal. Rejects anything that could smuggle extra path/query
/// segments into the redirect `Location`.
fn is_valid_host(host: &str) -> bool {
    !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'))
}

#[handler]
async fn handle_any(req: &Request, Data(state): Data<&Arc<FrontDoorState>>) -> Response {
    if state.challenge_mode.load(Ordering::SeqCst) {
        serve_challenge(req, &state.challenges).await
    } else {
        serve_redirect(req)
    }
}

/// The port-80 HTTP listener AutoTLS front-ends its HTTPS service with.
pub struct HttpFrontDoor {
    challenge_mode: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HttpFrontDoor {
    /// Binds `port` and starts serving immediately in challenge mode. The only public
    /// constructor; there is no way to obtain an `HttpFrontDoor` without a bound
    /// listener already running.
    #[must_use]
    pub fn start(port: u16, challenges: ChallengeStore) -> Self {
        let challenge_mode = Arc::new(AtomicBool::new(true));
        let state = Arc::new(FrontDoorState {
            challenge_mode: Arc::clone(&challenge_mode),
            challenges,
        });

        let handle = tokio::spawn(async move {
            let app = Route::new().at("/*path", handle_any).data(state);
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            info!(%addr, "starting http front door");
            if let Err(err) = Server::new(TcpListener::bind(addr)).run(app).await {
                error!(%err, "http front door failed");
            }
        });

        Self {
            challenge_mode,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Switches between challenge mode (serve `/.well-known/acme-challenge/...`, 403
    /// everything else) and redirect mode (307 everything to HTTPS, 403 on a malformed
    /// `Host`).
    pub fn set_challenge_mode(&self, enabled: bool) {
        self.challenge_mode.store(enabled, Ordering::SeqCst);
    }

    /// Terminates the listener and all open connections without waiting for them to
    /// drain (spec.md §4.11).
    pub async fn shutdown(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }
}
