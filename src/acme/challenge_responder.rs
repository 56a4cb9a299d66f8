//! HTTP-01 challenge responder: a shared token→key-authorization map served under
//! `/.well-known/acme-challenge/<token>`. Kept close to the teacher's standalone
//! responder, but exposed as a value embedded inside [`crate::http_front_door`] rather
//! than owning its own listener.

use std::collections::HashMap;
use std::sync::Arc;

use poem::http::StatusCode;
use poem::web::{Data, Path};
use poem::{EndpointExt, IntoResponse, Response, Route, handler};
use tokio::sync::Mutex;

const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

pub type ChallengeStore = Arc<Mutex<HashMap<String, String>>>;

#[must_use]
pub fn new_store() -> ChallengeStore {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Registers a token's key-authorization. Overwrites any prior value for the same
/// token.
pub async fn register(store: &ChallengeStore, token: &str, key_authorization: &str) {
    store
        .lock()
        .await
        .insert(token.to_string(), key_authorization.to_string());
}

/// Deregisters a token once its authorization has resolved, valid or not.
pub async fn deregister(store: &ChallengeStore, token: &str) {
    store.lock().await.remove(token);
}

async fn resolve(token: &str, store: &ChallengeStore) -> Response {
    let guard = store.lock().await;
    guard.get(token).map_or_else(
        || StatusCode::NOT_FOUND.into_response(),
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

#[handler]
async fn handle_challenge(Path(token): Path<String>, Data(store): Data<&ChallengeStore>) -> Response {
    resolve(&token, store).await
}

/// Builds the `poem` route serving the well-known challenge path, to be nested inside
/// [`crate::http_front_door::HttpFrontDoor`].
#[must_use]
pub fn route(store: ChallengeStore) -> Route {
    Route::new()
        .at(
            "/.well-known/acme-challenge/:token",
            poem::get(handle_challenge),
        )
        .data(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_challenge_hit() {
        let store = new_store();
        register(&store, "token-1", "key-auth-1").await;

        let mut resp = resolve("token-1", &store).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            CONTENT_TYPE_OCTET_STREAM
        );
        let body = resp.take_body().into_string().await.unwrap();
        assert_eq!(body, "key-auth-1");
    }

    #[tokio::test]
    async fn test_challenge_miss() {
        let store = new_store();
        let resp = resolve("missing", &store).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_deregister_removes_token() {
        let store = new_store();
        register(&store, "token-2", "key-auth-2").await;
        deregister(&store, "token-2").await;

        let resp = resolve("token-2", &store).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
