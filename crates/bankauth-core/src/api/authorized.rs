//! Bearer-token client for the rest of the banking API.
//!
//! `AuthorizedClient` is what feature code uses instead of the raw transport.
//! It attaches the current access token, refreshes ahead of expiry, and on a
//! 401 forces a refresh and retries the request once.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::auth::{AuthError, SessionManager};

use super::client::Envelope;
use super::{HttpRequest, HttpResponse, HttpTransport};

/// Endpoints that are sent without a bearer token
pub const PUBLIC_ENDPOINTS: &[&str] = &[
    "/auth/login",
    "/auth/register",
    "/auth/forgot-password",
    "/auth/reset-password",
];

const UNAUTHORIZED: u16 = 401;

/// Client for authenticated API calls.
/// Clone is cheap - both the transport and the session manager are shared.
#[derive(Clone)]
pub struct AuthorizedClient {
    transport: Arc<dyn HttpTransport>,
    session: Arc<SessionManager>,
}

impl AuthorizedClient {
    pub fn new(transport: Arc<dyn HttpTransport>, session: Arc<SessionManager>) -> Self {
        Self { transport, session }
    }

    pub fn is_public_endpoint(path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path);
        PUBLIC_ENDPOINTS.contains(&path)
    }

    /// Send a request, authenticating it unless the endpoint is public.
    ///
    /// A 401 triggers one forced refresh and one retry. If the refresh fails
    /// its error is returned and the request is not retried. A second 401 is
    /// returned to the caller as a response.
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse, AuthError> {
        if Self::is_public_endpoint(&request.path) {
            return self.dispatch(request).await;
        }

        // Proactive refresh; an offline refresh still leaves a usable token
        match self.session.refresh_if_needed().await {
            Ok(_) => {}
            Err(e) if e.is_retryable() => {
                debug!(error = %e, "Proactive refresh failed; using current token");
            }
            Err(e) => return Err(e),
        }

        let token = self
            .session
            .access_token()
            .await
            .ok_or(AuthError::SessionExpired)?;
        self.session.record_activity().await;

        let response = self.dispatch(request.clone().with_bearer(&token)).await?;
        if response.status != UNAUTHORIZED {
            return Ok(response);
        }

        // Someone else may have refreshed while this request was out
        let retry_token = match self.session.access_token().await {
            Some(current) if current != token => current,
            _ => {
                warn!(path = %request.path, "Access token rejected; forcing refresh");
                self.session.force_refresh().await?
            }
        };
        self.dispatch(request.with_bearer(&retry_token)).await
    }

    /// GET `path` and deserialize a successful JSON body (bare or `{data}`)
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, AuthError> {
        let response = self.send(HttpRequest::get(path)).await?;
        if !response.is_success() {
            return Err(AuthError::InvalidResponse(format!(
                "GET {} returned {}",
                path, response.status
            )));
        }
        response
            .json::<Envelope<T>>()
            .map(Envelope::into_inner)
            .map_err(|e| AuthError::InvalidResponse(format!("Failed to parse response: {}", e)))
    }

    async fn dispatch(&self, request: HttpRequest) -> Result<HttpResponse, AuthError> {
        self.transport
            .request(request)
            .await
            .map_err(|e| AuthError::Network(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::client::{LOGIN_PATH, REFRESH_PATH};
    use crate::api::TransportError;
    use crate::auth::SessionStatus;
    use crate::test_support::{harness, login_body, refresh_body, Harness};
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;

    const ACCOUNTS_PATH: &str = "/accounts";

    async fn signed_in() -> (Harness, AuthorizedClient) {
        let h = harness();
        h.transport
            .respond(LOGIN_PATH, 200, login_body("AT1", "RT1", 3600));
        h.manager.login("a@b.com", "pw").await.unwrap();
        let client = AuthorizedClient::new(h.transport.clone(), h.manager.clone());
        (h, client)
    }

    /// 200 for the current token, 401 for anything else
    fn accept_only(h: &Harness, token: &'static str) {
        h.transport.handle(ACCOUNTS_PATH, move |request| {
            if request.header("Authorization") == Some(format!("Bearer {}", token).as_str()) {
                HttpResponse::new(200, json!({ "data": [{ "id": "acc-1" }] }).to_string())
            } else {
                HttpResponse::new(401, "expired")
            }
        });
    }

    #[test]
    fn test_public_endpoints() {
        assert!(AuthorizedClient::is_public_endpoint("/auth/login"));
        assert!(AuthorizedClient::is_public_endpoint("/auth/reset-password?token=x"));
        assert!(!AuthorizedClient::is_public_endpoint("/auth/logout"));
        assert!(!AuthorizedClient::is_public_endpoint("/accounts"));
    }

    #[tokio::test]
    async fn test_injects_bearer_token() {
        let (h, client) = signed_in().await;
        accept_only(&h, "AT1");

        let response = client.send(HttpRequest::get(ACCOUNTS_PATH)).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(
            h.transport.requests_to(ACCOUNTS_PATH)[0].header("Authorization"),
            Some("Bearer AT1")
        );
    }

    #[tokio::test]
    async fn test_public_endpoint_sent_without_token() {
        let h = harness();
        h.transport.respond("/auth/register", 201, json!({}));
        let client = AuthorizedClient::new(h.transport.clone(), h.manager.clone());

        let response = client
            .send(HttpRequest::post("/auth/register").with_json(json!({ "email": "a@b.com" })))
            .await
            .unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(
            h.transport.requests_to("/auth/register")[0].header("Authorization"),
            None
        );
    }

    #[tokio::test]
    async fn test_unauthenticated_request_is_not_sent() {
        let h = harness();
        let client = AuthorizedClient::new(h.transport.clone(), h.manager.clone());

        let err = client.send(HttpRequest::get(ACCOUNTS_PATH)).await.unwrap_err();

        assert_eq!(err, AuthError::SessionExpired);
        assert_eq!(h.transport.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_401_refreshes_and_retries_once() {
        let (h, client) = signed_in().await;
        accept_only(&h, "AT2");
        h.transport
            .respond(REFRESH_PATH, 200, refresh_body("AT2", Some("RT2"), 3600));

        let response = client.send(HttpRequest::get(ACCOUNTS_PATH)).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(h.transport.calls_to(REFRESH_PATH), 1);
        let sent = h.transport.requests_to(ACCOUNTS_PATH);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].header("Authorization"), Some("Bearer AT2"));
    }

    #[tokio::test]
    async fn test_rejected_refresh_is_not_retried() {
        let (h, client) = signed_in().await;
        accept_only(&h, "AT2");
        h.transport
            .respond(REFRESH_PATH, 401, json!({ "message": "revoked" }));

        let err = client.send(HttpRequest::get(ACCOUNTS_PATH)).await.unwrap_err();

        assert_eq!(err, AuthError::SessionExpired);
        assert_eq!(h.transport.calls_to(ACCOUNTS_PATH), 1);
        assert_eq!(h.manager.status(), SessionStatus::Unauthenticated);
    }

    #[tokio::test]
    async fn test_offline_proactive_refresh_still_sends() {
        let (h, client) = signed_in().await;
        accept_only(&h, "AT1");
        h.transport.fail(REFRESH_PATH, TransportError::Timeout);
        h.clock.advance(chrono::Duration::seconds(3500));

        let response = client.send(HttpRequest::get(ACCOUNTS_PATH)).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(h.transport.calls_to(REFRESH_PATH), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_401s_share_one_refresh() {
        let (h, client) = signed_in().await;
        accept_only(&h, "AT2");
        h.transport
            .respond(REFRESH_PATH, 200, refresh_body("AT2", None, 3600));
        h.transport.delay(REFRESH_PATH, Duration::from_millis(100));

        let responses = futures::future::join_all(
            (0..5).map(|_| client.send(HttpRequest::get(ACCOUNTS_PATH))),
        )
        .await;

        assert_eq!(h.transport.calls_to(REFRESH_PATH), 1);
        assert!(responses.into_iter().all(|r| r.unwrap().status == 200));
    }

    #[derive(Debug, Deserialize)]
    struct Account {
        id: String,
    }

    #[tokio::test]
    async fn test_get_json_unwraps_envelope() {
        let (h, client) = signed_in().await;
        accept_only(&h, "AT1");

        let accounts: Vec<Account> = client.get_json(ACCOUNTS_PATH).await.unwrap();

        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, "acc-1");
    }
}
