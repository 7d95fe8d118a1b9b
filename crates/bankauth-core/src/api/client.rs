//! Typed client for the `/auth/*` endpoints.
//!
//! Each call is exactly one request; there is no retry here. Retry policy is
//! the session manager's call (and for auth endpoints it never retries).

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::auth::User;

use super::transport::{HttpRequest, HttpResponse, HttpTransport};
use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

pub const LOGIN_PATH: &str = "/auth/login";
pub const REFRESH_PATH: &str = "/auth/refresh";
pub const LOGOUT_PATH: &str = "/auth/logout";
pub const LOGOUT_ALL_PATH: &str = "/auth/logout/all";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub user: User,
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    /// Present only when the server rotates the refresh token
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
}

/// The backend may wrap payloads as `{"data": ...}` or send them bare.
#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    pub(crate) fn into_inner(self) -> T {
        match self {
            Envelope::Wrapped { data } => data,
            Envelope::Bare(inner) => inner,
        }
    }
}

#[derive(Clone)]
pub struct AuthApi {
    transport: Arc<dyn HttpTransport>,
}

impl AuthApi {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    /// Exchange credentials for a token pair
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let request =
            HttpRequest::post(LOGIN_PATH).with_json(json!({ "email": email, "password": password }));
        let response = self.send(request).await?;
        Self::parse(&response)
    }

    /// Exchange a refresh token for a fresh access token
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, ApiError> {
        let request =
            HttpRequest::post(REFRESH_PATH).with_json(json!({ "refreshToken": refresh_token }));
        let response = self.send(request).await?;
        Self::parse(&response)
    }

    /// Invalidate the current session server-side
    pub async fn logout(&self, access_token: Option<&str>) -> Result<(), ApiError> {
        self.post_empty(LOGOUT_PATH, access_token).await
    }

    /// Invalidate every session for the user, on all devices
    pub async fn logout_all(&self, access_token: Option<&str>) -> Result<(), ApiError> {
        self.post_empty(LOGOUT_ALL_PATH, access_token).await
    }

    async fn post_empty(&self, path: &str, access_token: Option<&str>) -> Result<(), ApiError> {
        let mut request = HttpRequest::post(path);
        if let Some(token) = access_token {
            request = request.with_bearer(token);
        }
        self.send(request).await?;
        Ok(())
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let path = request.path.clone();
        let response = self.transport.request(request).await.map_err(|e| {
            warn!(path = %path, error = %e, "Transport failure");
            ApiError::from(e)
        })?;
        debug!(path = %path, status = response.status, "Auth endpoint responded");
        Self::check_response(response)
    }

    /// Check if response is successful, returning an error with body if not.
    fn check_response(response: HttpResponse) -> Result<HttpResponse, ApiError> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status, &response.body))
        }
    }

    fn parse<T: DeserializeOwned>(response: &HttpResponse) -> Result<T, ApiError> {
        response
            .json::<Envelope<T>>()
            .map(Envelope::into_inner)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TransportError;
    use crate::test_support::{login_body, MockTransport};
    use serde_json::json;

    #[tokio::test]
    async fn test_login_parses_bare_response() {
        let transport = MockTransport::new();
        transport.respond(LOGIN_PATH, 200, login_body("AT1", "RT1", 3600));
        let api = AuthApi::new(transport.clone());

        let response = api.login("a@b.com", "secret123").await.unwrap();
        assert_eq!(response.access_token, "AT1");
        assert_eq!(response.refresh_token, "RT1");
        assert_eq!(response.expires_in, 3600);
        assert_eq!(response.user.email, "a@b.com");

        let sent = transport.requests_to(LOGIN_PATH);
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].body,
            Some(json!({ "email": "a@b.com", "password": "secret123" }))
        );
    }

    #[tokio::test]
    async fn test_refresh_parses_wrapped_response_without_rotation() {
        let transport = MockTransport::new();
        transport.respond(
            REFRESH_PATH,
            200,
            json!({ "data": { "accessToken": "AT2", "expiresIn": 900 } }),
        );
        let api = AuthApi::new(transport.clone());

        let response = api.refresh("RT1").await.unwrap();
        assert_eq!(response.access_token, "AT2");
        assert_eq!(response.refresh_token, None);
        assert_eq!(
            transport.requests_to(REFRESH_PATH)[0].body,
            Some(json!({ "refreshToken": "RT1" }))
        );
    }

    #[tokio::test]
    async fn test_rejection_and_transport_errors() {
        let transport = MockTransport::new();
        transport.respond(REFRESH_PATH, 401, json!({ "message": "revoked" }));
        transport.fail(LOGIN_PATH, TransportError::Timeout);
        let api = AuthApi::new(transport);

        assert!(api.refresh("RT1").await.unwrap_err().is_rejection());
        assert!(matches!(
            api.login("a@b.com", "pw").await.unwrap_err(),
            ApiError::Transport(TransportError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_response() {
        let transport = MockTransport::new();
        transport.respond(LOGIN_PATH, 200, json!({ "token": "wrong-shape" }));
        let api = AuthApi::new(transport);

        assert!(matches!(
            api.login("a@b.com", "pw").await.unwrap_err(),
            ApiError::InvalidResponse(_)
        ));
    }

    #[tokio::test]
    async fn test_logout_sends_bearer() {
        let transport = MockTransport::new();
        transport.respond(LOGOUT_PATH, 204, json!(null));
        let api = AuthApi::new(transport.clone());

        api.logout(Some("AT1")).await.unwrap();
        assert_eq!(
            transport.requests_to(LOGOUT_PATH)[0].header("Authorization"),
            Some("Bearer AT1")
        );
    }
}
