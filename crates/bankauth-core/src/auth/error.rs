use thiserror::Error;

use crate::api::ApiError;
use crate::store::StoreError;

/// Errors surfaced by the session manager.
///
/// `Clone` because a single refresh result is delivered to every caller that
/// joined it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Session expired - sign in required")]
    SessionExpired,

    #[error("Session timed out due to inactivity")]
    InactivityTimeout,

    #[error("Secure storage error: {0}")]
    Storage(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl AuthError {
    /// Worth retrying later without user involvement
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::Network(_) | AuthError::InvalidResponse(_))
    }

    /// The local session is gone and the user has to sign in again
    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, AuthError::SessionExpired | AuthError::InactivityTimeout)
    }

    /// Message suitable for the sign-in screen
    pub fn user_message(&self) -> &'static str {
        match self {
            AuthError::Network(_) => {
                "Unable to connect to server. Check your internet connection."
            }
            AuthError::InvalidCredentials => "Invalid email or password.",
            AuthError::SessionExpired => "Please sign in again.",
            AuthError::InactivityTimeout => "Your session timed out.",
            AuthError::Storage(_) => "Unable to save your sign-in securely on this device.",
            AuthError::InvalidResponse(_) => "Something went wrong. Please try again.",
        }
    }

    /// Map a failed `/auth/login` call
    pub(crate) fn from_login(err: ApiError) -> Self {
        if err.is_rejection() {
            AuthError::InvalidCredentials
        } else {
            err.into()
        }
    }
}

impl From<ApiError> for AuthError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::BadRequest(_) | ApiError::Unauthorized(_) | ApiError::AccessDenied(_) => {
                AuthError::SessionExpired
            }
            ApiError::Transport(e) => AuthError::Network(e.to_string()),
            ApiError::RateLimited | ApiError::ServerError(_) => AuthError::Network(err.to_string()),
            ApiError::NotFound(msg) | ApiError::InvalidResponse(msg) => {
                AuthError::InvalidResponse(msg)
            }
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        AuthError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TransportError;

    #[test]
    fn test_login_rejection_is_invalid_credentials() {
        let err = AuthError::from_login(ApiError::from_status(401, "bad password"));
        assert_eq!(err, AuthError::InvalidCredentials);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_refresh_rejection_is_session_expired() {
        let err = AuthError::from(ApiError::from_status(401, "revoked"));
        assert_eq!(err, AuthError::SessionExpired);
        assert!(err.requires_reauthentication());
    }

    #[test]
    fn test_transport_and_server_failures_are_network() {
        let err = AuthError::from(ApiError::Transport(TransportError::Timeout));
        assert!(matches!(err, AuthError::Network(_)));
        assert!(err.is_retryable());
        assert!(!err.requires_reauthentication());

        let err = AuthError::from_login(ApiError::from_status(502, "bad gateway"));
        assert!(matches!(err, AuthError::Network(_)));
    }

    #[test]
    fn test_user_messages_distinguish_teardown_reasons() {
        assert_eq!(AuthError::SessionExpired.user_message(), "Please sign in again.");
        assert_eq!(AuthError::InactivityTimeout.user_message(), "Your session timed out.");
    }
}
