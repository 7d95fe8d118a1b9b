//! The session entity and its persisted subset.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{SecureStore, StoreError, REFRESH_TOKEN_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Refreshing,
    /// Published when a refresh is rejected, immediately before teardown
    Expired,
    /// Published when a login could not be persisted, immediately before teardown
    Error,
}

impl SessionStatus {
    /// Whether an access token is held in this state
    pub fn has_access_token(self) -> bool {
        matches!(self, SessionStatus::Authenticated | SessionStatus::Refreshing)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

impl User {
    /// "First Last", falling back to the email when no name is on file
    pub fn display_name(&self) -> String {
        let name = format!("{} {}", self.first_name.trim(), self.last_name.trim());
        let name = name.trim();
        if name.is_empty() {
            self.email.clone()
        } else {
            name.to_string()
        }
    }
}

/// Absolute expiry for a token received at `now` with a lifetime of
/// `expires_in_secs`. Saturates instead of overflowing on absurd lifetimes.
pub fn expiry_from(now: DateTime<Utc>, expires_in_secs: u64) -> DateTime<Utc> {
    let millis = i64::try_from(expires_in_secs)
        .unwrap_or(i64::MAX)
        .saturating_mul(1000);
    Duration::try_milliseconds(millis)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Authentication state. Only `SessionManager` mutates it.
#[derive(Debug, Clone)]
pub struct Session {
    status: SessionStatus,
    user: Option<User>,
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    last_activity_at: Option<DateTime<Utc>>,
    backgrounded_at: Option<DateTime<Utc>>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            status: SessionStatus::Unauthenticated,
            user: None,
            access_token: None,
            refresh_token: None,
            expires_at: None,
            last_activity_at: None,
            backgrounded_at: None,
        }
    }
}

impl Session {
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        self.last_activity_at
    }

    pub fn backgrounded_at(&self) -> Option<DateTime<Utc>> {
        self.backgrounded_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|expiry| now >= expiry).unwrap_or(true)
    }

    /// Check if the access token expires within `buffer` and should be refreshed
    pub fn needs_refresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        match self.expires_at {
            Some(expiry) => expiry - now <= buffer,
            None => false,
        }
    }

    /// Time left on the access token, never negative
    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at
            .map(|expiry| (expiry - now).max(Duration::zero()))
            .unwrap_or_else(Duration::zero)
    }

    /// Holds an access token that has not yet expired
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.status.has_access_token() && self.access_token.is_some() && !self.is_expired(now)
    }

    /// Drop any existing credentials and enter AUTHENTICATING
    pub(crate) fn begin_authentication(&mut self) {
        *self = Session {
            status: SessionStatus::Authenticating,
            ..Session::default()
        };
    }

    /// Install a freshly issued token pair and enter AUTHENTICATED
    pub(crate) fn establish(
        &mut self,
        user: Option<User>,
        access_token: String,
        refresh_token: String,
        expires_in_secs: u64,
        now: DateTime<Utc>,
    ) {
        *self = Session {
            status: SessionStatus::Authenticated,
            user,
            access_token: Some(access_token),
            refresh_token: Some(refresh_token),
            expires_at: Some(expiry_from(now, expires_in_secs)),
            last_activity_at: Some(now),
            backgrounded_at: None,
        };
    }

    pub(crate) fn begin_refresh(&mut self) {
        if self.status == SessionStatus::Authenticated {
            self.status = SessionStatus::Refreshing;
        }
    }

    /// Apply a successful refresh. A missing `rotated` token keeps the current one.
    pub(crate) fn apply_refresh(
        &mut self,
        access_token: String,
        rotated: Option<String>,
        expires_in_secs: u64,
        now: DateTime<Utc>,
    ) {
        self.access_token = Some(access_token);
        if rotated.is_some() {
            self.refresh_token = rotated;
        }
        self.expires_at = Some(expiry_from(now, expires_in_secs));
        self.status = SessionStatus::Authenticated;
    }

    /// Leave REFRESHING without new tokens (the refresh failed retryably)
    pub(crate) fn end_refresh(&mut self) {
        if self.status == SessionStatus::Refreshing {
            self.status = SessionStatus::Authenticated;
        }
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = Some(now);
    }

    pub(crate) fn mark_backgrounded(&mut self, now: DateTime<Utc>) {
        self.backgrounded_at = Some(now);
    }

    pub(crate) fn take_backgrounded_at(&mut self) -> Option<DateTime<Utc>> {
        self.backgrounded_at.take()
    }

    /// Forget every credential and return to UNAUTHENTICATED
    pub(crate) fn clear(&mut self) {
        *self = Session::default();
    }
}

/// The durable subset of a session: the refresh token and nothing else.
///
/// Every write of session material to the secure store goes through here,
/// which keeps the access token out of durable storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedSession {
    pub refresh_token: String,
}

impl PersistedSession {
    pub fn from_session(session: &Session) -> Option<Self> {
        session.refresh_token().map(|token| PersistedSession {
            refresh_token: token.to_string(),
        })
    }

    pub async fn load(store: &dyn SecureStore) -> Result<Option<Self>, StoreError> {
        Ok(store
            .get(REFRESH_TOKEN_KEY)
            .await?
            .filter(|token| !token.trim().is_empty())
            .map(|refresh_token| PersistedSession { refresh_token }))
    }

    pub async fn save(&self, store: &dyn SecureStore) -> Result<(), StoreError> {
        store.set(REFRESH_TOKEN_KEY, &self.refresh_token).await
    }

    pub async fn erase(store: &dyn SecureStore) -> Result<(), StoreError> {
        store.delete(REFRESH_TOKEN_KEY).await
    }
}
