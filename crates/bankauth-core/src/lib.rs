//! Core library for bankauth - session manager, auth API client, secure storage.
//!
//! The centrepiece is [`SessionManager`], which owns the access/refresh token
//! pair for the mobile banking client. It coordinates a single in-flight
//! refresh across concurrent callers and tears the session down on logout,
//! rejection or inactivity.

pub mod api;
pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{
    ApiError, AuthApi, AuthorizedClient, HttpRequest, HttpResponse, HttpTransport,
    ReqwestTransport, TransportError,
};
pub use auth::{
    AppState, AuthError, BiometricPrompt, BiometricResult, LifecycleEvents,
    LifecycleSubscription, RefreshOutcome, Session, SessionManager, SessionManagerBuilder,
    SessionStatus, TeardownReason, User,
};
pub use cache::ProfileCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SessionConfig;
pub use store::{KeyringStore, MemoryStore, SecureStore, StoreError};
