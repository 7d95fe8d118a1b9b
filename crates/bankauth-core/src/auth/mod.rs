//! Authentication session management.
//!
//! This module provides:
//! - `SessionManager`: owns the token pair, single-flight refresh, periodic
//!   refresh checks and inactivity logout
//! - `Session`: the in-memory session state and its persisted subset
//! - `LifecycleEvents`: injectable foreground/background event source
//! - `AuthError`: the error taxonomy surfaced to callers
//!
//! Access tokens live only in memory. The refresh token is the only
//! credential written to the secure store.

pub mod biometric;
pub mod error;
pub mod lifecycle;
pub mod manager;
mod refresh;
pub mod session;

pub use biometric::{BiometricPrompt, BiometricResult};
pub use error::AuthError;
pub use lifecycle::{AppState, LifecycleEvents, LifecycleSubscription};
pub use manager::{RefreshOutcome, SessionManager, SessionManagerBuilder, TeardownReason};
pub use session::{PersistedSession, Session, SessionStatus, User};
