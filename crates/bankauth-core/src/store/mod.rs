//! Secure key-value storage for session material.
//!
//! This module provides:
//! - `SecureStore`: the async get/set/delete seam the session manager consumes
//! - `KeyringStore`: OS keychain backed storage via keyring
//! - `MemoryStore`: process-local storage for tests and headless hosts
//!
//! Only per-key atomicity is assumed. Callers never rely on two keys
//! changing together.

pub mod keyring;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use self::keyring::KeyringStore;
pub use self::memory::MemoryStore;

/// Key holding the persisted refresh token (raw string value)
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Key holding the hex-encoded profile cache encryption key
pub const PROFILE_CACHE_KEY: &str = "profile_cache_key";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Secure storage unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to access '{key}': {message}")]
    Access { key: String, message: String },
}

impl StoreError {
    pub fn access(key: &str, message: impl ToString) -> Self {
        StoreError::Access {
            key: key.to_string(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
pub trait SecureStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}
