use async_trait::async_trait;
use keyring::Entry;
use tracing::debug;

use super::{SecureStore, StoreError};

/// Secure store backed by the OS keychain.
///
/// Each key becomes a keychain entry under the configured service name.
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, StoreError> {
        Entry::new(&self.service, key)
            .map_err(|e| StoreError::Unavailable(format!("Failed to create keyring entry: {}", e)))
    }
}

#[async_trait]
impl SecureStore for KeyringStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StoreError::access(key, e)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| StoreError::access(key, e))?;
        debug!(service = %self.service, key, "Stored keychain entry");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => {
                debug!(service = %self.service, key, "Deleted keychain entry");
                Ok(())
            }
            Err(e) => Err(StoreError::access(key, e)),
        }
    }
}
