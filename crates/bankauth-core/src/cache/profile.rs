use std::path::PathBuf;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::User;
use crate::store::{SecureStore, StoreError, PROFILE_CACHE_KEY};

/// Encrypted profile file name in the cache directory
const PROFILE_FILE: &str = "profile.bin";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache key storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache encryption error: {0}")]
    Crypto(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedProfile {
    pub user: User,
    pub cached_at: DateTime<Utc>,
}

impl CachedProfile {
    pub fn new(user: User) -> Self {
        Self {
            user,
            cached_at: Utc::now(),
        }
    }
}

/// ChaCha20-Poly1305 with a random nonce per message.
/// Output layout: nonce (12 bytes) || ciphertext+tag.
pub struct ProfileCipher {
    cipher: ChaCha20Poly1305,
}

impl ProfileCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub fn generate_key() -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    fn from_hex(encoded: &str) -> Result<Self, CacheError> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| CacheError::Crypto(format!("invalid key encoding: {}", e)))?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            CacheError::Crypto(format!("invalid key length: {}", bytes.len()))
        })?;
        Ok(Self::new(&key))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CacheError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CacheError::Crypto(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CacheError> {
        if data.len() < NONCE_LEN {
            return Err(CacheError::Crypto("ciphertext too short".to_string()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| CacheError::Crypto(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct ProfileCache {
    cache_dir: PathBuf,
}

impl ProfileCache {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    fn profile_path(&self) -> PathBuf {
        self.cache_dir.join(PROFILE_FILE)
    }

    /// Load the cipher, creating and storing a fresh key when asked to
    async fn cipher(
        &self,
        store: &dyn SecureStore,
        create: bool,
    ) -> Result<Option<ProfileCipher>, CacheError> {
        if let Some(encoded) = store.get(PROFILE_CACHE_KEY).await? {
            return ProfileCipher::from_hex(&encoded).map(Some);
        }
        if !create {
            return Ok(None);
        }
        let key = ProfileCipher::generate_key();
        store.set(PROFILE_CACHE_KEY, &hex::encode(key)).await?;
        debug!("Generated profile cache key");
        Ok(Some(ProfileCipher::new(&key)))
    }

    pub async fn save(&self, store: &dyn SecureStore, user: &User) -> Result<(), CacheError> {
        let cipher = match self.cipher(store, true).await {
            Ok(Some(cipher)) => cipher,
            Ok(None) => return Err(CacheError::Crypto("no cache key".to_string())),
            Err(CacheError::Crypto(e)) => {
                // Unreadable key material: start over with a new key
                warn!(error = %e, "Replacing unreadable profile cache key");
                store.delete(PROFILE_CACHE_KEY).await?;
                self.cipher(store, true)
                    .await?
                    .ok_or_else(|| CacheError::Crypto("no cache key".to_string()))?
            }
            Err(e) => return Err(e),
        };

        let plaintext = serde_json::to_vec(&CachedProfile::new(user.clone()))?;
        let encrypted = cipher.encrypt(&plaintext)?;

        std::fs::create_dir_all(&self.cache_dir)?;
        std::fs::write(self.profile_path(), encrypted)?;
        debug!(user_id = %user.id, "Profile cached");
        Ok(())
    }

    /// A missing, corrupt or undecryptable cache reads as `None`.
    pub async fn load(&self, store: &dyn SecureStore) -> Result<Option<CachedProfile>, CacheError> {
        let path = self.profile_path();
        if !path.exists() {
            return Ok(None);
        }
        let Some(cipher) = self.cipher(store, false).await.unwrap_or_else(|e| {
            warn!(error = %e, "Profile cache key unreadable");
            None
        }) else {
            return Ok(None);
        };

        let data = std::fs::read(&path)?;
        let profile = cipher
            .decrypt(&data)
            .and_then(|plaintext| Ok(serde_json::from_slice::<CachedProfile>(&plaintext)?));
        match profile {
            Ok(profile) => Ok(Some(profile)),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable profile cache");
                Ok(None)
            }
        }
    }

    /// Delete the cache file and its key
    pub async fn clear(&self, store: &dyn SecureStore) -> Result<(), CacheError> {
        let path = self.profile_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        store.delete(PROFILE_CACHE_KEY).await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_support::test_user;

    #[test]
    fn test_cipher_round_trip_and_tamper_detection() {
        let cipher = ProfileCipher::new(&ProfileCipher::generate_key());
        let mut sealed = cipher.encrypt(b"hello").unwrap();
        assert_eq!(cipher.decrypt(&sealed).unwrap(), b"hello");

        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(cipher.decrypt(&sealed).is_err());
        assert!(cipher.decrypt(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_nonce_differs_per_message() {
        let cipher = ProfileCipher::new(&ProfileCipher::generate_key());
        assert_ne!(cipher.encrypt(b"same").unwrap(), cipher.encrypt(b"same").unwrap());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let cache = ProfileCache::new(dir.path().to_path_buf());

        cache.save(&store, &test_user()).await.unwrap();
        let raw = std::fs::read(dir.path().join(PROFILE_FILE)).unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("a@b.com"));

        let profile = cache.load(&store).await.unwrap().unwrap();
        assert_eq!(profile.user, test_user());
        assert!(profile.cached_at <= Utc::now());
    }

    #[tokio::test]
    async fn test_clear_removes_file_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let cache = ProfileCache::new(dir.path().to_path_buf());

        cache.save(&store, &test_user()).await.unwrap();
        cache.clear(&store).await.unwrap();

        assert!(!dir.path().join(PROFILE_FILE).exists());
        assert!(store.get(PROFILE_CACHE_KEY).await.unwrap().is_none());
        assert!(cache.load(&store).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_with_lost_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let cache = ProfileCache::new(dir.path().to_path_buf());

        cache.save(&store, &test_user()).await.unwrap();
        store.delete(PROFILE_CACHE_KEY).await.unwrap();
        assert!(cache.load(&store).await.unwrap().is_none());

        // A different key cannot read the old file either
        store
            .set(PROFILE_CACHE_KEY, &hex::encode(ProfileCipher::generate_key()))
            .await
            .unwrap();
        assert!(cache.load(&store).await.unwrap().is_none());
    }
}
