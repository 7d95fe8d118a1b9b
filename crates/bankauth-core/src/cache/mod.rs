//! Encrypted at-rest cache for the signed-in user's profile.
//!
//! A refresh response carries no user record, so a session restored at
//! startup would not know who is signed in. `ProfileCache` keeps the last
//! user record on disk, encrypted with ChaCha20-Poly1305 under a key held in
//! the secure store. It is wiped together with the session.

pub mod profile;

pub use profile::{CacheError, CachedProfile, ProfileCache, ProfileCipher};
