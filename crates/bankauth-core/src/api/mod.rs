//! HTTP plumbing for the authentication endpoints.
//!
//! This module provides the `HttpTransport` seam (with a reqwest-backed
//! implementation), the typed `AuthApi` client for `/auth/*`, and the
//! `AuthorizedClient` that injects bearer tokens into other API calls and
//! routes 401 responses back into the session manager.

pub mod authorized;
pub mod client;
pub mod error;
pub mod transport;

pub use authorized::AuthorizedClient;
pub use client::{AuthApi, LoginResponse, RefreshResponse};
pub use error::ApiError;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError};
