//! Fixtures shared by the unit tests: a scripted transport, stores that
//! refuse or stall writes, canned response bodies and a ready-wired manager.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use crate::api::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use crate::auth::{SessionManager, User};
use crate::clock::ManualClock;
use crate::config::SessionConfig;
use crate::store::{MemoryStore, SecureStore, StoreError};

type Handler = Arc<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

#[derive(Clone)]
enum MockReply {
    Respond(HttpResponse),
    Fail(TransportError),
    Handle(Handler),
}

#[derive(Default)]
struct Routes {
    replies: HashMap<String, VecDeque<MockReply>>,
    delays: HashMap<String, Duration>,
    calls: Vec<HttpRequest>,
}

/// Transport that answers from per-path scripts.
///
/// Replies queued for a path are used in order and the last one repeats.
/// Unscripted paths answer 404.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Routes>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, path: &str, reply: MockReply) {
        self.lock()
            .replies
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Routes> {
        self.routes.lock().unwrap()
    }

    pub fn respond(&self, path: &str, status: u16, body: Value) {
        let body = if body.is_null() {
            String::new()
        } else {
            body.to_string()
        };
        self.push(path, MockReply::Respond(HttpResponse::new(status, body)));
    }

    pub fn fail(&self, path: &str, error: TransportError) {
        self.push(path, MockReply::Fail(error));
    }

    /// Answer by inspecting the request, e.g. on its bearer token
    pub fn handle<F>(&self, path: &str, handler: F)
    where
        F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    {
        self.push(path, MockReply::Handle(Arc::new(handler)));
    }

    /// Hold responses for `path` for this long (tokio time)
    pub fn delay(&self, path: &str, by: Duration) {
        self.lock().delays.insert(path.to_string(), by);
    }

    pub fn requests_to(&self, path: &str) -> Vec<HttpRequest> {
        self.lock()
            .calls
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.requests_to(path).len()
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.len()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let (reply, delay) = {
            let mut routes = self.lock();
            routes.calls.push(request.clone());
            let delay = routes.delays.get(&request.path).copied();
            let reply = routes.replies.get_mut(&request.path).and_then(|queue| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            });
            (reply, delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match reply {
            Some(MockReply::Respond(response)) => Ok(response),
            Some(MockReply::Fail(error)) => Err(error),
            Some(MockReply::Handle(handler)) => Ok(handler(&request)),
            None => Ok(HttpResponse::new(404, "not scripted")),
        }
    }
}

/// Store that accepts a fixed number of writes and fails every one after
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryStore,
    writes_allowed: usize,
    writes: AtomicUsize,
}

impl FailingStore {
    pub fn after(writes_allowed: usize) -> Self {
        Self {
            writes_allowed,
            ..Self::default()
        }
    }
}

#[async_trait]
impl SecureStore for FailingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if self.writes.fetch_add(1, Ordering::SeqCst) >= self.writes_allowed {
            return Err(StoreError::access(key, "keychain locked"));
        }
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }
}

/// Store whose writes to one key take a while (tokio time)
pub struct SlowStore {
    pub inner: MemoryStore,
    slow_key: &'static str,
    delay: Duration,
    slow_write_started: AtomicBool,
}

impl SlowStore {
    pub fn new(slow_key: &'static str, delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            slow_key,
            delay,
            slow_write_started: AtomicBool::new(false),
        }
    }

    pub fn slow_write_started(&self) -> bool {
        self.slow_write_started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecureStore for SlowStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if key == self.slow_key {
            self.slow_write_started.store(true, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
        }
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }
}

pub fn test_user() -> User {
    User {
        id: "u1".to_string(),
        email: "a@b.com".to_string(),
        first_name: "Ada".to_string(),
        last_name: "Lovelace".to_string(),
    }
}

pub fn login_body(access_token: &str, refresh_token: &str, expires_in: u64) -> Value {
    json!({
        "user": {
            "id": "u1",
            "email": "a@b.com",
            "firstName": "Ada",
            "lastName": "Lovelace"
        },
        "accessToken": access_token,
        "refreshToken": refresh_token,
        "expiresIn": expires_in
    })
}

pub fn refresh_body(access_token: &str, refresh_token: Option<&str>, expires_in: u64) -> Value {
    let mut body = json!({ "accessToken": access_token, "expiresIn": expires_in });
    if let Some(token) = refresh_token {
        body["refreshToken"] = json!(token);
    }
    body
}

pub struct Harness {
    pub manager: Arc<SessionManager>,
    pub transport: Arc<MockTransport>,
    pub store: Arc<MemoryStore>,
    pub clock: ManualClock,
}

/// Manager over a mock transport, an in-memory store and a manual clock
/// starting at 2025-01-01T00:00:00Z.
pub fn harness() -> Harness {
    harness_with(SessionConfig::default())
}

pub fn harness_with(config: SessionConfig) -> Harness {
    let transport = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    let manager = SessionManager::builder(transport.clone(), store.clone())
        .clock(Arc::new(clock.clone()))
        .config(config)
        .build();
    Harness {
        manager,
        transport,
        store,
        clock,
    }
}

/// Yield to the runtime until `condition` holds, panicking after a while
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..1000 {
        if condition().await {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
