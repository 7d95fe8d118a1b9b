//! The session manager.
//!
//! One `SessionManager` is built at startup and shared as an
//! `Arc<SessionManager>` with everything that needs authentication: the
//! HTTP layer (bearer injection, 401 handling) and the UI (status display).
//!
//! The session state lock is never held across network or storage I/O.
//! Changes that touch both memory and the secure store, and the status
//! published for them, run under a separate commit lock. Every login, restore
//! or teardown bumps a session epoch; a refresh that finishes after the
//! session it started under is gone discards its result.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError, Weak};

use chrono::{DateTime, Duration, Utc};
use futures::future::FutureExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{AuthApi, HttpTransport, ReqwestTransport, TransportError};
use crate::cache::ProfileCache;
use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::store::{KeyringStore, SecureStore};

use super::biometric::BiometricPrompt;
use super::lifecycle::{AppState, LifecycleEvents, LifecycleSubscription};
use super::refresh::{Claim, RefreshSlot};
use super::session::{PersistedSession, Session, SessionStatus, User};
use super::AuthError;

/// Result of a refresh check that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The access token is outside the refresh buffer; nothing was done
    StillValid,
    /// A refresh ran (or was joined) and produced this access token
    Refreshed { access_token: String },
    /// No authenticated session to refresh
    NotAuthenticated,
}

impl RefreshOutcome {
    /// Whether an authenticated session with a usable token remains
    pub fn is_valid(&self) -> bool {
        !matches!(self, RefreshOutcome::NotAuthenticated)
    }
}

/// Why the last session ended. Drives the message on the sign-in screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    SignedOut,
    SessionExpired,
    InactivityTimeout,
    StorageFailure,
}

impl TeardownReason {
    pub fn message(self) -> &'static str {
        match self {
            TeardownReason::SignedOut => "You have been signed out.",
            TeardownReason::SessionExpired => AuthError::SessionExpired.user_message(),
            TeardownReason::InactivityTimeout => AuthError::InactivityTimeout.user_message(),
            TeardownReason::StorageFailure => {
                AuthError::Storage(String::new()).user_message()
            }
        }
    }
}

struct State {
    session: Session,
    epoch: u64,
    last_teardown: Option<TeardownReason>,
}

pub struct SessionManagerBuilder {
    transport: Arc<dyn HttpTransport>,
    store: Arc<dyn SecureStore>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    profile_cache: Option<ProfileCache>,
}

impl SessionManagerBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn profile_cache(mut self, cache: ProfileCache) -> Self {
        self.profile_cache = Some(cache);
        self
    }

    pub fn build(self) -> Arc<SessionManager> {
        let (status_tx, _) = watch::channel(SessionStatus::Unauthenticated);
        Arc::new_cyclic(|weak_self| SessionManager {
            api: AuthApi::new(self.transport),
            store: self.store,
            clock: self.clock,
            config: self.config,
            profile_cache: self.profile_cache,
            state: RwLock::new(State {
                session: Session::default(),
                epoch: 0,
                last_teardown: None,
            }),
            commit: Mutex::new(()),
            refresh: Arc::new(RefreshSlot::default()),
            timer: StdMutex::new(None),
            status_tx,
            weak_self: weak_self.clone(),
        })
    }
}

pub struct SessionManager {
    api: AuthApi,
    store: Arc<dyn SecureStore>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    profile_cache: Option<ProfileCache>,
    state: RwLock<State>,
    /// Serializes changes that touch both memory and the secure store
    commit: Mutex<()>,
    refresh: Arc<RefreshSlot>,
    timer: StdMutex<Option<JoinHandle<()>>>,
    status_tx: watch::Sender<SessionStatus>,
    weak_self: Weak<SessionManager>,
}

impl SessionManager {
    pub fn builder(
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn SecureStore>,
    ) -> SessionManagerBuilder {
        SessionManagerBuilder {
            transport,
            store,
            clock: Arc::new(SystemClock),
            config: SessionConfig::default(),
            profile_cache: None,
        }
    }

    /// Production wiring: reqwest transport and OS keychain storage
    pub fn from_config(config: SessionConfig) -> Result<Arc<Self>, TransportError> {
        let transport = ReqwestTransport::new(&config.api_base_url, config.request_timeout())?;
        let store = KeyringStore::new(&config.keychain_service);
        let mut builder = Self::builder(Arc::new(transport), Arc::new(store));
        match SessionConfig::cache_dir() {
            Ok(dir) => builder = builder.profile_cache(ProfileCache::new(dir)),
            Err(e) => warn!(error = %e, "No cache directory; profile cache disabled"),
        }
        Ok(builder.config(config).build())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // =========================================================================
    // Read accessors
    // =========================================================================

    pub fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    /// Watch status changes (for the UI layer)
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    /// Snapshot of the current session
    pub async fn session(&self) -> Session {
        self.state.read().await.session.clone()
    }

    pub async fn user(&self) -> Option<User> {
        self.state.read().await.session.user().cloned()
    }

    pub async fn access_token(&self) -> Option<String> {
        self.state
            .read()
            .await
            .session
            .access_token()
            .map(str::to_string)
    }

    pub async fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.session.expires_at()
    }

    pub async fn time_until_expiry(&self) -> Duration {
        let now = self.clock.now();
        self.state.read().await.session.time_until_expiry(now)
    }

    /// Authenticated with an access token that has not yet expired
    pub async fn is_session_valid(&self) -> bool {
        let now = self.clock.now();
        self.state.read().await.session.is_valid(now)
    }

    pub async fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.session.last_activity_at()
    }

    pub async fn last_teardown(&self) -> Option<TeardownReason> {
        self.state.read().await.last_teardown
    }

    pub async fn refresh_in_flight(&self) -> bool {
        self.refresh.in_flight().await
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// Restore a session from the persisted refresh token.
    ///
    /// Returns `true` when a session was restored. Never fails: a missing or
    /// rejected token yields `false` (a rejected one is also deleted), and a
    /// network failure yields `false` while keeping the token for next time.
    pub async fn initialize(&self) -> bool {
        let persisted = match PersistedSession::load(self.store.as_ref()).await {
            Ok(Some(persisted)) => persisted,
            Ok(None) => {
                debug!("No persisted refresh token");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read persisted session");
                return false;
            }
        };

        let epoch = {
            let _commit = self.commit.lock().await;
            let mut state = self.state.write().await;
            state.epoch += 1;
            state.session.begin_authentication();
            self.cancel_periodic_refresh_check();
            self.publish(SessionStatus::Authenticating);
            state.epoch
        };

        let response = match self.api.refresh(&persisted.refresh_token).await {
            Ok(response) => response,
            Err(e) => {
                let err = AuthError::from(e);
                if err.is_retryable() {
                    warn!(error = %err, "Could not restore session; keeping refresh token");
                    self.abandon_authentication(epoch).await;
                } else {
                    info!(error = %err, "Persisted refresh token rejected");
                    self.teardown(TeardownReason::SessionExpired, Some(epoch))
                        .await;
                }
                return false;
            }
        };

        let user = self.load_cached_user().await;
        let now = self.clock.now();
        let rotated = response.refresh_token.is_some();
        let refresh_token = response
            .refresh_token
            .unwrap_or(persisted.refresh_token);

        let _commit = self.commit.lock().await;
        if self.state.read().await.epoch != epoch {
            debug!("Session changed during restore; discarding result");
            return false;
        }
        if rotated && self.persist_or_abandon(&refresh_token).await.is_err() {
            return false;
        }
        self.state.write().await.session.establish(
            user,
            response.access_token,
            refresh_token,
            response.expires_in,
            now,
        );
        self.publish(SessionStatus::Authenticated);
        self.schedule_periodic_refresh_check();
        info!(expires_in = response.expires_in, rotated, "Session restored");
        true
    }

    /// Re-open the session from a biometric unlock.
    ///
    /// The prompt gates access to the persisted refresh token; a failed or
    /// cancelled prompt makes no network call.
    pub async fn unlock_with_biometrics(&self, prompt: &dyn BiometricPrompt, message: &str) -> bool {
        let result = prompt.authenticate(message).await;
        if !result.success {
            info!(error = ?result.error, "Biometric unlock failed");
            return false;
        }
        self.initialize().await
    }

    // =========================================================================
    // Login / logout
    // =========================================================================

    /// Sign in with email and password, superseding any existing session.
    pub async fn login(&self, email: &str, password: &str) -> Result<User, AuthError> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }

        let epoch = {
            let _commit = self.commit.lock().await;
            let mut state = self.state.write().await;
            state.epoch += 1;
            state.last_teardown = None;
            state.session.begin_authentication();
            self.cancel_periodic_refresh_check();
            self.publish(SessionStatus::Authenticating);
            state.epoch
        };

        let response = match self.api.login(email.trim(), password).await {
            Ok(response) => response,
            Err(e) => {
                let err = AuthError::from_login(e);
                warn!(error = %err, "Login failed");
                self.abandon_authentication(epoch).await;
                return Err(err);
            }
        };

        let now = self.clock.now();
        let user = response.user.clone();

        // Everything from here to the end runs under the commit lock so a
        // concurrent logout sees either no session or a complete one
        let _commit = self.commit.lock().await;
        if self.state.read().await.epoch != epoch {
            debug!("Login superseded before completion");
            return Err(AuthError::SessionExpired);
        }

        // The refresh token must be durable before the session counts as established
        self.persist_or_abandon(&response.refresh_token).await?;

        self.state.write().await.session.establish(
            Some(response.user),
            response.access_token,
            response.refresh_token,
            response.expires_in,
            now,
        );
        self.publish(SessionStatus::Authenticated);
        self.save_cached_user(&user).await;
        self.schedule_periodic_refresh_check();
        info!(user_id = %user.id, expires_in = response.expires_in, "Login successful");
        Ok(user)
    }

    /// Sign out. Local state is always cleared; the server call is best effort.
    pub async fn logout(&self) {
        self.sign_out(false, TeardownReason::SignedOut, None).await;
    }

    /// Sign out and revoke every session for this user on all devices
    pub async fn logout_all_devices(&self) {
        self.sign_out(true, TeardownReason::SignedOut, None).await;
    }

    /// Best-effort server logout, then local teardown. With `epoch`, does
    /// nothing if that session has already been replaced.
    async fn sign_out(&self, all_devices: bool, reason: TeardownReason, epoch: Option<u64>) -> bool {
        let (access_token, current) = {
            let state = self.state.read().await;
            (
                state.session.access_token().map(str::to_string),
                state.epoch,
            )
        };
        if epoch.is_some_and(|expected| expected != current) {
            return false;
        }

        if let Some(ref token) = access_token {
            let result = if all_devices {
                self.api.logout_all(Some(token)).await
            } else {
                self.api.logout(Some(token)).await
            };
            if let Err(e) = result {
                warn!(error = %e, all_devices, "Server logout failed; clearing local session anyway");
            }
        }

        self.teardown(reason, epoch).await
    }

    // =========================================================================
    // Refresh
    // =========================================================================

    /// Refresh the access token if it expires within the refresh buffer.
    ///
    /// Joins the in-flight refresh if there is one. A rejected refresh tears
    /// the session down and yields `SessionExpired`; a network failure keeps
    /// the session and yields `Network`.
    pub async fn refresh_if_needed(&self) -> Result<RefreshOutcome, AuthError> {
        self.refresh_with(false).await
    }

    /// Refresh now regardless of the local expiry, e.g. after a 401.
    pub async fn force_refresh(&self) -> Result<String, AuthError> {
        match self.refresh_with(true).await? {
            RefreshOutcome::Refreshed { access_token } => Ok(access_token),
            RefreshOutcome::StillValid | RefreshOutcome::NotAuthenticated => {
                Err(AuthError::SessionExpired)
            }
        }
    }

    async fn refresh_with(&self, force: bool) -> Result<RefreshOutcome, AuthError> {
        let manager = self.weak_self.upgrade().ok_or(AuthError::SessionExpired)?;
        let flight = loop {
            let epoch = self.state.read().await.epoch;
            let vacant = match self.refresh.claim(epoch).await {
                Claim::Joined(flight) => {
                    debug!("Joining in-flight refresh");
                    break flight;
                }
                Claim::Vacant(vacant) => vacant,
            };

            let now = self.clock.now();
            let refresh_token = {
                let _commit = self.commit.lock().await;
                let mut state = self.state.write().await;
                if state.epoch != vacant.epoch() {
                    // A login or teardown landed between reading the epoch and claiming
                    continue;
                }
                if state.session.status() != SessionStatus::Authenticated {
                    return Ok(RefreshOutcome::NotAuthenticated);
                }
                if !force
                    && !state
                        .session
                        .needs_refresh(now, self.config.refresh_buffer())
                {
                    return Ok(RefreshOutcome::StillValid);
                }
                let Some(refresh_token) = state.session.refresh_token().map(str::to_string)
                else {
                    return Ok(RefreshOutcome::NotAuthenticated);
                };
                state.session.begin_refresh();
                self.publish(SessionStatus::Refreshing);
                refresh_token
            };

            debug!(force, epoch, "Starting token refresh");
            break vacant.start(
                async move { manager.run_refresh(refresh_token, epoch).await }.boxed(),
            );
        };

        flight
            .await
            .map(|access_token| RefreshOutcome::Refreshed { access_token })
    }

    /// The refresh itself. Runs on the refresh slot's task.
    async fn run_refresh(&self, refresh_token: String, epoch: u64) -> Result<String, AuthError> {
        let response = match self.api.refresh(&refresh_token).await {
            Ok(response) => response,
            Err(e) => {
                let err = AuthError::from(e);
                if err.is_retryable() {
                    warn!(error = %err, "Token refresh failed; keeping session");
                    let _commit = self.commit.lock().await;
                    let mut state = self.state.write().await;
                    if state.epoch == epoch {
                        state.session.end_refresh();
                        drop(state);
                        self.publish(SessionStatus::Authenticated);
                    }
                    return Err(err);
                }
                warn!(error = %err, "Refresh token rejected; ending session");
                self.teardown(TeardownReason::SessionExpired, Some(epoch))
                    .await;
                return Err(AuthError::SessionExpired);
            }
        };

        let now = self.clock.now();
        let rotated = response.refresh_token.is_some();

        let _commit = self.commit.lock().await;
        if self.state.read().await.epoch != epoch {
            info!("Session ended during refresh; discarding new tokens");
            return Err(AuthError::SessionExpired);
        }
        // The old refresh token is dead server-side once rotated, so the new
        // one has to be stored before the refresh counts as done
        if let Some(ref rotated_token) = response.refresh_token {
            self.persist_or_abandon(rotated_token).await?;
        }
        self.state.write().await.session.apply_refresh(
            response.access_token.clone(),
            response.refresh_token,
            response.expires_in,
            now,
        );
        self.publish(SessionStatus::Authenticated);
        info!(expires_in = response.expires_in, rotated, "Access token refreshed");
        Ok(response.access_token)
    }

    // =========================================================================
    // Periodic refresh check
    // =========================================================================

    /// Start the recurring refresh check, replacing any existing timer.
    pub fn schedule_periodic_refresh_check(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime; periodic refresh check not scheduled");
            return;
        };

        let mut timer = self.timer_slot();
        if let Some(existing) = timer.take() {
            existing.abort();
        }

        let period = self.config.refresh_check_interval();
        let manager = self.weak_self.clone();
        *timer = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if let Err(e) = manager.refresh_if_needed().await {
                    debug!(error = %e, "Periodic refresh check failed");
                }
            }
        }));
        debug!(period_secs = period.as_secs(), "Periodic refresh check scheduled");
    }

    pub fn cancel_periodic_refresh_check(&self) {
        if let Some(existing) = self.timer_slot().take() {
            existing.abort();
            debug!("Periodic refresh check cancelled");
        }
    }

    pub fn has_active_refresh_timer(&self) -> bool {
        self.timer_slot()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn timer_slot(&self) -> StdMutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Activity and lifecycle
    // =========================================================================

    pub async fn record_activity(&self) {
        let now = self.clock.now();
        self.state.write().await.session.touch(now);
    }

    /// React to a foreground/background transition.
    ///
    /// Returns `InactivityTimeout` when returning to the foreground after the
    /// inactivity timeout; the session has been torn down by then.
    pub async fn on_app_lifecycle_change(&self, next: AppState) -> Result<(), AuthError> {
        if next.is_background() {
            self.enter_background().await;
            return Ok(());
        }

        let now = self.clock.now();
        let (backgrounded_at, authenticated, epoch) = {
            let mut state = self.state.write().await;
            (
                state.session.take_backgrounded_at(),
                state.session.status().has_access_token(),
                state.epoch,
            )
        };

        if let Some(since) = backgrounded_at {
            let away = now - since;
            if away >= self.config.inactivity_timeout() {
                info!(away_secs = away.num_seconds(), "Session timed out while in background");
                if self
                    .sign_out(false, TeardownReason::InactivityTimeout, Some(epoch))
                    .await
                {
                    return Err(AuthError::InactivityTimeout);
                }
                return Ok(());
            }
            debug!(away_secs = away.num_seconds(), "Returned to foreground");
        }

        if authenticated {
            self.schedule_periodic_refresh_check();
            self.refresh_if_needed().await?;
        }
        Ok(())
    }

    async fn enter_background(&self) {
        let now = self.clock.now();
        {
            let mut state = self.state.write().await;
            if !state.session.status().has_access_token() {
                return;
            }
            // Inactive followed by Background keeps the earlier timestamp
            if state.session.backgrounded_at().is_none() {
                state.session.mark_backgrounded(now);
            }
        }
        self.cancel_periodic_refresh_check();
        debug!("Entered background");
    }

    /// Subscribe to an app lifecycle source. Dropping the returned handle
    /// unsubscribes.
    pub fn attach_lifecycle(&self, events: &LifecycleEvents) -> LifecycleSubscription {
        let mut rx = events.subscribe();
        let manager = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(next) => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        if let Err(e) = manager.on_app_lifecycle_change(next).await {
                            info!(error = %e, ?next, "Lifecycle transition affected session");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Lifecycle listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        LifecycleSubscription::new(handle)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn publish(&self, status: SessionStatus) {
        self.status_tx.send_replace(status);
    }

    /// Return to UNAUTHENTICATED after a failed login or restore without
    /// touching durable state.
    async fn abandon_authentication(&self, epoch: u64) {
        let _commit = self.commit.lock().await;
        let mut state = self.state.write().await;
        if state.epoch == epoch {
            state.session.clear();
            drop(state);
            self.publish(SessionStatus::Unauthenticated);
        }
    }

    /// Full teardown. With `expected_epoch`, only if the session is still
    /// the one that epoch refers to. Returns whether anything was torn down.
    async fn teardown(&self, reason: TeardownReason, expected_epoch: Option<u64>) -> bool {
        let _commit = self.commit.lock().await;
        if let Some(epoch) = expected_epoch {
            let current = self.state.read().await.epoch;
            if current != epoch {
                debug!(?reason, "Session already replaced; skipping teardown");
                return false;
            }
        }
        if reason == TeardownReason::SessionExpired {
            self.publish(SessionStatus::Expired);
        }
        self.clear_locked(reason).await;
        true
    }

    /// Teardown body. Caller holds the commit lock.
    async fn clear_locked(&self, reason: TeardownReason) {
        {
            let mut state = self.state.write().await;
            state.epoch += 1;
            state.session.clear();
            state.last_teardown = Some(reason);
        }
        self.cancel_periodic_refresh_check();
        self.publish(SessionStatus::Unauthenticated);

        if let Err(e) = PersistedSession::erase(self.store.as_ref()).await {
            error!(error = %e, "Failed to delete persisted refresh token");
        }
        if let Some(ref cache) = self.profile_cache {
            if let Err(e) = cache.clear(self.store.as_ref()).await {
                warn!(error = %e, "Failed to clear profile cache");
            }
        }
        info!(?reason, "Session cleared");
    }

    /// Store a newly issued refresh token. On failure the session is torn
    /// down (ERROR, then UNAUTHENTICATED) and `Storage` is returned. Caller
    /// holds the commit lock.
    async fn persist_or_abandon(&self, refresh_token: &str) -> Result<(), AuthError> {
        let persisted = PersistedSession {
            refresh_token: refresh_token.to_string(),
        };
        if let Err(e) = persisted.save(self.store.as_ref()).await {
            error!(error = %e, "Failed to persist refresh token; abandoning session");
            self.publish(SessionStatus::Error);
            self.clear_locked(TeardownReason::StorageFailure).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn load_cached_user(&self) -> Option<User> {
        let cache = self.profile_cache.as_ref()?;
        match cache.load(self.store.as_ref()).await {
            Ok(profile) => profile.map(|p| p.user),
            Err(e) => {
                warn!(error = %e, "Failed to load cached profile");
                None
            }
        }
    }

    async fn save_cached_user(&self, user: &User) {
        if let Some(ref cache) = self.profile_cache {
            if let Err(e) = cache.save(self.store.as_ref(), user).await {
                warn!(error = %e, "Failed to cache profile");
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.timer_slot().take() {
            handle.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
