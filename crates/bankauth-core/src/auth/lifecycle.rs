//! Application lifecycle notifications.
//!
//! The host forwards foreground/background transitions into a
//! [`LifecycleEvents`] source. The session manager subscribes to it with
//! `SessionManager::attach_lifecycle` rather than listening to any global
//! platform hook, so tests can fire transitions synthetically.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Buffer for undelivered lifecycle events.
/// Transitions are rare; 16 covers bursts while a subscriber is busy.
const LIFECYCLE_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Foreground,
    Background,
    /// Transitional state (app switcher, incoming call). Treated as background.
    Inactive,
}

impl AppState {
    pub fn is_background(self) -> bool {
        matches!(self, AppState::Background | AppState::Inactive)
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleEvents {
    tx: broadcast::Sender<AppState>,
}

impl LifecycleEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish a transition. Returns how many subscribers will see it.
    pub fn emit(&self, state: AppState) -> usize {
        self.tx.send(state).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppState> {
        self.tx.subscribe()
    }
}

impl Default for LifecycleEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a lifecycle listener alive. Dropping it unsubscribes.
#[derive(Debug)]
pub struct LifecycleSubscription {
    handle: JoinHandle<()>,
}

impl LifecycleSubscription {
    pub(crate) fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for LifecycleSubscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
