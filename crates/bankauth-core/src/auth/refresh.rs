//! Single-flight coordination for token refresh.
//!
//! The slot holds either nothing or a shared future for the refresh in
//! flight, tagged with the session epoch it was started under. The first
//! caller to find no flight for its epoch starts the refresh; everyone else
//! awaits a clone of the same future. The refresh runs on its own tokio task
//! so it always completes, even if every waiter goes away, and the task
//! empties the slot before its result is delivered. A flight left over from
//! an earlier session is never joined and never clears its successor.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error};

use super::AuthError;

pub(crate) type RefreshResult = Result<String, AuthError>;

pub(crate) type SharedRefresh = Shared<BoxFuture<'static, RefreshResult>>;

struct Flight {
    epoch: u64,
    shared: SharedRefresh,
}

#[derive(Default)]
pub(crate) struct RefreshSlot {
    inflight: Mutex<Option<Flight>>,
}

pub(crate) enum Claim<'a> {
    /// A refresh for this epoch is already running; await this to share its result
    Joined(SharedRefresh),
    /// Nobody is refreshing this epoch. The slot stays locked until this is
    /// started or dropped.
    Vacant(VacantSlot<'a>),
}

pub(crate) struct VacantSlot<'a> {
    slot: Arc<RefreshSlot>,
    epoch: u64,
    guard: MutexGuard<'a, Option<Flight>>,
}

impl RefreshSlot {
    pub(crate) async fn claim(self: &Arc<Self>, epoch: u64) -> Claim<'_> {
        let guard = self.inflight.lock().await;
        match guard.as_ref() {
            Some(flight) if flight.epoch == epoch => {
                return Claim::Joined(flight.shared.clone());
            }
            Some(flight) => {
                debug!(stale = flight.epoch, epoch, "Ignoring refresh from a previous session");
            }
            None => {}
        }
        Claim::Vacant(VacantSlot {
            slot: Arc::clone(self),
            epoch,
            guard,
        })
    }

    pub(crate) async fn in_flight(&self) -> bool {
        self.inflight.lock().await.is_some()
    }
}

impl VacantSlot<'_> {
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Spawn `work` and install it as the in-flight refresh.
    pub(crate) fn start(mut self, work: BoxFuture<'static, RefreshResult>) -> SharedRefresh {
        let slot = Arc::clone(&self.slot);
        let epoch = self.epoch;
        let task = tokio::spawn(async move {
            let result = work.await;
            let mut inflight = slot.inflight.lock().await;
            if inflight.as_ref().is_some_and(|flight| flight.epoch == epoch) {
                inflight.take();
            }
            result
        });

        let shared = async move {
            task.await.unwrap_or_else(|e| {
                error!(error = %e, "Refresh task did not complete");
                Err(AuthError::Network(format!("refresh interrupted: {}", e)))
            })
        }
        .boxed()
        .shared();

        *self.guard = Some(Flight {
            epoch,
            shared: shared.clone(),
        });
        shared
    }
}
