//! Single-flight coordination of access-token refreshes.
//!
//! # Design
//! The coordinator is a two-state machine. In `Idle`, the first caller that
//! reports an expired credential starts a refresh and moves the machine to
//! `Refreshing`; every caller that arrives while `Refreshing` attaches to the
//! same in-flight future instead of starting another network call.
//!
//! The check-and-set of the phase and the creation of the in-flight future
//! happen inside one critical section of a `std::sync::Mutex`, which is never
//! held across an `.await`. The refresh itself runs in a spawned task: it
//! updates `TokenState` and returns the machine to `Idle` before any waiter
//! is released, and it runs to completion even if every waiter goes away.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use crate::error::{ApiError, Result};
use crate::token::{AccessToken, TokenState};

/// The cloneable in-flight refresh. Errors are flattened to a reason string
/// so every waiter can receive its own copy.
type SharedRefresh = Shared<BoxFuture<'static, std::result::Result<AccessToken, String>>>;

enum RefreshPhase {
    Idle,
    Refreshing(SharedRefresh),
}

pub struct RefreshCoordinator {
    phase: Arc<Mutex<RefreshPhase>>,
    tokens: Arc<TokenState>,
}

impl RefreshCoordinator {
    pub fn new(tokens: Arc<TokenState>) -> Self {
        Self {
            phase: Arc::new(Mutex::new(RefreshPhase::Idle)),
            tokens,
        }
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*lock(&self.phase), RefreshPhase::Refreshing(_))
    }

    /// Obtain a fresh access token, sharing any refresh already in flight.
    ///
    /// `start` is only called when this caller opens a new refresh cohort;
    /// the future it returns performs the network call.
    ///
    /// Every waiter in a cohort receives the same outcome: the new token, or
    /// [`ApiError::SessionExpired`] after the token has been cleared.
    pub async fn refresh<F, Fut>(&self, start: F) -> Result<AccessToken>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AccessToken>> + Send + 'static,
    {
        let in_flight = {
            let mut phase = lock(&self.phase);
            match &*phase {
                RefreshPhase::Refreshing(shared) => {
                    debug!("joining in-flight token refresh");
                    shared.clone()
                }
                RefreshPhase::Idle => {
                    info!("starting token refresh");
                    let shared = self.spawn(start());
                    *phase = RefreshPhase::Refreshing(shared.clone());
                    shared
                }
            }
        };
        in_flight.await.map_err(ApiError::session_expired)
    }

    /// Must be called with the phase lock held, so the spawned task cannot
    /// reset the phase before it has been set to `Refreshing`.
    fn spawn<Fut>(&self, call: Fut) -> SharedRefresh
    where
        Fut: Future<Output = Result<AccessToken>> + Send + 'static,
    {
        let phase = Arc::clone(&self.phase);
        let tokens = Arc::clone(&self.tokens);
        let task = tokio::spawn(async move {
            let outcome = match call.await {
                Ok(token) => {
                    tokens.set_token(token.clone());
                    info!("token refresh succeeded");
                    Ok(token)
                }
                Err(err) => {
                    tokens.clear_token();
                    warn!(error = %err, "token refresh failed; session cleared");
                    Err(err.to_string())
                }
            };
            *lock(&phase) = RefreshPhase::Idle;
            outcome
        });

        let phase = Arc::clone(&self.phase);
        let tokens = Arc::clone(&self.tokens);
        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(join) => {
                    tokens.clear_token();
                    *lock(&phase) = RefreshPhase::Idle;
                    Err(format!("refresh task failed: {join}"))
                }
            }
        }
        .boxed()
        .shared()
    }
}

fn lock(phase: &Mutex<RefreshPhase>) -> MutexGuard<'_, RefreshPhase> {
    phase.lock().unwrap_or_else(PoisonError::into_inner)
}
