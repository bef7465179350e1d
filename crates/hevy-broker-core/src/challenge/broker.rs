use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;
use tracing::{debug, error};

use crate::api::ApiError;
use crate::config::ChallengeSettings;

use super::engine::BrowserLauncher;
use super::manager::BrowserManager;
use super::ChallengeError;

/// A single-use anti-bot token and the moment it was obtained.
#[derive(Clone, PartialEq, Eq)]
pub struct ChallengeToken {
    value: String,
    acquired_at: Instant,
    validity: Duration,
}

impl std::fmt::Debug for ChallengeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeToken")
            .field("age", &self.age())
            .field("ttl_remaining", &self.ttl_remaining())
            .finish()
    }
}

impl ChallengeToken {
    fn new(value: String, validity: Duration) -> Self {
        Self {
            value,
            acquired_at: Instant::now(),
            validity,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn age(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Time left in the upstream validity window.
    pub fn ttl_remaining(&self) -> Duration {
        self.validity.saturating_sub(self.age())
    }
}

type Acquisition = Shared<BoxFuture<'static, Result<ChallengeToken, ApiError>>>;

#[derive(Default)]
struct Slot {
    cached: Option<ChallengeToken>,
    in_flight: Option<(u64, Acquisition)>,
    next_flight: u64,
}

struct Inner {
    manager: BrowserManager,
    settings: ChallengeSettings,
    // Never held across an await.
    slot: Mutex<Slot>,
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Challenge-token broker.
///
/// Serves a cached token while it is younger than the cache duration,
/// otherwise acquires a new one. Concurrent callers that miss the cache share
/// one in-flight acquisition, so at most one browser launch and extraction run
/// at a time. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ChallengeBroker {
    inner: Arc<Inner>,
}

impl ChallengeBroker {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, settings: ChallengeSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager: BrowserManager::new(launcher, settings.clone()),
                settings,
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    /// Return a token young enough to use, acquiring one if needed.
    pub async fn get_token(&self) -> Result<ChallengeToken, ApiError> {
        let acquisition = {
            let mut guard = self.inner.slot();
            let slot = &mut *guard;

            if let Some(token) = slot.cached.as_ref() {
                if token.age() < self.inner.settings.cache_duration {
                    debug!(age_ms = token.age().as_millis() as u64, "Using cached challenge token");
                    return Ok(token.clone());
                }
            }

            match slot.in_flight.as_ref().map(|(_, acquisition)| acquisition.clone()) {
                Some(acquisition) => {
                    debug!("Joining in-flight challenge acquisition");
                    acquisition
                }
                None => {
                    let flight = slot.next_flight;
                    slot.next_flight += 1;
                    // The acquisition runs on its own task so that dropping every
                    // waiter cannot strand it while it holds the browser lock.
                    let task = tokio::spawn(Self::acquire(Arc::clone(&self.inner), flight));
                    let acquisition = task
                        .map(|joined| {
                            joined.unwrap_or_else(|e| {
                                Err(ApiError::ChallengeAcquisitionFailed(ChallengeError::Protocol(
                                    format!("acquisition task failed: {}", e),
                                )))
                            })
                        })
                        .boxed()
                        .shared();
                    slot.in_flight = Some((flight, acquisition.clone()));
                    acquisition
                }
            }
        };

        acquisition.await
    }

    async fn acquire(inner: Arc<Inner>, flight: u64) -> Result<ChallengeToken, ApiError> {
        debug!("Obtaining new challenge token");
        let limit = inner.settings.acquisition_timeout;

        let outcome = match tokio::time::timeout(limit, inner.manager.acquire_token()).await {
            Ok(Ok(value)) => Ok(ChallengeToken::new(value, inner.settings.validity)),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                // The abandoned attempt may have left a half-initialized browser.
                inner.manager.reset().await;
                Err(ChallengeError::Timeout(limit))
            }
        };

        let mut slot = inner.slot();
        if matches!(slot.in_flight, Some((id, _)) if id == flight) {
            slot.in_flight = None;
        }

        match outcome {
            Ok(token) => {
                debug!(
                    cache_secs = inner.settings.cache_duration.as_secs(),
                    "Cached challenge token"
                );
                slot.cached = Some(token.clone());
                Ok(token)
            }
            Err(e) => {
                error!(error = %e, "Challenge token acquisition failed");
                Err(ApiError::ChallengeAcquisitionFailed(e))
            }
        }
    }

    /// Drop the cached token, if any. Call after every login attempt.
    pub fn invalidate(&self) {
        let mut slot = self.inner.slot();
        if slot.cached.take().is_some() {
            debug!("Invalidated challenge token cache");
        }
    }

    /// Close the shared browser. The next acquisition relaunches it.
    ///
    /// An acquisition already running is allowed to finish first; it is bounded
    /// by the acquisition timeout.
    pub async fn shutdown(&self) {
        self.inner.manager.reset().await;
    }
}
