use chrono::Duration;
use tracing::{debug, info, warn};

use crate::api::{ApiError, UpstreamClient};
use crate::models::BearerCredential;

/// Refresh this long before the access token expires.
const TOKEN_REFRESH_BUFFER_MINUTES: i64 = 5;

/// Lifecycle of one authenticated session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    NoSession,
    Active {
        credential: BearerCredential,
        /// 0 straight after login, incremented by every successful refresh
        refresh_count: u32,
    },
    /// The refresh token was rejected; only a new login recovers.
    Invalid,
}

/// Token lifecycle manager for one session.
///
/// Holds at most one active pair. Each successful refresh replaces the pair
/// wholesale. Nothing here retries: one upstream attempt per call.
#[derive(Debug)]
pub struct TokenSession {
    state: SessionState,
}

impl Default for TokenSession {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::NoSession,
        }
    }

    /// Resume a session from a previously issued pair.
    pub fn resume(credential: BearerCredential) -> Self {
        Self {
            state: SessionState::Active {
                credential,
                refresh_count: 0,
            },
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The active pair, if any.
    pub fn credential(&self) -> Option<&BearerCredential> {
        match &self.state {
            SessionState::Active { credential, .. } => Some(credential),
            _ => None,
        }
    }

    /// Get the bearer token if the session is active
    pub fn access_token(&self) -> Option<&str> {
        self.credential().map(|c| c.access_token.as_str())
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Active { .. })
    }

    /// Check if the access token will expire soon and should be refreshed
    pub fn needs_refresh(&self) -> bool {
        self.credential()
            .map(|c| c.expires_within(Duration::minutes(TOKEN_REFRESH_BUFFER_MINUTES)))
            .unwrap_or(false)
    }

    /// Log in and make the returned pair the active one.
    ///
    /// A failed login leaves the current state untouched.
    pub async fn login(
        &mut self,
        upstream: &UpstreamClient,
        identifier: &str,
        secret: &str,
        challenge_token: &str,
    ) -> Result<BearerCredential, ApiError> {
        let credential = upstream.login(identifier, secret, challenge_token).await?;
        info!(user_id = ?credential.user_id, "Session established");
        self.state = SessionState::Active {
            credential: credential.clone(),
            refresh_count: 0,
        };
        Ok(credential)
    }

    /// Exchange `refresh_token` for a new pair.
    ///
    /// On success the previous pair is discarded. A rejected refresh token
    /// moves the session to `Invalid`; any other failure leaves it as it was.
    pub async fn refresh(
        &mut self,
        upstream: &UpstreamClient,
        refresh_token: &str,
    ) -> Result<BearerCredential, ApiError> {
        match upstream.refresh_access_token(refresh_token).await {
            Ok(credential) => {
                let refresh_count = match &self.state {
                    SessionState::Active { refresh_count, .. } => refresh_count + 1,
                    _ => 1,
                };
                debug!(refresh_count, "Access token refreshed");
                self.state = SessionState::Active {
                    credential: credential.clone(),
                    refresh_count,
                };
                Ok(credential)
            }
            Err(ApiError::InvalidRefreshToken) => {
                warn!("Refresh token rejected, session invalidated");
                self.state = SessionState::Invalid;
                Err(ApiError::InvalidRefreshToken)
            }
            Err(e) => Err(e),
        }
    }

    /// Refresh with the session's own refresh token when expiry is near.
    ///
    /// Returns the new pair when a refresh happened, `None` when none was due.
    pub async fn refresh_if_needed(
        &mut self,
        upstream: &UpstreamClient,
    ) -> Result<Option<BearerCredential>, ApiError> {
        if !self.needs_refresh() {
            return Ok(None);
        }
        let refresh_token = match self.credential() {
            Some(credential) => credential.refresh_token.clone(),
            None => return Ok(None),
        };
        self.refresh(upstream, &refresh_token).await.map(Some)
    }

    /// Forget the active pair.
    pub fn clear(&mut self) {
        self.state = SessionState::NoSession;
    }
}
