use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// An access/refresh token pair issued by the login or refresh endpoint.
///
/// Never mutated: a refresh produces a new value that supersedes this one.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct BearerCredential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
}

// Tokens stay out of Debug output so they never reach the logs.
impl std::fmt::Debug for BearerCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerCredential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("email", &self.email)
            .finish()
    }
}

impl BearerCredential {
    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Utc::now() >= at).unwrap_or(false)
    }

    /// True once `expires_at` is within `buffer` of now.
    ///
    /// A credential without an expiry never asks to be refreshed.
    pub fn expires_within(&self, buffer: Duration) -> bool {
        self.expires_at
            .map(|at| Utc::now() + buffer >= at)
            .unwrap_or(false)
    }
}
