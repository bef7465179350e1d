use thiserror::Error;

use crate::challenge::ChallengeError;

/// Every failure the broker can surface to the route layer.
///
/// `Clone` so a single in-flight challenge acquisition can hand the same
/// outcome to every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("Missing authentication: provide either a bearer token or an API key")]
    MissingCredentials,

    #[error("Credentials are managed client-side and cannot be proxied")]
    UnsupportedMode,

    #[error("Malformed upstream response: {0}")]
    MalformedUpstreamResponse(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid or expired refresh token")]
    InvalidRefreshToken,

    #[error("Unauthorized - session is invalid or expired")]
    Unauthorized,

    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("Upstream request timed out: {0}")]
    UpstreamTimeout(String),

    #[error(
        "Upstream protocol error{}: {}",
        .status.map(|s| format!(" (status {})", s)).unwrap_or_default(),
        .message
    )]
    UpstreamProtocolError {
        status: Option<u16>,
        message: String,
    },

    #[error("Failed to acquire challenge token: {0}")]
    ChallengeAcquisitionFailed(ChallengeError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Classify a non-success status from a data call.
    ///
    /// Login and refresh remap `Unauthorized` to their own variants.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            _ => ApiError::UpstreamProtocolError {
                status: Some(status.as_u16()),
                message: Self::truncate_body(body),
            },
        }
    }

    /// Classify a transport-level failure from reqwest.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::UpstreamTimeout(err.to_string())
        } else if err.is_connect() {
            ApiError::UpstreamUnreachable(err.to_string())
        } else if err.is_decode() {
            ApiError::UpstreamProtocolError {
                status: None,
                message: format!("JSON decode error: {}", err),
            }
        } else if let Some(status) = err.status() {
            ApiError::from_status(status, &err.to_string())
        } else {
            ApiError::UpstreamUnreachable(err.to_string())
        }
    }

    /// True when the session or the presented credentials must be rejected.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            ApiError::MissingCredentials
                | ApiError::UnsupportedMode
                | ApiError::InvalidCredentials
                | ApiError::InvalidRefreshToken
                | ApiError::Unauthorized
        )
    }

    /// True when the same call may succeed if simply tried again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::UpstreamUnreachable(_)
            | ApiError::UpstreamTimeout(_)
            | ApiError::ChallengeAcquisitionFailed(_) => true,
            ApiError::UpstreamProtocolError { status, .. } => {
                matches!(status, Some(429) | Some(500..=599))
            }
            _ => false,
        }
    }
}

impl From<ChallengeError> for ApiError {
    fn from(err: ChallengeError) -> Self {
        ApiError::ChallengeAcquisitionFailed(err)
    }
}
