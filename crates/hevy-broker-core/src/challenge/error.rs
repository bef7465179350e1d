use std::time::Duration;

use thiserror::Error;

/// Why a challenge token could not be produced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChallengeError {
    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("script evaluation failed: {0}")]
    Evaluation(String),

    #[error("DevTools protocol error: {0}")]
    Protocol(String),

    #[error("browser disconnected: {0}")]
    Disconnected(String),

    #[error("challenge token not found on the login page")]
    TokenNotFound,
}
