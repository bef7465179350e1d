//! Broker configuration.
//!
//! Configuration is read from the process environment (the binary loads a
//! `.env` file first). The static service key `X_API_KEY` is mandatory and
//! loading fails fast without it; everything else has a default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Upstream API base URL
pub const DEFAULT_BASE_URL: &str = "https://api.hevyapp.com";

/// Hosted login page that carries the reCAPTCHA script
pub const DEFAULT_LOGIN_PAGE_URL: &str = "https://www.hevy.com/login";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Upstream validity window of a challenge token.
const CHALLENGE_VALIDITY_SECS: u64 = 90;

/// How long a challenge token is served from cache. Kept at a sixth of the
/// validity window so a cached token is never close to upstream expiry.
const CHALLENGE_CACHE_SECS: u64 = 15;

/// Poll budget for the page-global token: 50 x 200ms = 10s.
const TOKEN_POLL_ATTEMPTS: u32 = 50;
const TOKEN_POLL_INTERVAL_MS: u64 = 200;

/// Navigation timeout for the hosted login page.
const NAVIGATION_TIMEOUT_SECS: u64 = 30;

/// Upper bound for one complete acquisition (launch + navigate + poll + fallback).
const ACQUISITION_TIMEOUT_SECS: u64 = 45;

/// Desktop user agent presented by the automation browser.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Timing knobs for the challenge-token broker.
#[derive(Debug, Clone)]
pub struct ChallengeSettings {
    pub login_page_url: String,
    pub site_key: Option<String>,
    pub user_agent: String,
    pub validity: Duration,
    pub cache_duration: Duration,
    pub poll_attempts: u32,
    pub poll_interval: Duration,
    pub navigation_timeout: Duration,
    pub acquisition_timeout: Duration,
}

impl Default for ChallengeSettings {
    fn default() -> Self {
        Self {
            login_page_url: DEFAULT_LOGIN_PAGE_URL.to_string(),
            site_key: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            validity: Duration::from_secs(CHALLENGE_VALIDITY_SECS),
            cache_duration: Duration::from_secs(CHALLENGE_CACHE_SECS),
            poll_attempts: TOKEN_POLL_ATTEMPTS,
            poll_interval: Duration::from_millis(TOKEN_POLL_INTERVAL_MS),
            navigation_timeout: Duration::from_secs(NAVIGATION_TIMEOUT_SECS),
            acquisition_timeout: Duration::from_secs(ACQUISITION_TIMEOUT_SECS),
        }
    }
}

#[derive(Clone)]
pub struct BrokerConfig {
    pub base_url: String,
    /// Static key sent as `x-api-key` on every free-tier call
    pub x_api_key: String,
    pub request_timeout: Duration,
    pub chrome_path: Option<PathBuf>,
    pub challenge: ChallengeSettings,
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("base_url", &self.base_url)
            .field("x_api_key", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .field("chrome_path", &self.chrome_path)
            .field("challenge", &self.challenge)
            .finish()
    }
}

impl BrokerConfig {
    /// Build a configuration with defaults around the mandatory service key.
    pub fn new(x_api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            x_api_key: x_api_key.into(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            chrome_path: None,
            challenge: ChallengeSettings::default(),
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let Some(x_api_key) = get("X_API_KEY") else {
            bail!("X_API_KEY environment variable is required");
        };

        let mut config = Self::new(x_api_key);

        if let Some(base_url) = get("HEVY_BASE_URL") {
            config.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Some(secs) = get("HEVY_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .with_context(|| format!("Invalid HEVY_REQUEST_TIMEOUT_SECS: {}", secs))?;
            config.request_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(url) = get("HEVY_LOGIN_PAGE_URL") {
            config.challenge.login_page_url = url;
        }
        config.challenge.site_key = get("RECAPTCHA_SITE_KEY");
        config.chrome_path = get("CHROME_PATH").map(PathBuf::from);

        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn login_url(&self) -> String {
        format!("{}/login", self.base_url)
    }

    pub fn refresh_token_url(&self) -> String {
        format!("{}/refresh_token", self.base_url)
    }

    pub fn user_account_url(&self) -> String {
        format!("{}/user/account", self.base_url)
    }

    pub fn user_workouts_paged_url(&self) -> String {
        format!("{}/user_workouts_paged", self.base_url)
    }

    pub fn pro_workouts_url(&self) -> String {
        format!("{}/v1/workouts", self.base_url)
    }

    pub fn body_measurements_url(&self) -> String {
        format!("{}/body_measurements", self.base_url)
    }

    pub fn body_measurements_batch_url(&self) -> String {
        format!("{}/body_measurements_batch", self.base_url)
    }
}
