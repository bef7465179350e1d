//! API client for the Hevy REST API.
//!
//! One `UpstreamClient` is configured for exactly one [`AuthMode`]. Login and
//! refresh run on an unauthenticated client; data calls run on a client
//! produced by the credential resolver.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::auth::resolver::{PLATFORM_HEADER, PLATFORM_VALUE, SERVICE_KEY_HEADER};
use crate::auth::AuthMode;
use crate::config::BrokerConfig;
use crate::models::{
    AccountRecord, BearerCredential, BodyMeasurement, UpstreamWorkoutsResponse, WorkoutPage,
};
use crate::utils::deserialize_opt_id;

use super::{ApiError, WorkoutQuery};

// ============================================================================
// Constants
// ============================================================================

/// Epoch values above this are milliseconds rather than seconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Placeholder object id the batch endpoint expects for unsynced entries.
const UNSYNCED_OBJECT_ID: &str = "zitronenkuchen";

/// Body shared by the login and refresh endpoints.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    // older deployments answer with auth_token only
    #[serde(default)]
    auth_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    user_id: Option<String>,
    #[serde(default)]
    expires_at: Option<Value>,
}

impl TokenResponse {
    /// Both tokens must be present; a partial pair is a protocol violation.
    fn into_credential(self, identifier: Option<&str>) -> Result<BearerCredential, ApiError> {
        let access_token = self
            .access_token
            .or(self.auth_token)
            .filter(|t| !t.is_empty());
        let refresh_token = self.refresh_token.filter(|t| !t.is_empty());

        let (Some(access_token), Some(refresh_token)) = (access_token, refresh_token) else {
            return Err(ApiError::MalformedUpstreamResponse(
                "response missing access/refresh token".into(),
            ));
        };

        let (username, email) = match identifier {
            Some(id) if id.contains('@') => (None, Some(id.to_string())),
            Some(id) => (Some(id.to_string()), None),
            None => (None, None),
        };

        Ok(BearerCredential {
            access_token,
            refresh_token,
            expires_at: self.expires_at.as_ref().and_then(parse_expiry),
            user_id: self.user_id,
            username,
            email,
        })
    }
}

/// Read `expires_at` given as an ISO string or as epoch seconds/milliseconds.
fn parse_expiry(value: &Value) -> Option<DateTime<Utc>> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().and_then(|raw| {
            if raw > EPOCH_MILLIS_THRESHOLD {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.parse::<i64>().ok().and_then(|raw| Utc.timestamp_opt(raw, 0).single())),
        _ => None,
    };
    if parsed.is_none() && !value.is_null() {
        warn!(expires_at = %value, "Ignoring unparseable token expiry");
    }
    parsed
}

/// API client for Hevy.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct UpstreamClient {
    http: Client,
    config: Arc<BrokerConfig>,
    mode: AuthMode,
    headers: HeaderMap,
}

impl UpstreamClient {
    /// Build the shared HTTP client with the configured request timeout.
    pub fn build_http(config: &BrokerConfig) -> Result<Client, ApiError> {
        Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::UpstreamUnreachable(format!("failed to build HTTP client: {}", e)))
    }

    pub(crate) fn new(http: Client, config: Arc<BrokerConfig>, mode: AuthMode) -> Result<Self, ApiError> {
        let headers = mode.headers(&config)?;
        Ok(Self {
            http,
            config,
            mode,
            headers,
        })
    }

    /// A client for the login and refresh endpoints only.
    pub fn anonymous(http: Client, config: Arc<BrokerConfig>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            http,
            config,
            mode: AuthMode::Unauthenticated,
            headers,
        }
    }

    pub fn mode(&self) -> &AuthMode {
        &self.mode
    }

    /// Headers for the token endpoints: static service key plus platform id.
    fn token_endpoint_headers(&self) -> Result<HeaderMap, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let mut key = HeaderValue::from_str(&self.config.x_api_key)
            .map_err(|_| ApiError::InvalidRequest("service key contains invalid header characters".into()))?;
        key.set_sensitive(true);
        headers.insert(HeaderName::from_static(SERVICE_KEY_HEADER), key);
        headers.insert(
            HeaderName::from_static(PLATFORM_HEADER),
            HeaderValue::from_static(PLATFORM_VALUE),
        );
        Ok(headers)
    }

    /// Send a request, classifying transport failures and non-success statuses.
    async fn send(request: RequestBuilder, operation: &'static str) -> Result<Response, ApiError> {
        let response = request.send().await.map_err(|e| {
            let err = ApiError::from_transport(e);
            error!(operation, error = %err, "Upstream request failed");
            err
        })?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn json<T: DeserializeOwned>(response: Response, operation: &'static str) -> Result<T, ApiError> {
        response.json().await.map_err(|e| {
            let err = ApiError::from_transport(e);
            error!(operation, error = %err, "Failed to read upstream response");
            err
        })
    }

    fn require_bearer(&self, operation: &str) -> Result<(), ApiError> {
        match self.mode {
            AuthMode::BearerSession { .. } => Ok(()),
            AuthMode::Unauthenticated => Err(ApiError::MissingCredentials),
            AuthMode::ApiKeySession { .. } => Err(ApiError::InvalidRequest(format!(
                "{} requires a bearer session",
                operation
            ))),
        }
    }

    // ===== Token endpoints =====

    /// Log in with a username or email, password and a fresh challenge token.
    pub async fn login(
        &self,
        email_or_username: &str,
        password: &str,
        challenge_token: &str,
    ) -> Result<BearerCredential, ApiError> {
        debug!(
            identifier_kind = if email_or_username.contains('@') { "email" } else { "username" },
            "Attempting login"
        );

        let body = serde_json::json!({
            "emailOrUsername": email_or_username,
            "password": password,
            "recaptchaToken": challenge_token,
            "useAuth2_0": true,
        });

        let request = self
            .http
            .post(self.config.login_url())
            .headers(self.token_endpoint_headers()?)
            .json(&body);

        let response = match Self::send(request, "login").await {
            Ok(response) => response,
            Err(ApiError::Unauthorized) => return Err(ApiError::InvalidCredentials),
            Err(e) => {
                error!(error = %e, "Login failed");
                return Err(e);
            }
        };

        let tokens: TokenResponse = Self::json(response, "login").await?;
        tokens.into_credential(Some(email_or_username)).map_err(|e| {
            error!(error = %e, "Login response missing tokens");
            e
        })
    }

    /// Exchange a refresh token for a new pair. One attempt, no retries.
    pub async fn refresh_access_token(&self, refresh_token: &str) -> Result<BearerCredential, ApiError> {
        debug!("Refreshing access token");

        let body = serde_json::json!({ "refresh_token": refresh_token });
        let request = self
            .http
            .post(self.config.refresh_token_url())
            .headers(self.token_endpoint_headers()?)
            .json(&body);

        let response = match Self::send(request, "refresh").await {
            Ok(response) => response,
            Err(ApiError::Unauthorized) => return Err(ApiError::InvalidRefreshToken),
            Err(e) => {
                error!(error = %e, "Token refresh failed");
                return Err(e);
            }
        };

        let tokens: TokenResponse = Self::json(response, "refresh").await?;
        tokens.into_credential(None)
    }

    // ===== Data endpoints =====

    /// Fetch the authenticated user's account.
    pub async fn fetch_account(&self) -> Result<AccountRecord, ApiError> {
        self.require_bearer("account lookup")?;
        debug!("Fetching user account");

        let request = self
            .http
            .get(self.config.user_account_url())
            .headers(self.headers.clone());
        let response = Self::send(request, "account").await?;
        Self::json(response, "account").await
    }

    /// Fetch one page of workouts using the pagination style of this client's
    /// mode.
    pub async fn fetch_workouts(&self, query: &WorkoutQuery) -> Result<WorkoutPage, ApiError> {
        query.validate_for(&self.mode)?;
        match query {
            WorkoutQuery::Offset { offset, username } => self.fetch_free_workouts(username, *offset).await,
            WorkoutQuery::Page { page, page_size } => self.fetch_pro_workouts(*page, *page_size).await,
        }
    }

    async fn fetch_free_workouts(&self, username: &str, offset: u32) -> Result<WorkoutPage, ApiError> {
        debug!(offset, "Fetching workouts");

        let request = self
            .http
            .get(self.config.user_workouts_paged_url())
            .headers(self.headers.clone())
            .query(&[("offset", offset.to_string()), ("username", username.to_string())]);
        let response = Self::send(request, "workouts").await?;
        let parsed: UpstreamWorkoutsResponse = Self::json(response, "workouts").await?;
        let workouts = parsed.into_workouts();

        let workout_count = workouts.len();
        debug!(workout_count, "Fetched workouts");
        Ok(WorkoutPage {
            workouts,
            page: None,
            page_size: None,
            offset: Some(offset),
            workout_count,
        })
    }

    async fn fetch_pro_workouts(&self, page: u32, page_size: u32) -> Result<WorkoutPage, ApiError> {
        debug!(page, page_size, "Fetching PRO workouts");

        let request = self
            .http
            .get(self.config.pro_workouts_url())
            .headers(self.headers.clone())
            .query(&[("page", page), ("pageSize", page_size)]);

        let response = match Self::send(request, "pro_workouts").await {
            Ok(response) => response,
            // Past the last page the PRO API answers 404.
            Err(ApiError::UpstreamProtocolError { status: Some(404), .. }) => {
                debug!(page, "No workouts on page (404)");
                return Ok(WorkoutPage::empty(page, page_size));
            }
            Err(e) => return Err(e),
        };

        let parsed: UpstreamWorkoutsResponse = Self::json(response, "pro_workouts").await?;
        let mut workouts = parsed.into_workouts();
        for workout in &mut workouts {
            workout.normalize_pro();
        }

        let workout_count = workouts.len();
        debug!(workout_count, "Fetched PRO workouts");
        Ok(WorkoutPage {
            workouts,
            page: Some(page),
            page_size: Some(page_size),
            offset: None,
            workout_count,
        })
    }

    pub async fn fetch_body_measurements(&self) -> Result<Vec<BodyMeasurement>, ApiError> {
        self.require_bearer("body measurements")?;
        debug!("Fetching body measurements");

        let request = self
            .http
            .get(self.config.body_measurements_url())
            .headers(self.headers.clone());
        let response = Self::send(request, "body_measurements").await?;
        let measurements: Vec<BodyMeasurement> = Self::json(response, "body_measurements").await?;
        debug!(count = measurements.len(), "Fetched body measurements");
        Ok(measurements)
    }

    /// Record a body weight for a date. The batch endpoint answers 200 with
    /// an empty body.
    pub async fn post_body_measurement(&self, date: NaiveDate, weight_kg: f64) -> Result<(), ApiError> {
        self.require_bearer("body measurements")?;
        if !weight_kg.is_finite() || weight_kg <= 0.0 {
            return Err(ApiError::InvalidRequest(format!("invalid weight: {}", weight_kg)));
        }
        debug!(%date, weight_kg, "Posting body measurement");

        let body = serde_json::json!({
            "measurementsBatch": [{
                "date": date.format("%Y-%m-%d").to_string(),
                "weight_kg": weight_kg,
                "_unsyncedObjectId": UNSYNCED_OBJECT_ID,
            }]
        });
        let request = self
            .http
            .post(self.config.body_measurements_batch_url())
            .headers(self.headers.clone())
            .json(&body);
        Self::send(request, "body_measurements_batch").await?;
        Ok(())
    }

    // ===== Validation probes =====

    /// Probe the PRO API with a one-item page. Any non-200 answer means the
    /// key is not usable; transport failures are surfaced.
    pub async fn validate_api_key(&self) -> Result<bool, ApiError> {
        if !self.mode.is_pro() {
            warn!("No API key to validate");
            return Ok(false);
        }
        debug!("Validating PRO API key");

        let response = self
            .http
            .get(self.config.pro_workouts_url())
            .headers(self.headers.clone())
            .query(&[("page", 1), ("pageSize", 1)])
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        let is_valid = response.status() == StatusCode::OK;
        debug!(is_valid, "PRO API key validation result");
        Ok(is_valid)
    }

    /// Probe the account endpoint with the bearer token.
    pub async fn validate_bearer_token(&self) -> Result<bool, ApiError> {
        match self.fetch_account().await {
            Ok(_) => Ok(true),
            Err(ApiError::Unauthorized) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
