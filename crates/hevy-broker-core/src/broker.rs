//! The broker facade the route layer talks to.

use std::sync::Arc;

use chrono::NaiveDate;
use reqwest::Client;
use tracing::{debug, info};

use crate::api::{ApiError, UpstreamClient, WorkoutQuery};
use crate::auth::{resolve_client, PresentedCredentials, TokenSession};
use crate::challenge::{BrowserLauncher, ChallengeBroker, ChromiumLauncher};
use crate::config::BrokerConfig;
use crate::models::{AccountRecord, BearerCredential, BodyMeasurement, WorkoutPage};

/// Mediates every upstream interaction: credential resolution, brokered
/// login with a challenge token, refresh, and data fetches.
///
/// One instance per process; it owns the shared browser resource. Cheap to
/// clone, clones share the HTTP pool and the challenge cache.
#[derive(Clone)]
pub struct HevyBroker {
    config: Arc<BrokerConfig>,
    http: Client,
    challenge: ChallengeBroker,
}

impl HevyBroker {
    /// Broker backed by a locally installed Chromium.
    pub fn new(config: BrokerConfig) -> Result<Self, ApiError> {
        let launcher = Arc::new(ChromiumLauncher::new(config.chrome_path.clone()));
        Self::with_launcher(config, launcher)
    }

    /// Broker with an explicit automation engine.
    pub fn with_launcher(
        config: BrokerConfig,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Result<Self, ApiError> {
        let http = UpstreamClient::build_http(&config)?;
        let challenge = ChallengeBroker::new(launcher, config.challenge.clone());
        Ok(Self {
            config: Arc::new(config),
            http,
            challenge,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn challenge(&self) -> &ChallengeBroker {
        &self.challenge
    }

    /// Build an upstream client for the presented credentials.
    pub fn resolve_client(&self, credentials: &PresentedCredentials) -> Result<UpstreamClient, ApiError> {
        resolve_client(&self.http, &self.config, credentials)
    }

    fn token_client(&self) -> UpstreamClient {
        UpstreamClient::anonymous(self.http.clone(), Arc::clone(&self.config))
    }

    /// Log in with a fresh challenge token and return the new pair.
    pub async fn login(&self, identifier: &str, secret: &str) -> Result<BearerCredential, ApiError> {
        let mut session = TokenSession::new();
        self.login_session(&mut session, identifier, secret).await
    }

    /// Log in and make the new pair the session's active one.
    ///
    /// The challenge token is single-use: it is invalidated whatever the
    /// outcome, including when this future is dropped mid-flight.
    pub async fn login_session(
        &self,
        session: &mut TokenSession,
        identifier: &str,
        secret: &str,
    ) -> Result<BearerCredential, ApiError> {
        let _invalidate = InvalidateOnDrop(&self.challenge);

        let token = self.challenge.get_token().await?;
        debug!(token_age_ms = token.age().as_millis() as u64, "Challenge token ready");

        let credential = session
            .login(&self.token_client(), identifier, secret, token.value())
            .await?;
        info!("Brokered login succeeded");
        Ok(credential)
    }

    /// Exchange a refresh token for a new pair.
    pub async fn refresh(&self, refresh_token: &str) -> Result<BearerCredential, ApiError> {
        let mut session = TokenSession::new();
        session.refresh(&self.token_client(), refresh_token).await
    }

    /// Refresh the session's pair with its own refresh token.
    pub async fn refresh_session(&self, session: &mut TokenSession) -> Result<BearerCredential, ApiError> {
        let refresh_token = session
            .credential()
            .map(|c| c.refresh_token.clone())
            .ok_or(ApiError::MissingCredentials)?;
        session.refresh(&self.token_client(), &refresh_token).await
    }

    /// Refresh the session only when its access token is about to expire.
    pub async fn refresh_session_if_needed(
        &self,
        session: &mut TokenSession,
    ) -> Result<Option<BearerCredential>, ApiError> {
        session.refresh_if_needed(&self.token_client()).await
    }

    pub async fn fetch_workouts(
        &self,
        client: &UpstreamClient,
        query: &WorkoutQuery,
    ) -> Result<WorkoutPage, ApiError> {
        client.fetch_workouts(query).await
    }

    pub async fn fetch_account(&self, client: &UpstreamClient) -> Result<AccountRecord, ApiError> {
        client.fetch_account().await
    }

    pub async fn fetch_body_measurements(
        &self,
        client: &UpstreamClient,
    ) -> Result<Vec<BodyMeasurement>, ApiError> {
        client.fetch_body_measurements().await
    }

    pub async fn post_body_measurement(
        &self,
        client: &UpstreamClient,
        date: NaiveDate,
        weight_kg: f64,
    ) -> Result<(), ApiError> {
        client.post_body_measurement(date, weight_kg).await
    }

    /// Check a PRO API key against the versioned API.
    pub async fn validate_api_key(&self, api_key: &str) -> Result<bool, ApiError> {
        let client = self.resolve_client(&PresentedCredentials::api_key(api_key))?;
        client.validate_api_key().await
    }

    /// Check a bearer token against the account endpoint.
    pub async fn validate_bearer_token(&self, access_token: &str) -> Result<bool, ApiError> {
        let client = self.resolve_client(&PresentedCredentials::bearer(access_token))?;
        client.validate_bearer_token().await
    }

    /// Close the browser resource.
    pub async fn shutdown(&self) {
        info!("Shutting down broker");
        self.challenge.invalidate();
        self.challenge.shutdown().await;
    }
}

struct InvalidateOnDrop<'a>(&'a ChallengeBroker);

impl Drop for InvalidateOnDrop<'_> {
    fn drop(&mut self) {
        self.0.invalidate();
    }
}
