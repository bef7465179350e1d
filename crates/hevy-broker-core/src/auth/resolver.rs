use std::sync::Arc;

use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use tracing::debug;

use crate::api::{ApiError, UpstreamClient};
use crate::config::BrokerConfig;

/// Value a client sends when it keeps its credentials to itself and the broker
/// must not proxy calls on its behalf.
pub const CLIENT_MANAGED_SENTINEL: &str = "client-managed";

/// Header carrying a PRO subscriber key
pub const API_KEY_HEADER: &str = "api-key";
/// Header carrying the static service key on free-tier calls
pub const SERVICE_KEY_HEADER: &str = "x-api-key";
/// Fixed platform identifier sent with bearer sessions
pub const PLATFORM_HEADER: &str = "hevy-platform";
pub const PLATFORM_VALUE: &str = "web";

/// Credential material as presented by the route layer, typically lifted from
/// request headers or cookies.
#[derive(Clone, Default)]
pub struct PresentedCredentials {
    pub bearer_token: Option<String>,
    pub refresh_token: Option<String>,
    pub api_key: Option<String>,
}

impl std::fmt::Debug for PresentedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresentedCredentials")
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<present>"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<present>"))
            .field("api_key", &self.api_key.as_ref().map(|_| "<present>"))
            .finish()
    }
}

impl PresentedCredentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer_token: Some(token.into()),
            ..Self::default()
        }
    }

    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            api_key: Some(key.into()),
            ..Self::default()
        }
    }

    fn materials(&self) -> [Option<&str>; 3] {
        [
            self.bearer_token.as_deref(),
            self.refresh_token.as_deref(),
            self.api_key.as_deref(),
        ]
    }
}

/// Trim and drop blank values.
fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Which upstream surface a request is authorized for.
///
/// Always derived from the presented material, never stored on its own.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMode {
    Unauthenticated,
    BearerSession { access_token: String },
    ApiKeySession { api_key: String },
}

impl std::fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl AuthMode {
    /// Derive the mode from presented material.
    ///
    /// An API key wins over any bearer material. The client-managed sentinel
    /// in any field is rejected before precedence is considered.
    pub fn derive(credentials: &PresentedCredentials) -> Result<Self, ApiError> {
        if credentials
            .materials()
            .iter()
            .any(|m| non_blank(*m) == Some(CLIENT_MANAGED_SENTINEL))
        {
            return Err(ApiError::UnsupportedMode);
        }

        if let Some(api_key) = non_blank(credentials.api_key.as_deref()) {
            return Ok(AuthMode::ApiKeySession {
                api_key: api_key.to_string(),
            });
        }

        if let Some(token) = non_blank(credentials.bearer_token.as_deref()) {
            return Ok(AuthMode::BearerSession {
                access_token: token.to_string(),
            });
        }

        Ok(AuthMode::Unauthenticated)
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthMode::Unauthenticated => "Unauthenticated",
            AuthMode::BearerSession { .. } => "BearerSession",
            AuthMode::ApiKeySession { .. } => "ApiKeySession",
        }
    }

    pub fn is_pro(&self) -> bool {
        matches!(self, AuthMode::ApiKeySession { .. })
    }

    /// Default headers for every request made in this mode.
    pub fn headers(&self, config: &BrokerConfig) -> Result<HeaderMap, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        match self {
            AuthMode::Unauthenticated => {}
            AuthMode::ApiKeySession { api_key } => {
                headers.insert(HeaderName::from_static(API_KEY_HEADER), sensitive(api_key)?);
            }
            AuthMode::BearerSession { access_token } => {
                headers.insert(
                    HeaderName::from_static(SERVICE_KEY_HEADER),
                    sensitive(&config.x_api_key)?,
                );
                headers.insert(
                    HeaderName::from_static(PLATFORM_HEADER),
                    HeaderValue::from_static(PLATFORM_VALUE),
                );
                headers.insert(
                    header::AUTHORIZATION,
                    sensitive(&format!("Bearer {}", access_token))?,
                );
            }
        }
        Ok(headers)
    }
}

fn sensitive(value: &str) -> Result<HeaderValue, ApiError> {
    let mut value = HeaderValue::from_str(value)
        .map_err(|_| ApiError::InvalidRequest("credential contains invalid header characters".into()))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Turn presented material into a configured upstream client.
pub fn resolve_client(
    http: &Client,
    config: &Arc<BrokerConfig>,
    credentials: &PresentedCredentials,
) -> Result<UpstreamClient, ApiError> {
    match AuthMode::derive(credentials)? {
        AuthMode::Unauthenticated => Err(ApiError::MissingCredentials),
        mode => {
            debug!(mode = mode.name(), "Resolved upstream client");
            UpstreamClient::new(http.clone(), Arc::clone(config), mode)
        }
    }
}
