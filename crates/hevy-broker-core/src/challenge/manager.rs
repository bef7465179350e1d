use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ChallengeSettings;

use super::engine::{BrowserInstance, BrowserLauncher, BrowserPage};
use super::ChallengeError;

/// Reads the token the login page's own script leaves on `window`.
const POLL_EXPRESSION: &str = r#"(() => {
    const token = window.recaptchaToken || window.__recaptchaToken;
    return typeof token === 'string' && token.length > 0 ? token : null;
})()"#;

/// Owns the single shared browser instance and turns it into challenge tokens.
///
/// The instance is launched lazily, reused across acquisitions, and replaced
/// wholesale after any fault. All use of it is serialized through `browser`.
pub struct BrowserManager {
    launcher: Arc<dyn BrowserLauncher>,
    settings: ChallengeSettings,
    browser: Mutex<Option<Arc<dyn BrowserInstance>>>,
}

impl BrowserManager {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, settings: ChallengeSettings) -> Self {
        Self {
            launcher,
            settings,
            browser: Mutex::new(None),
        }
    }

    /// Return the live browser, launching a new one if none is connected.
    pub async fn ensure_browser(&self) -> Result<Arc<dyn BrowserInstance>, ChallengeError> {
        let mut slot = self.browser.lock().await;
        self.ensure_in(&mut slot).await
    }

    async fn ensure_in(
        &self,
        slot: &mut Option<Arc<dyn BrowserInstance>>,
    ) -> Result<Arc<dyn BrowserInstance>, ChallengeError> {
        if let Some(browser) = slot.as_ref() {
            if browser.is_connected() {
                return Ok(Arc::clone(browser));
            }
            debug!("Browser disconnected, relaunching");
        }
        if let Some(stale) = slot.take() {
            close_quietly(stale).await;
        }

        debug!("Launching headless browser");
        let browser = self.launcher.launch().await?;
        info!("Browser launched");
        *slot = Some(Arc::clone(&browser));
        Ok(browser)
    }

    /// Produce a fresh token with the shared browser.
    ///
    /// On any extraction fault the browser is closed and forgotten so the next
    /// call starts from a clean launch.
    pub async fn acquire_token(&self) -> Result<String, ChallengeError> {
        let mut slot = self.browser.lock().await;
        let browser = self.ensure_in(&mut slot).await?;

        match self.extract_token(browser.as_ref()).await {
            Ok(token) => Ok(token),
            Err(e) => {
                error!(error = %e, "Error generating challenge token");
                if let Some(browser) = slot.take() {
                    close_quietly(browser).await;
                }
                Err(e)
            }
        }
    }

    /// Open an isolated page, pull a token from the login surface and close
    /// the page again. The browser itself stays open.
    pub async fn extract_token(&self, browser: &dyn BrowserInstance) -> Result<String, ChallengeError> {
        let mut page = browser.new_page(&self.settings.user_agent).await?;
        let result = self.run_extraction(page.as_mut()).await;
        if let Err(e) = page.close().await {
            warn!(error = %e, "Failed to close browsing context");
        }
        result
    }

    async fn run_extraction(&self, page: &mut dyn BrowserPage) -> Result<String, ChallengeError> {
        page.goto(&self.settings.login_page_url, self.settings.navigation_timeout)
            .await?;

        for attempt in 0..self.settings.poll_attempts {
            if let Some(token) = as_token(page.evaluate(POLL_EXPRESSION).await?) {
                debug!(attempt, "Challenge token found on page");
                return Ok(token);
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }

        self.execute_fallback(page).await
    }

    /// Secondary strategy: ask the page's reCAPTCHA API for a token directly.
    /// Only tried when a site key is configured and the API is present.
    async fn execute_fallback(&self, page: &mut dyn BrowserPage) -> Result<String, ChallengeError> {
        let Some(site_key) = self.settings.site_key.as_deref() else {
            debug!("No site key configured, skipping execute fallback");
            return Err(ChallengeError::TokenNotFound);
        };

        debug!("Polling exhausted, invoking page reCAPTCHA execute");
        let expression = fallback_expression(site_key);
        as_token(page.evaluate(&expression).await?).ok_or(ChallengeError::TokenNotFound)
    }

    /// Close and forget the shared browser.
    pub async fn reset(&self) {
        let browser = self.browser.lock().await.take();
        if let Some(browser) = browser {
            close_quietly(browser).await;
        }
    }
}

fn fallback_expression(site_key: &str) -> String {
    // serde_json gives a correctly escaped JS string literal
    let site_key = Value::String(site_key.to_string());
    format!(
        r#"(async () => {{
    const api = window.grecaptcha && window.grecaptcha.enterprise;
    if (!api || typeof api.execute !== 'function') {{
        return null;
    }}
    return await api.execute({}, {{ action: 'login' }});
}})()"#,
        site_key
    )
}

fn as_token(value: Value) -> Option<String> {
    match value {
        Value::String(token) if !token.is_empty() => Some(token),
        _ => None,
    }
}

async fn close_quietly(browser: Arc<dyn BrowserInstance>) {
    if let Err(e) = browser.close().await {
        warn!(error = %e, "Failed to close browser");
    }
}
