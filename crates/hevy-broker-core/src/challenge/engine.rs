//! The automation surface the resource manager drives.
//!
//! Implementations only need to launch a browser, open isolated pages, navigate
//! and evaluate script. [`ChromiumLauncher`](super::cdp::ChromiumLauncher) is
//! the production implementation; tests script their own.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::ChallengeError;

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Start a new headless browser instance.
    async fn launch(&self) -> Result<Arc<dyn BrowserInstance>, ChallengeError>;
}

#[async_trait]
pub trait BrowserInstance: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Open an isolated browsing context (no shared cookies or storage) with
    /// one page in it.
    async fn new_page(&self, user_agent: &str) -> Result<Box<dyn BrowserPage>, ChallengeError>;

    async fn close(&self) -> Result<(), ChallengeError>;
}

#[async_trait]
pub trait BrowserPage: Send {
    /// Navigate and wait until the document has finished loading.
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<(), ChallengeError>;

    /// Evaluate an expression in the page, awaiting it if it is a promise, and
    /// return its JSON value.
    async fn evaluate(&mut self, expression: &str) -> Result<Value, ChallengeError>;

    /// Close the page together with its browsing context.
    async fn close(self: Box<Self>) -> Result<(), ChallengeError>;
}
