//! Challenge-token acquisition.
//!
//! Upstream login requires a fresh reCAPTCHA token. Tokens are produced by a
//! headless browser visiting the hosted login page ([`BrowserManager`]) and
//! handed out through a short-lived, single-flight cache ([`ChallengeBroker`]).

mod broker;
mod cdp;
mod engine;
mod error;
mod manager;

pub use broker::{ChallengeBroker, ChallengeToken};
pub use cdp::ChromiumLauncher;
pub use engine::{BrowserInstance, BrowserLauncher, BrowserPage};
pub use error::ChallengeError;
pub use manager::BrowserManager;
