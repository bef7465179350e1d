//! Authentication module: credential resolution and token lifecycle.
//!
//! This module provides:
//! - `resolve_client`/`AuthMode`: turns presented bearer tokens or PRO API keys
//!   into a configured `UpstreamClient`, API key first
//! - `TokenSession`: the login → refresh → invalid state machine for one
//!   bearer session

pub mod resolver;
pub mod session;

pub use resolver::{resolve_client, AuthMode, PresentedCredentials, CLIENT_MANAGED_SENTINEL};
pub use session::{SessionState, TokenSession};
