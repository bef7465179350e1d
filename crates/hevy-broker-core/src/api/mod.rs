//! REST API client module for Hevy services.
//!
//! This module provides the `UpstreamClient` for the login, refresh, account,
//! workout and body-measurement endpoints, and the `ApiError` taxonomy every
//! broker operation reports through.
//!
//! Two upstream surfaces exist: the free tier, authorized with a bearer token
//! plus the static service key, and the versioned PRO API, authorized with a
//! subscriber API key. PRO responses are normalized to the free-tier shape.

pub mod client;
pub mod error;
pub mod query;

pub use client::UpstreamClient;
pub use error::ApiError;
pub use query::WorkoutQuery;
