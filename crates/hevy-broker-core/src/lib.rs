//! hevy-broker core - credential and session mediation for the Hevy API.
//!
//! Clients present a bearer session or a PRO API key; the broker resolves them
//! into a configured upstream client, performs brokered logins with a
//! browser-acquired challenge token, manages refresh, and normalizes PRO
//! payloads to the free-tier shape.

pub mod api;
pub mod auth;
pub mod broker;
pub mod challenge;
pub mod config;
pub mod models;
pub mod utils;

pub use api::{ApiError, UpstreamClient, WorkoutQuery};
pub use auth::{AuthMode, PresentedCredentials, SessionState, TokenSession};
pub use broker::HevyBroker;
pub use challenge::{ChallengeBroker, ChallengeError, ChallengeToken};
pub use config::{BrokerConfig, ChallengeSettings};
pub use models::{AccountRecord, BearerCredential, BodyMeasurement, Workout, WorkoutPage};
