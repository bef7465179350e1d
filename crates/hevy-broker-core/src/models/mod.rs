//! Data models for Hevy entities.
//!
//! - `BearerCredential`: the access/refresh pair issued at login
//! - `Workout`, `WorkoutPage`: workout history in the free-tier shape, shared by
//!   both authentication modes
//! - `AccountRecord`, `BodyMeasurement`: user profile and body-weight data

pub mod account;
pub mod credential;
pub mod workout;

pub use account::{AccountRecord, BodyMeasurement};
pub use credential::BearerCredential;
pub use workout::{Workout, WorkoutPage};
pub(crate) use workout::UpstreamWorkoutsResponse;
