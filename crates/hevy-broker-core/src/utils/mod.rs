//! Utility functions for payload normalization.

pub mod time;

pub use time::{deserialize_epoch_seconds, deserialize_opt_id, epoch_seconds, iso_to_epoch_seconds};
