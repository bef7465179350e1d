use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::utils::{deserialize_epoch_seconds, deserialize_opt_id};

/// The authenticated user's account as returned by `/user/account`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A body-weight entry from `/body_measurements`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyMeasurement {
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub id: Option<String>,
    // YYYY-MM-DD
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub weight_kg: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_epoch_seconds")]
    pub created_at: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
