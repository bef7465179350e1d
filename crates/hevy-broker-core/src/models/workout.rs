use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::utils::epoch_seconds;

/// Timestamp fields the PRO API sends as ISO-8601 and the free tier as epoch
/// seconds.
const TIMESTAMP_FIELDS: &[&str] = &["start_time", "end_time", "created_at", "updated_at"];

/// A single workout in the shape the free-tier API returns.
///
/// The upstream object is kept verbatim: free-tier workouts serialize back
/// exactly as they arrived, number kinds and unknown fields included. PRO
/// workouts are brought to the same shape in place by [`Workout::normalize_pro`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Workout(Map<String, Value>);

impl From<Map<String, Value>> for Workout {
    fn from(fields: Map<String, Value>) -> Self {
        Workout(fields)
    }
}

impl Workout {
    /// Identifier as text; numeric ids are rendered in decimal.
    pub fn id(&self) -> Option<String> {
        id_text(self.0.get("id"))
    }

    pub fn title(&self) -> Option<&str> {
        self.0.get("title").and_then(Value::as_str)
    }

    pub fn start_time(&self) -> Option<i64> {
        self.timestamp("start_time")
    }

    pub fn end_time(&self) -> Option<i64> {
        self.timestamp("end_time")
    }

    pub fn created_at(&self) -> Option<i64> {
        self.timestamp("created_at")
    }

    pub fn updated_at(&self) -> Option<i64> {
        self.timestamp("updated_at")
    }

    fn timestamp(&self, field: &str) -> Option<i64> {
        self.0.get(field).and_then(epoch_seconds)
    }

    pub fn estimated_volume_kg(&self) -> Option<f64> {
        self.0.get("estimated_volume_kg").and_then(Value::as_f64)
    }

    /// Exercise objects; an absent or `null` list reads as empty.
    pub fn exercises(&self) -> &[Value] {
        self.0
            .get("exercises")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Any field, exactly as upstream sent it (after normalization for PRO).
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Sum of `weight_kg * reps` over every set of every exercise.
    ///
    /// All set types count, warm-ups included. Missing or `null` weight and
    /// reps count as zero.
    pub fn compute_volume_kg(&self) -> f64 {
        self.exercises()
            .iter()
            .flat_map(|exercise| items(exercise, "sets"))
            .map(set_volume_kg)
            .sum()
    }

    /// Bring a PRO workout up to the free-tier shape: ISO timestamps become
    /// epoch seconds, missing exercise/set identifiers are synthesized and
    /// `estimated_volume_kg` is filled in. Everything else is left as sent.
    ///
    /// Synthesized ids depend only on the parent id and each record's index, so
    /// repeated fetches of the same data yield the same ids.
    pub fn normalize_pro(&mut self) {
        for field in TIMESTAMP_FIELDS {
            if let Some(value) = self.0.get_mut(*field) {
                if value.is_string() {
                    if let Some(secs) = epoch_seconds(value) {
                        *value = Value::from(secs);
                    }
                }
            }
        }

        let workout_id = self.id().unwrap_or_default();
        if let Some(Value::Array(exercises)) = self.0.get_mut("exercises") {
            for (position, exercise) in exercises.iter_mut().enumerate() {
                let Value::Object(exercise) = exercise else {
                    continue;
                };
                let exercise_id = ensure_id(exercise, position, |index| {
                    format!("{}-ex-{}", workout_id, index)
                });

                if let Some(Value::Array(sets)) = exercise.get_mut("sets") {
                    for (set_position, set) in sets.iter_mut().enumerate() {
                        if let Value::Object(set) = set {
                            ensure_id(set, set_position, |index| {
                                format!("{}-set-{}", exercise_id, index)
                            });
                        }
                    }
                }
            }
        }

        let volume = self.compute_volume_kg();
        self.0
            .insert("estimated_volume_kg".to_string(), volume_value(volume));
    }
}

/// Return the record's id as text, synthesizing one from its `index` (or its
/// position when it has none) if it is missing.
fn ensure_id(
    record: &mut Map<String, Value>,
    position: usize,
    synthesize: impl FnOnce(u64) -> String,
) -> String {
    if let Some(id) = id_text(record.get("id")) {
        return id;
    }
    let index = record
        .get("index")
        .and_then(Value::as_u64)
        .unwrap_or(position as u64);
    let id = synthesize(index);
    record.insert("id".to_string(), Value::String(id.clone()));
    id
}

fn id_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn items<'a>(record: &'a Value, field: &str) -> &'a [Value] {
    record
        .get(field)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn set_volume_kg(set: &Value) -> f64 {
    let number = |field: &str| set.get(field).and_then(Value::as_f64).unwrap_or(0.0);
    number("weight_kg") * number("reps")
}

/// Whole volumes are written as integers, like the free tier does.
fn volume_value(volume: f64) -> Value {
    if volume.fract() == 0.0 && volume.abs() < i64::MAX as f64 {
        Value::from(volume as i64)
    } else {
        Value::from(volume)
    }
}

/// One page of workouts as handed to downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutPage {
    pub workouts: Vec<Workout>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
    pub workout_count: usize,
}

impl WorkoutPage {
    /// The page returned when the PRO API answers 404 past the last page.
    pub fn empty(page: u32, page_size: u32) -> Self {
        Self {
            workouts: Vec::new(),
            page: Some(page),
            page_size: Some(page_size),
            offset: None,
            workout_count: 0,
        }
    }
}

/// Raw page envelope shared by both tiers.
#[derive(Debug, Deserialize)]
pub(crate) struct UpstreamWorkoutsResponse {
    #[serde(default)]
    workouts: Option<Vec<Workout>>,
}

impl UpstreamWorkoutsResponse {
    /// The workouts; an absent or `null` list reads as empty.
    pub(crate) fn into_workouts(self) -> Vec<Workout> {
        self.workouts.unwrap_or_default()
    }
}
