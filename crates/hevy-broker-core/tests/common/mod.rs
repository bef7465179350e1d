//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hevy_broker_core::challenge::{BrowserInstance, BrowserLauncher, BrowserPage};
use hevy_broker_core::{BrokerConfig, ChallengeError, HevyBroker};
use serde_json::{json, Value};
use wiremock::MockServer;

pub const SERVICE_KEY: &str = "service-key";

/// Counts how often the scripted engine was driven.
#[derive(Default)]
pub struct EngineStats {
    pub launches: AtomicUsize,
    pub extractions: AtomicUsize,
}

impl EngineStats {
    pub fn extractions(&self) -> usize {
        self.extractions.load(Ordering::SeqCst)
    }
}

/// Engine whose pages expose `challenge-N` on the first poll.
pub struct ScriptedLauncher(pub Arc<EngineStats>);

struct ScriptedBrowser(Arc<EngineStats>);

struct ScriptedPage(String);

#[async_trait]
impl BrowserLauncher for ScriptedLauncher {
    async fn launch(&self) -> Result<Arc<dyn BrowserInstance>, ChallengeError> {
        self.0.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedBrowser(Arc::clone(&self.0))))
    }
}

#[async_trait]
impl BrowserInstance for ScriptedBrowser {
    fn is_connected(&self) -> bool {
        true
    }

    async fn new_page(&self, _user_agent: &str) -> Result<Box<dyn BrowserPage>, ChallengeError> {
        let n = self.0.extractions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(ScriptedPage(format!("challenge-{}", n))))
    }

    async fn close(&self) -> Result<(), ChallengeError> {
        Ok(())
    }
}

#[async_trait]
impl BrowserPage for ScriptedPage {
    async fn goto(&mut self, _url: &str, _timeout: Duration) -> Result<(), ChallengeError> {
        Ok(())
    }

    async fn evaluate(&mut self, _expression: &str) -> Result<Value, ChallengeError> {
        Ok(Value::String(self.0.clone()))
    }

    async fn close(self: Box<Self>) -> Result<(), ChallengeError> {
        Ok(())
    }
}

pub fn config(server: &MockServer) -> BrokerConfig {
    BrokerConfig::new(SERVICE_KEY).with_base_url(server.uri())
}

/// A broker pointed at the mock server with a scripted challenge engine.
pub fn broker(server: &MockServer) -> (HevyBroker, Arc<EngineStats>) {
    let stats = Arc::new(EngineStats::default());
    let launcher = Arc::new(ScriptedLauncher(Arc::clone(&stats)));
    let broker = HevyBroker::with_launcher(config(server), launcher).expect("broker builds");
    (broker, stats)
}

pub fn token_pair() -> Value {
    json!({
        "access_token": "access-1",
        "refresh_token": "refresh-1",
        "user_id": "u-42",
        "expires_at": "2030-01-01T00:00:00Z"
    })
}

/// A PRO workout with ISO timestamps and no exercise/set ids.
pub fn pro_workout() -> Value {
    json!({
        "id": "w1",
        "title": "Push Day",
        "description": "heavy",
        "start_time": "2024-01-01T00:00:00Z",
        "end_time": "2024-01-01T01:00:00Z",
        "created_at": "2024-01-01T01:00:05Z",
        "updated_at": "2024-01-01T01:00:05Z",
        "exercises": [{
            "index": 0,
            "title": "Bench Press",
            "exercise_template_id": "79D0BB3A",
            "sets": [
                {"index": 0, "type": "normal", "weight_kg": 100, "reps": 5},
                {"index": 1, "type": "warmup", "weight_kg": 50, "reps": 2}
            ]
        }]
    })
}
