//! Upstream client tests against a mock Hevy API.

mod common;

use chrono::NaiveDate;
use common::*;
use hevy_broker_core::{
    ApiError, BrokerConfig, HevyBroker, PresentedCredentials, SessionState, TokenSession,
    UpstreamClient, WorkoutQuery,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn token_client(server: &MockServer) -> UpstreamClient {
    let config = config(server);
    let http = UpstreamClient::build_http(&config).unwrap();
    UpstreamClient::anonymous(http, Arc::new(config))
}

fn client(broker: &HevyBroker, credentials: PresentedCredentials) -> UpstreamClient {
    broker.resolve_client(&credentials).unwrap()
}

// ===== Token lifecycle =====

#[tokio::test]
async fn test_login_establishes_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .and(header("x-api-key", SERVICE_KEY))
        .and(header("hevy-platform", "web"))
        .and(body_partial_json(json!({
            "emailOrUsername": "me@example.com",
            "password": "hunter2",
            "recaptchaToken": "challenge",
            "useAuth2_0": true
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_pair()))
        .expect(1)
        .mount(&server)
        .await;

    let mut session = TokenSession::new();
    let credential = session
        .login(&token_client(&server), "me@example.com", "hunter2", "challenge")
        .await
        .unwrap();

    assert_eq!(credential.access_token, "access-1");
    assert_eq!(credential.refresh_token, "refresh-1");
    assert_eq!(credential.user_id.as_deref(), Some("u-42"));
    assert_eq!(credential.email.as_deref(), Some("me@example.com"));
    assert!(matches!(
        session.state(),
        SessionState::Active { refresh_count: 0, .. }
    ));
    assert!(!session.needs_refresh());
}

#[tokio::test]
async fn test_login_without_refresh_token_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-1",
            "user_id": "u-42"
        })))
        .mount(&server)
        .await;

    let mut session = TokenSession::new();
    let result = session
        .login(&token_client(&server), "lifter", "pw", "challenge")
        .await;

    assert!(matches!(result, Err(ApiError::MalformedUpstreamResponse(_))));
    assert_eq!(session.state(), &SessionState::NoSession);
}

#[tokio::test]
async fn test_login_rejected_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad password"))
        .mount(&server)
        .await;

    let mut session = TokenSession::new();
    let result = session
        .login(&token_client(&server), "lifter", "wrong", "challenge")
        .await;

    assert_eq!(result, Err(ApiError::InvalidCredentials));
    assert!(!session.is_active());
}

#[tokio::test]
async fn test_refresh_supersedes_pair() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_pair()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/refresh_token"))
        .and(body_partial_json(json!({"refresh_token": "refresh-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-2",
            "refresh_token": "refresh-2",
            "expires_at": 1893456000
        })))
        .mount(&server)
        .await;

    let upstream = token_client(&server);
    let mut session = TokenSession::new();
    session.login(&upstream, "lifter", "pw", "challenge").await.unwrap();
    let refreshed = session.refresh(&upstream, "refresh-1").await.unwrap();

    assert_eq!(refreshed.access_token, "access-2");
    assert_eq!(session.access_token(), Some("access-2"));
    assert!(matches!(
        session.state(),
        SessionState::Active { refresh_count: 1, .. }
    ));
}

#[tokio::test]
async fn test_refresh_rejected_invalidates_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_pair()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/refresh_token"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let upstream = token_client(&server);
    let mut session = TokenSession::new();
    session.login(&upstream, "lifter", "pw", "challenge").await.unwrap();

    let result = session.refresh(&upstream, "refresh-1").await;
    assert_eq!(result, Err(ApiError::InvalidRefreshToken));
    assert_eq!(session.state(), &SessionState::Invalid);
    assert_eq!(session.access_token(), None);
}

#[tokio::test]
async fn test_refresh_server_error_keeps_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_pair()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/refresh_token"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let upstream = token_client(&server);
    let mut session = TokenSession::new();
    session.login(&upstream, "lifter", "pw", "challenge").await.unwrap();

    let err = session.refresh(&upstream, "refresh-1").await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(session.access_token(), Some("access-1"));
}

#[tokio::test]
async fn test_refresh_if_needed_near_expiry() {
    let server = MockServer::start().await;
    let soon = chrono::Utc::now() + chrono::Duration::minutes(2);
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-1",
            "refresh_token": "refresh-1",
            "expires_at": soon.to_rfc3339()
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-2",
            "refresh_token": "refresh-2"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let upstream = token_client(&server);
    let mut session = TokenSession::new();
    session.login(&upstream, "lifter", "pw", "challenge").await.unwrap();
    assert!(session.needs_refresh());

    let refreshed = session.refresh_if_needed(&upstream).await.unwrap();
    assert_eq!(refreshed.map(|c| c.access_token), Some("access-2".to_string()));
    // No expiry on the new pair, so nothing further is due.
    assert_eq!(session.refresh_if_needed(&upstream).await.unwrap(), None);
}

// ===== Data calls =====

#[tokio::test]
async fn test_pro_workouts_are_normalized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/workouts"))
        .and(header("api-key", "pro-key"))
        .and(query_param("page", "1"))
        .and(query_param("pageSize", "5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "page": 1,
            "page_count": 3,
            "workouts": [pro_workout()]
        })))
        .mount(&server)
        .await;

    let (broker, _) = broker(&server);
    let upstream = client(&broker, PresentedCredentials::api_key("pro-key"));
    let page = broker
        .fetch_workouts(&upstream, &WorkoutQuery::page(1, 5))
        .await
        .unwrap();

    assert_eq!(page.workout_count, 1);
    assert_eq!(page.page, Some(1));
    let workout = serde_json::to_value(&page.workouts[0]).unwrap();
    assert_eq!(workout["start_time"], json!(1704067200));
    assert_eq!(workout["end_time"], json!(1704070800));
    assert_eq!(workout["estimated_volume_kg"], json!(600));
    assert_eq!(workout["exercises"][0]["id"], "w1-ex-0");
    assert_eq!(workout["exercises"][0]["sets"][1]["id"], "w1-ex-0-set-1");
    assert_eq!(workout["description"], "heavy");
    assert_eq!(workout["exercises"][0]["exercise_template_id"], "79D0BB3A");
}

#[tokio::test]
async fn test_pro_workouts_past_last_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/workouts"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "Page not found"})))
        .mount(&server)
        .await;

    let (broker, _) = broker(&server);
    let upstream = client(&broker, PresentedCredentials::api_key("pro-key"));
    let page = broker
        .fetch_workouts(&upstream, &WorkoutQuery::page(9, 10))
        .await
        .unwrap();

    assert!(page.workouts.is_empty());
    assert_eq!(page.workout_count, 0);
    assert_eq!(page.page, Some(9));
    assert_eq!(page.page_size, Some(10));
}

#[tokio::test]
async fn test_free_workouts_pass_through() {
    let free_workouts = json!([
        {
            "id": 9001,
            "title": "Legs",
            "start_time": 1704067200,
            "estimated_volume_kg": 1234.5,
            "exercises": [{"id": 17, "sets": [{"id": "s1", "weight_kg": 10, "reps": 10}]}]
        },
        {"id": "w10", "exercises": null, "nested": {"kept": [1, 2.5, null]}}
    ]);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user_workouts_paged"))
        .and(header("x-api-key", SERVICE_KEY))
        .and(header("authorization", "Bearer access-1"))
        .and(query_param("offset", "5"))
        .and(query_param("username", "lifter"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "workouts": free_workouts.clone()
        })))
        .mount(&server)
        .await;

    let (broker, _) = broker(&server);
    let upstream = client(&broker, PresentedCredentials::bearer("access-1"));
    let page = broker
        .fetch_workouts(&upstream, &WorkoutQuery::offset(5, "lifter"))
        .await
        .unwrap();

    assert_eq!(page.offset, Some(5));
    assert_eq!(page.workout_count, 2);
    assert_eq!(page.workouts[0].id().as_deref(), Some("9001"));
    assert_eq!(page.workouts[0].start_time(), Some(1704067200));
    // Free-tier volume is upstream's own figure.
    assert_eq!(page.workouts[0].estimated_volume_kg(), Some(1234.5));
    assert!(page.workouts[1].exercises().is_empty());

    // Served back exactly as upstream sent it.
    assert_eq!(serde_json::to_value(&page.workouts).unwrap(), free_workouts);
}

#[tokio::test]
async fn test_mismatched_pagination_never_reaches_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"workouts": []})))
        .expect(0)
        .mount(&server)
        .await;

    let (broker, _) = broker(&server);
    let pro = client(&broker, PresentedCredentials::api_key("pro-key"));
    let bearer = client(&broker, PresentedCredentials::bearer("access-1"));

    assert!(matches!(
        broker.fetch_workouts(&pro, &WorkoutQuery::offset(0, "lifter")).await,
        Err(ApiError::InvalidRequest(_))
    ));
    assert!(matches!(
        broker.fetch_workouts(&bearer, &WorkoutQuery::offset(3, "lifter")).await,
        Err(ApiError::InvalidRequest(_))
    ));
    assert!(matches!(
        broker.fetch_workouts(&pro, &WorkoutQuery::page(1, 51)).await,
        Err(ApiError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn test_api_key_wins_over_bearer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/workouts"))
        .and(header("api-key", "pro-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"workouts": []})))
        .expect(1)
        .mount(&server)
        .await;

    let (broker, _) = broker(&server);
    let upstream = client(
        &broker,
        PresentedCredentials {
            bearer_token: Some("access-1".into()),
            refresh_token: Some("refresh-1".into()),
            api_key: Some("pro-key".into()),
        },
    );
    broker
        .fetch_workouts(&upstream, &WorkoutQuery::page(1, 10))
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].headers.get("authorization").is_none());
    assert!(requests[0].headers.get("x-api-key").is_none());
}

#[tokio::test]
async fn test_resolver_rejects_missing_and_client_managed() {
    let server = MockServer::start().await;
    let (broker, _) = broker(&server);

    assert_eq!(
        broker.resolve_client(&PresentedCredentials::default()).err(),
        Some(ApiError::MissingCredentials)
    );
    assert_eq!(
        broker
            .resolve_client(&PresentedCredentials::bearer("   "))
            .err(),
        Some(ApiError::MissingCredentials)
    );
    assert_eq!(
        broker
            .resolve_client(&PresentedCredentials::api_key("client-managed"))
            .err(),
        Some(ApiError::UnsupportedMode)
    );
}

#[tokio::test]
async fn test_fetch_account() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user/account"))
        .and(header("authorization", "Bearer access-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "u-42",
            "username": "lifter",
            "email": "lifter@example.com",
            "is_coached": false
        })))
        .mount(&server)
        .await;

    let (broker, _) = broker(&server);
    let upstream = client(&broker, PresentedCredentials::bearer("access-1"));
    let account = broker.fetch_account(&upstream).await.unwrap();

    assert_eq!(account.id.as_deref(), Some("u-42"));
    assert_eq!(account.username.as_deref(), Some("lifter"));
    assert_eq!(account.extra.get("is_coached"), Some(&json!(false)));
}

#[tokio::test]
async fn test_fetch_account_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user/account"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let (broker, _) = broker(&server);
    let upstream = client(&broker, PresentedCredentials::bearer("stale"));

    assert_eq!(broker.fetch_account(&upstream).await, Err(ApiError::Unauthorized));
    assert_eq!(broker.validate_bearer_token("stale").await, Ok(false));
}

#[tokio::test]
async fn test_fetch_account_requires_bearer() {
    let server = MockServer::start().await;
    let (broker, _) = broker(&server);
    let upstream = client(&broker, PresentedCredentials::api_key("pro-key"));

    assert!(matches!(
        broker.fetch_account(&upstream).await,
        Err(ApiError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn test_malformed_json_is_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user/account"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let (broker, _) = broker(&server);
    let upstream = client(&broker, PresentedCredentials::bearer("access-1"));

    assert!(matches!(
        broker.fetch_account(&upstream).await,
        Err(ApiError::UpstreamProtocolError { status: None, .. })
    ));
}

#[tokio::test]
async fn test_unreachable_upstream() {
    let config = BrokerConfig::new(SERVICE_KEY).with_base_url("http://127.0.0.1:1");
    let http = UpstreamClient::build_http(&config).unwrap();
    let upstream = UpstreamClient::anonymous(http, Arc::new(config));

    let result = upstream.refresh_access_token("refresh-1").await;
    assert!(matches!(result, Err(ApiError::UpstreamUnreachable(_))));
}

#[tokio::test]
async fn test_slow_upstream_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/refresh_token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_pair())
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let mut config = config(&server);
    config.request_timeout = Duration::from_millis(200);
    let http = UpstreamClient::build_http(&config).unwrap();
    let upstream = UpstreamClient::anonymous(http, Arc::new(config));

    let err = upstream.refresh_access_token("refresh-1").await.unwrap_err();
    assert!(matches!(err, ApiError::UpstreamTimeout(_)), "got {:?}", err);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_body_measurements() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/body_measurements"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "date": "2024-03-01", "weight_kg": 81.5, "created_at": "2024-03-01T07:30:00Z"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/body_measurements_batch"))
        .and(body_partial_json(json!({
            "measurementsBatch": [{"date": "2024-03-02", "weight_kg": 81.0}]
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (broker, _) = broker(&server);
    let upstream = client(&broker, PresentedCredentials::bearer("access-1"));

    let measurements = broker.fetch_body_measurements(&upstream).await.unwrap();
    assert_eq!(measurements.len(), 1);
    assert_eq!(measurements[0].created_at, Some(1709278200));

    let date = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
    broker
        .post_body_measurement(&upstream, date, 81.0)
        .await
        .unwrap();
    assert!(matches!(
        broker.post_body_measurement(&upstream, date, -1.0).await,
        Err(ApiError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn test_validate_api_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/workouts"))
        .and(header("api-key", "good"))
        .and(query_param("pageSize", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"workouts": []})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/workouts"))
        .and(header("api-key", "bad"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let (broker, _) = broker(&server);
    assert_eq!(broker.validate_api_key("good").await, Ok(true));
    assert_eq!(broker.validate_api_key("bad").await, Ok(false));
    assert_eq!(
        broker.validate_api_key("").await,
        Err(ApiError::MissingCredentials)
    );
}
