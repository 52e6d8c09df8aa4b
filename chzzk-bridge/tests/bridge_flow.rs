//! End-to-end flows through both HTTP listeners, driven in-process.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, BodyDataStream, to_bytes};
use axum::http::{Method, Request, StatusCode};
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

use chzzk_bridge::api::BridgeServer;
use chzzk_bridge::config::BridgeConfig;
use chzzk_bridge::database;
use chzzk_bridge::database::models::{CredentialDbModel, NewEvent};
use chzzk_bridge::database::repositories::{CredentialRepository, EventRepository};
use chzzk_bridge::gateway::SandboxGateway;
use chzzk_bridge::services::ServiceContainer;

struct Harness {
    _dir: TempDir,
    gateway: Arc<SandboxGateway>,
    container: ServiceContainer,
    api: Router,
    oauth: Router,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("bridge.db").display());
    let pool = database::init_pool(&url).await.unwrap();
    let write_pool = database::init_write_pool(&url).await.unwrap();
    database::run_migrations(&pool).await.unwrap();

    let config = BridgeConfig {
        client_id: "client".to_string(),
        poll_interval: Duration::from_millis(50),
        ..BridgeConfig::default()
    };
    let gateway = Arc::new(SandboxGateway::new());
    let container = ServiceContainer::new(config, pool, write_pool, gateway.clone());
    let server = BridgeServer::new(container.app_state());

    Harness {
        _dir: dir,
        gateway,
        api: server.api_router(),
        oauth: server.oauth_router(),
        container,
    }
}

async fn send(router: &Router, method: Method, uri: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn subscribe(h: &Harness, subscriber: Uuid) -> (StatusCode, Value) {
    send(
        &h.api,
        Method::POST,
        &format!("/api/v1/subscribe?subscriber={subscriber}"),
    )
    .await
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

/// Read SSE frames from the body until `count` events have arrived.
async fn read_events(stream: &mut BodyDataStream, count: usize) -> Vec<(i64, Value)> {
    let mut buffer = String::new();
    let mut events = Vec::new();

    while events.len() < count {
        let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .unwrap();
        buffer.push_str(std::str::from_utf8(&chunk).unwrap());

        while let Some(end) = buffer.find("\n\n") {
            let frame: String = buffer.drain(..end + 2).collect();
            let mut id = None;
            let mut data = None;
            for line in frame.lines() {
                if let Some(v) = line.strip_prefix("id:") {
                    id = Some(v.trim().parse::<i64>().unwrap());
                } else if let Some(v) = line.strip_prefix("data:") {
                    data = Some(serde_json::from_str::<Value>(v.trim()).unwrap());
                }
            }
            if let (Some(id), Some(data)) = (id, data) {
                events.push((id, data));
            }
        }
    }
    events
}

async fn store_credential(h: &Harness, subscriber: Uuid, account: &str, expires_in: i64) {
    let expires_at = Utc::now() + chrono::Duration::seconds(expires_in);
    h.container
        .credentials
        .upsert(&CredentialDbModel::new(
            subscriber,
            account,
            "stored-access",
            "stored-refresh",
            expires_at,
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_authorization_flow() {
    let h = harness().await;
    let subscriber = Uuid::new_v4();

    let (status, body) = subscribe(&h, subscriber).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let state = body["state"].as_str().unwrap().to_string();
    assert!(
        body["authorizationUrl"]
            .as_str()
            .unwrap()
            .contains(&format!("state={state}"))
    );

    let account = h.gateway.register_auth_code("code-1", Some(&state), None);
    let (status, body) = send(
        &h.oauth,
        Method::GET,
        &format!("/oauth_callback?code=code-1&state={state}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scopes"].as_array().unwrap().len(), 2);

    let stored = h.container.credentials.get(subscriber).await.unwrap().unwrap();
    assert_eq!(stored.account_id, account);

    // The state is single use.
    let (status, body) = send(
        &h.oauth,
        Method::GET,
        &format!("/oauth_callback?code=code-1&state={state}"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "STATE_NOT_FOUND");

    // The callback already registered a session.
    let (status, _) = subscribe(&h, subscriber).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let uri = format!("/api/v1/unsubscribe?subscriber={subscriber}");
    let (status, _) = send(&h.api, Method::POST, &uri).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&h.api, Method::POST, &uri).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(h.gateway.open_sessions(&account).is_empty());

    h.container.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_callback_rejects_existing_credential() {
    let h = harness().await;
    let subscriber = Uuid::new_v4();
    store_credential(&h, subscriber, "channel", 3600).await;

    let state = h.container.states.issue(subscriber);
    h.gateway.register_auth_code("code-2", Some(&state), None);
    let (status, body) = send(
        &h.oauth,
        Method::GET,
        &format!("/oauth_callback?code=code-2&state={state}"),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_ACCEPTABLE);
    assert_eq!(body["code"], "CREDENTIAL_EXISTS");
}

#[tokio::test]
async fn test_callback_fails_when_session_cannot_open() {
    let h = harness().await;
    let subscriber = Uuid::new_v4();
    h.gateway.set_fail_open(true);

    let state = h.container.states.issue(subscriber);
    h.gateway.register_auth_code("code-3", Some(&state), None);
    let (status, body) = send(
        &h.oauth,
        Method::GET,
        &format!("/oauth_callback?code=code-3&state={state}"),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "SESSION_UNAVAILABLE");
    assert!(h.gateway.sessions().is_empty());
    // The login itself went through.
    assert!(h.container.credentials.get(subscriber).await.unwrap().is_some());
}

#[tokio::test]
async fn test_subscribe_with_valid_credential() {
    let h = harness().await;
    let subscriber = Uuid::new_v4();
    let expires_at = Utc::now() + chrono::Duration::hours(1);
    h.gateway
        .register_token("channel", "stored-access", "stored-refresh", expires_at);
    store_credential(&h, subscriber, "channel", 3600).await;

    let (status, body) = subscribe(&h, subscriber).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accountId"], "channel");
    assert_eq!(h.gateway.open_sessions("channel").len(), 1);

    h.container.shutdown().await.unwrap();
    assert!(h.gateway.open_sessions("channel").is_empty());
}

#[tokio::test]
async fn test_subscribe_refreshes_expired_credential() {
    let h = harness().await;
    let subscriber = Uuid::new_v4();
    let expired = Utc::now() - chrono::Duration::minutes(5);
    h.gateway
        .register_token("channel", "stored-access", "stored-refresh", expired);
    store_credential(&h, subscriber, "channel", -300).await;

    let (status, _) = subscribe(&h, subscriber).await;
    assert_eq!(status, StatusCode::OK);

    let stored = h.container.credentials.get(subscriber).await.unwrap().unwrap();
    assert_ne!(stored.access_token, "stored-access");
    assert_ne!(stored.refresh_token, "stored-refresh");
    assert!(!stored.is_expired());

    h.container.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rejected_refresh_requires_authorization() {
    let h = harness().await;
    let subscriber = Uuid::new_v4();
    store_credential(&h, subscriber, "channel", -300).await;

    let (status, body) = subscribe(&h, subscriber).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["state"].as_str().is_some_and(|s| !s.is_empty()));
    assert!(h.container.credentials.get(subscriber).await.unwrap().is_none());
    assert_eq!(h.container.states.len(), 1);
}

#[tokio::test]
async fn test_missing_subscriber_is_bad_request() {
    let h = harness().await;

    let (status, _) = send(&h.api, Method::POST, "/api/v1/subscribe").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&h.api, Method::GET, "/api/v1/events?subscriber=nope").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_event_stream_delivers_and_persists_cursor() {
    let h = harness().await;
    let subscriber = Uuid::new_v4();
    let expires_at = Utc::now() + chrono::Duration::hours(1);
    h.gateway
        .register_token("channel", "stored-access", "stored-refresh", expires_at);
    store_credential(&h, subscriber, "channel", 3600).await;

    let (status, _) = subscribe(&h, subscriber).await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(h.gateway.emit_chat("channel", "viewer", "Viewer", "hello"), 1);
    h.gateway
        .emit_donation("channel", "fan", "Fan", "thanks", 1000);
    let events = h.container.events.clone();
    wait_until(|| {
        let events = events.clone();
        async move { events.latest_ordinal("channel").await.unwrap() == 2 }
    })
    .await;

    let response = h
        .api
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/events?subscriber={subscriber}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    let mut body = response.into_body().into_data_stream();
    let received = read_events(&mut body, 2).await;
    assert_eq!(received[0].0, 1);
    assert_eq!(received[0].1["message"], "hello");
    assert_eq!(received[0].1["channelId"], "channel");
    assert_eq!(received[0].1["payAmount"], 0);
    assert_eq!(received[1].0, 2);
    assert_eq!(received[1].1["payAmount"], 1000);

    // Event 2 counts as delivered once the client reads past it.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), body.next())
            .await
            .is_err()
    );
    let credentials = h.container.credentials.clone();
    wait_until(|| {
        let credentials = credentials.clone();
        async move {
            credentials
                .get(subscriber)
                .await
                .unwrap()
                .is_some_and(|c| c.last_delivered_cursor == 2)
        }
    })
    .await;

    h.container.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_event_stream_resumes_after_last_event_id() {
    let h = harness().await;
    let subscriber = Uuid::new_v4();
    store_credential(&h, subscriber, "channel", 3600).await;
    for n in 0..3 {
        h.container
            .events
            .append(&NewEvent::chat(
                "channel",
                "viewer",
                "Viewer",
                format!("message {n}"),
                Utc::now(),
            ))
            .await
            .unwrap();
    }

    let response = h
        .api
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/sse?uuid={subscriber}"))
                .header("Last-Event-ID", "1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let received = read_events(&mut body, 2).await;
    let ids: Vec<i64> = received.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![2, 3]);
    assert_eq!(received[1].1["message"], "message 2");

    h.container.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_redelivers_unread_event() {
    let h = harness().await;
    let subscriber = Uuid::new_v4();
    store_credential(&h, subscriber, "channel", 3600).await;
    for n in 0..2 {
        h.container
            .events
            .append(&NewEvent::chat(
                "channel",
                "viewer",
                "Viewer",
                format!("message {n}"),
                Utc::now(),
            ))
            .await
            .unwrap();
    }
    let uri = format!("/api/v1/events?subscriber={subscriber}");

    // The client disconnects right after the first event.
    let response = h
        .api
        .clone()
        .oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let mut body = response.into_body().into_data_stream();
    assert_eq!(read_events(&mut body, 1).await[0].0, 1);
    drop(body);

    let response = h
        .api
        .clone()
        .oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let mut body = response.into_body().into_data_stream();
    let ids: Vec<i64> = read_events(&mut body, 2)
        .await
        .iter()
        .map(|(id, _)| *id)
        .collect();
    assert_eq!(ids, vec![1, 2]);

    h.container.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_health_reports_sessions() {
    let h = harness().await;
    let (status, body) = send(&h.api, Method::GET, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["active_sessions"], 0);

    h.container.shutdown().await.unwrap();
    let response = h
        .api
        .clone()
        .oneshot(Request::builder().uri("/health/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
