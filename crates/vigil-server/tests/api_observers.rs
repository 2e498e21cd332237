use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use vigil_engine::EngineSettings;
use vigil_server::{app, AppState};
use vigil_types::{NotificationKind, NotificationMessage};

struct TestServer {
    _dir: tempfile::TempDir,
    pool: vigil_db::DbPool,
    state: AppState,
    app: Router,
}

fn setup() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vigil.db");
    let pool = vigil_db::create_pool(path.to_str().unwrap(), vigil_db::DbRuntimeSettings::default())
        .unwrap();
    {
        let conn = pool.get().unwrap();
        conn.execute_batch(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, title TEXT NOT NULL);
             INSERT INTO items (id, title) VALUES (1, 'alpha'), (2, 'beta');",
        )
        .unwrap();
    }

    let settings = EngineSettings {
        throttle_ms: 20,
        workers: 2,
        index_refresh_ms: 0,
        ..EngineSettings::default()
    };
    let state = AppState::start(pool.clone(), settings).unwrap();
    TestServer {
        _dir: dir,
        pool,
        app: app(state.clone()),
        state,
    }
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).unwrap())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn subscribe_body(subscriber_id: &str) -> Value {
    json!({
        "subscriber_id": subscriber_id,
        "query": {
            "relation": "items",
            "order_by": [{"column": "id", "descending": false}]
        }
    })
}

async fn next_message(
    rx: &mut tokio::sync::broadcast::Receiver<Arc<NotificationMessage>>,
) -> Arc<NotificationMessage> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a notification")
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_check_returns_ok() {
    let server = setup();
    let (status, json) = send(&server.app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribe_streams_initial_results() {
    let server = setup();
    let mut rx = server.state.hub.subscribe("sub-1");

    let (status, json) = send(&server.app, "POST", "/api/observers", Some(subscribe_body("sub-1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["created"], true);
    assert_eq!(json["seq"], 0);
    assert_eq!(json["fingerprint"].as_str().unwrap().len(), 64);

    let msg = next_message(&mut rx).await;
    assert_eq!(msg.kind, NotificationKind::Added);
    assert_eq!(msg.items.len(), 2);
    assert_eq!(msg.fingerprint.as_str(), json["fingerprint"].as_str().unwrap());

    // A second subscribe of the same query shares the observer.
    let (status, again) = send(&server.app, "POST", "/api/observers", Some(subscribe_body("sub-2"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["created"], false);
    assert_eq!(again["fingerprint"], json["fingerprint"]);
    assert_eq!(again["items"].as_array().unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ingested_change_reaches_the_stream() {
    let server = setup();
    let mut rx = server.state.hub.subscribe("sub-1");
    send(&server.app, "POST", "/api/observers", Some(subscribe_body("sub-1"))).await;
    next_message(&mut rx).await;

    {
        let conn = server.pool.get().unwrap();
        conn.execute("UPDATE items SET title = 'gamma' WHERE id = 2", [])
            .unwrap();
    }
    let (status, _) = send(
        &server.app,
        "POST",
        "/api/changes",
        Some(json!({"table": "items", "operation": "update", "affected_keys": ["2"]})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let msg = next_message(&mut rx).await;
    assert_eq!(msg.kind, NotificationKind::Changed);
    assert_eq!(msg.items[0].id, "2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_requests_are_rejected() {
    let server = setup();

    let (status, json) = send(&server.app, "POST", "/api/observers", Some(subscribe_body(""))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("subscriber"));

    let bad_query = json!({"subscriber_id": "sub-1", "query": {"relation": "items; DROP TABLE items"}});
    let (status, _) = send(&server.app, "POST", "/api/observers", Some(bad_query)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &server.app,
        "POST",
        "/api/changes",
        Some(json!({"table": " ", "operation": "insert"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let unknown = "00".repeat(32);
    let (status, _) = send(&server.app, "POST", &format!("/api/observers/{unknown}/reset"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(
        &server.app,
        "DELETE",
        &format!("/api/observers/{unknown}/subscribers/sub-1"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_lists_observers_and_stats() {
    let server = setup();
    let mut rx = server.state.hub.subscribe("sub-1");
    let (_, subscribed) = send(&server.app, "POST", "/api/observers", Some(subscribe_body("sub-1"))).await;
    next_message(&mut rx).await;

    let (status, json) = send(&server.app, "GET", "/api/observers", None).await;
    assert_eq!(status, StatusCode::OK);
    let observers = json["observers"].as_array().unwrap();
    assert_eq!(observers.len(), 1);
    assert_eq!(observers[0]["fingerprint"], subscribed["fingerprint"]);
    assert_eq!(observers[0]["subscriber_count"], 1);
    assert_eq!(observers[0]["dependencies"], json!(["items"]));
    assert!(json["stats"]["evaluations"].as_u64().unwrap() >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsubscribe_then_reclaim() {
    let server = setup();
    let (_, subscribed) = send(&server.app, "POST", "/api/observers", Some(subscribe_body("sub-1"))).await;
    let fingerprint = subscribed["fingerprint"].as_str().unwrap().to_string();

    let uri = format!("/api/observers/{fingerprint}/subscribers/sub-1");
    let (status, _) = send(&server.app, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&server.app, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Wait out any evaluation still holding the lease.
    let mut reclaimed = 0;
    for _ in 0..50 {
        let (_, json) = send(&server.app, "POST", "/api/admin/reclaim", None).await;
        reclaimed += json["reclaimed"].as_u64().unwrap();
        if reclaimed > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(reclaimed, 1);

    let (_, json) = send(&server.app, "GET", "/api/observers", None).await;
    assert!(json["observers"].as_array().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removing_a_subscriber_and_clearing() {
    let server = setup();
    send(&server.app, "POST", "/api/observers", Some(subscribe_body("sub-1"))).await;
    send(&server.app, "POST", "/api/observers", Some(subscribe_body("sub-2"))).await;

    let (status, _) = send(&server.app, "DELETE", "/api/subscribers/sub-1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&server.app, "DELETE", "/api/subscribers/sub-1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, report) = send(&server.app, "POST", "/api/admin/clear", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report, json!({"observers": 1, "subscribers": 1}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_recovers_a_failed_observer() {
    let server = setup();
    let mut rx = server.state.hub.subscribe("sub-1");
    let body = json!({"subscriber_id": "sub-1", "query": {"relation": "missing"}});
    let (_, subscribed) = send(&server.app, "POST", "/api/observers", Some(body)).await;
    let fingerprint = subscribed["fingerprint"].as_str().unwrap().to_string();

    let msg = next_message(&mut rx).await;
    assert_eq!(msg.kind, NotificationKind::Error);

    let uri = format!("/api/observers/{fingerprint}/reset");
    let (status, _) = send(&server.app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Still failing, so the reset evaluation halts it again.
    let msg = next_message(&mut rx).await;
    assert_eq!(msg.kind, NotificationKind::Error);
    let (status, json) = send(&server.app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT, "{json}");
}
