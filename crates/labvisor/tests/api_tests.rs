//! API integration tests.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;

use labvisor::api::{AppState, create_router};
use labvisor::config::PortRange;

mod common;
use common::{FakeDriver, fake_registry, registry_with, test_config};

fn test_app() -> Router {
    let (registry, _driver) = fake_registry();
    create_router(AppState::new(registry))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().uri(uri).method(method);
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_string(&value).unwrap())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn start_body(user: &str, kind: &str, preset: &str) -> Value {
    json!({ "user_id": user, "kind": kind, "preset": preset })
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app();
    let (status, json) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert_eq!(json["backends"], json!(["container"]));
    assert_eq!(json["default_backend"], "container");
}

#[tokio::test]
async fn test_create_is_idempotent() {
    let app = test_app();
    let body = start_body("u1", "ephemeral_lab", "minimal");

    let (status, created) = send(&app, Method::POST, "/sessions", Some(body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["state"], "running");
    assert_eq!(created["kind"], "ephemeral_lab");
    assert!(created["access"]["password"].is_string());

    let (status, again) = send(&app, Method::POST, "/sessions", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["id"], created["id"]);
}

#[tokio::test]
async fn test_stop_and_status() {
    let app = test_app();
    let (_, created) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(start_body("u1", "ephemeral_lab", "minimal")),
    )
    .await;
    let id = created["id"].as_str().unwrap();

    let (status, fetched) = send(&app, Method::GET, &format!("/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["state"], "running");

    let (status, stopped) = send(&app, Method::DELETE, &format!("/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stopped["state"], "terminated");
    assert!(stopped["access"].is_null());

    let (_, fetched) = send(&app, Method::GET, &format!("/sessions/{id}"), None).await;
    assert_eq!(fetched["state"], "terminated");

    let (status, _) = send(
        &app,
        Method::DELETE,
        &format!("/sessions/{id}?reason=bogus"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_errors_have_codes() {
    let app = test_app();

    let (status, json) = send(&app, Method::GET, "/sessions/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");
    assert!(json["error"].as_str().unwrap().contains("missing"));

    let (status, json) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(start_body("u1", "ephemeral_lab", "no-such-preset")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_exhaustion_is_service_unavailable() {
    let mut config = test_config();
    config.ports.ssh = PortRange::new(10000, 10000);
    let registry = registry_with(config, Arc::new(FakeDriver::new()));
    let app = create_router(AppState::new(registry));

    let (status, _) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(start_body("u1", "ephemeral_lab", "minimal")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, json) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(start_body("u2", "ephemeral_lab", "minimal")),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["code"], "RESOURCES_EXHAUSTED");
}

#[tokio::test]
async fn test_backend_failures_hide_runtime_output() {
    let driver = Arc::new(FakeDriver::new());
    let registry = registry_with(test_config(), Arc::clone(&driver));
    let app = create_router(AppState::new(registry));
    driver.fail_next_start(
        "docker: Error response from daemon: Conflict. The container name \"/lab-s1-3f2a9c01\" is already in use by container \"9a8b7c\"",
    );

    let (status, json) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(start_body("u1", "ephemeral_lab", "minimal")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(json["code"], "BACKEND_ERROR");
    let message = json["error"].as_str().unwrap();
    assert!(!message.contains("daemon"));
    assert!(!message.contains("lab-s1-3f2a9c01"));
    assert!(!message.contains("9a8b7c"));
}

#[tokio::test]
async fn test_touch_and_list() {
    let app = test_app();
    let (_, created) = send(
        &app,
        Method::POST,
        "/sessions",
        Some(start_body("u1", "persistent_terminal", "minimal")),
    )
    .await;
    let id = created["id"].as_str().unwrap();

    let (status, touched) =
        send(&app, Method::POST, &format!("/sessions/{id}/touch"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(touched["expires_at"], created["expires_at"]);

    let (status, extended) = send(
        &app,
        Method::POST,
        &format!("/sessions/{id}/touch"),
        Some(json!({ "extend_minutes": 15 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(extended["expires_at"], created["expires_at"]);

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/sessions/{id}/touch"),
        Some(json!({ "extend_minutes": 10000 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    send(
        &app,
        Method::POST,
        "/sessions",
        Some(start_body("u2", "ephemeral_lab", "minimal")),
    )
    .await;
    let (_, all) = send(&app, Method::GET, "/sessions", None).await;
    assert_eq!(all.as_array().unwrap().len(), 2);
    let (_, mine) = send(&app, Method::GET, "/sessions?user_id=u1", None).await;
    assert_eq!(mine.as_array().unwrap().len(), 1);
    assert_eq!(mine[0]["id"], created["id"]);
}

#[tokio::test]
async fn test_verification_endpoints() {
    let app = test_app();
    let mut body = start_body("u1", "ephemeral_lab", "minimal");
    body["overrides"] = json!({
        "flags": [{ "id": "root", "value": "FLAG{r00t}" }]
    });
    let (_, created) = send(&app, Method::POST, "/sessions", Some(body)).await;
    let id = created["id"].as_str().unwrap();

    let (status, commands) =
        send(&app, Method::GET, &format!("/sessions/{id}/commands"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(commands["commands"], json!([]));

    let (status, outcome) = send(
        &app,
        Method::POST,
        &format!("/sessions/{id}/verify"),
        Some(json!({ "rule": { "type": "regex", "pattern": "^nmap" } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["passed"], false);

    let (status, json) = send(
        &app,
        Method::POST,
        &format!("/sessions/{id}/verify"),
        Some(json!({ "rule": { "type": "regex", "pattern": "(" } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "INVALID_REQUEST");

    let (status, result) = send(
        &app,
        Method::POST,
        &format!("/sessions/{id}/flags"),
        Some(json!({ "flag": "FLAG{r00t}" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["correct"], true);
    assert_eq!(result["points_awarded"], 100);

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/sessions/{id}/flags"),
        Some(json!({ "flag": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
