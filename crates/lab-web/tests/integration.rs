//! Integration tests for lab-web
//!
//! Drives the router end to end against scripted collaborators:
//! - Stack lifecycle and conflict handling
//! - Per-service actions
//! - Diagnosis session flow
//! - Log history queries and the event stream

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use futures::StreamExt;
use lab_core::testing::{MockAiEngine, MockBackend, ScriptedTurn};
use lab_core::{StackContext, StackRegistry, StackSettings, parse_line};
use lab_web::{AppState, Config, create_app_with_state};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct TestServer {
    app: Router,
    state: AppState,
    backend: MockBackend,
    engine: MockAiEngine,
}

impl TestServer {
    fn new() -> Self {
        let backend = MockBackend::with_stopped(&["api", "db"]);
        let engine = MockAiEngine::new("mock", vec![ScriptedTurn::answer("db is down")]);

        let mut registry = StackRegistry::new();
        registry.insert(StackContext::new(
            "shop",
            Arc::new(backend.clone()),
            vec![Arc::new(engine.clone())],
            StackSettings::default(),
        ));
        let state = AppState::new(registry);
        let app = create_app_with_state(&Config::default(), state.clone());

        Self {
            app,
            state,
            backend,
            engine,
        }
    }

    fn stack(&self) -> &StackContext {
        self.state.stacks.get("shop").unwrap()
    }

    async fn request(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, value)
    }
}

// ==================== Server Tests ====================

#[tokio::test]
async fn test_health_and_stack_list() {
    let server = TestServer::new();

    let (status, body) = server.request("GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = server.request("GET", "/api/stacks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!(["shop"]));
}

#[tokio::test]
async fn test_unknown_stack_is_404() {
    let server = TestServer::new();
    let (status, body) = server.request("GET", "/api/stacks/nope/status", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Stack not found: nope");
}

#[tokio::test]
async fn test_static_dir_falls_back_to_index() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<html>lab</html>").unwrap();

    let config = Config {
        static_dir: Some(dir.path().to_path_buf()),
        ..Config::default()
    };
    let app = create_app_with_state(&config, TestServer::new().state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/stacks/shop")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"<html>lab</html>");
}

// ==================== Lifecycle Tests ====================

#[tokio::test]
async fn test_status_of_stopped_stack() {
    let server = TestServer::new();
    let (status, body) = server.request("GET", "/api/stacks/shop/status", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopped");
    assert_eq!(body["running"], 0);
    assert_eq!(body["total"], 2);
}

#[tokio::test]
async fn test_up_conflicts_while_starting_then_cancel() {
    let server = TestServer::new();
    server.backend.set_up_delay(Duration::from_secs(30));

    let (status, body) = server.request("POST", "/api/stacks/shop/up", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "starting");

    let (status, _) = server.request("POST", "/api/stacks/shop/up", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = server.request("POST", "/api/stacks/shop/down", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = server.request("POST", "/api/stacks/shop/cancel", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopping");

    // Cancel only applies while starting
    let (status, _) = server.request("POST", "/api/stacks/shop/cancel", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_up_rejected_when_services_running() {
    let server = TestServer::new();
    server.backend.set_running("db", true);

    let (status, body) = server.request("POST", "/api/stacks/shop/up", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("running"));
}

#[tokio::test]
async fn test_down_and_restart_accepted_when_idle() {
    let server = TestServer::new();

    let (status, body) = server.request("POST", "/api/stacks/shop/down", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopping");

    for _ in 0..100 {
        if server.stack().controller().lifecycle_status() == lab_core::LifecycleStatus::Idle {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (status, body) = server.request("POST", "/api/stacks/shop/restart", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopping");
}

// ==================== Service Tests ====================

#[tokio::test]
async fn test_service_actions() {
    let server = TestServer::new();

    let (status, _) = server
        .request("POST", "/api/stacks/shop/services/api/restart", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(server.backend.calls().contains(&"restart:api".to_string()));

    let (status, body) = server
        .request("POST", "/api/stacks/shop/services/api/explode", None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "unknown service action: explode");

    let (status, _) = server
        .request("POST", "/api/stacks/shop/services/ghost/start", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_services_list_and_failure() {
    let server = TestServer::new();

    let (status, body) = server.request("GET", "/api/stacks/shop/services", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);
    assert_eq!(body[0]["name"], "api");

    server.backend.fail_get_services("compose unavailable");
    let (status, body) = server.request("GET", "/api/stacks/shop/services", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "compose unavailable");
}

#[tokio::test]
async fn test_health_snapshot_starts_empty() {
    let server = TestServer::new();
    let (status, body) = server.request("GET", "/api/stacks/shop/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));
}

// ==================== Log Tests ====================

#[tokio::test]
async fn test_log_history_filters_and_limits() {
    let server = TestServer::new();
    let history = server.stack().history();
    history.push(parse_line("api", "[INFO][2024-01-01T00:00:00Z] one"));
    history.push(parse_line("db", "[WARN][2024-01-01T00:00:01Z] two"));
    history.push(parse_line("api", "[ERROR][2024-01-01T00:00:02Z] three"));

    let (status, body) = server.request("GET", "/api/stacks/shop/logs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 3);

    let (_, body) = server
        .request("GET", "/api/stacks/shop/logs?service=api&limit=1", None)
        .await;
    let lines = body.as_array().unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["message"], "three");
    assert_eq!(lines[0]["level"], "ERROR");
}

// ==================== Diagnosis Tests ====================

#[tokio::test]
async fn test_diagnosis_session_flow() {
    let server = TestServer::new();
    server.engine.push_turn(ScriptedTurn::answer("check the volume"));

    let (status, started) = server
        .request(
            "POST",
            "/api/stacks/shop/diagnose",
            Some(json!({"service": "db"})),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(started["provider"], "mock");
    let session_id = started["sessionId"].as_str().unwrap().to_string();
    assert!(started["requestId"].is_string());

    let (status, body) = server.request("GET", "/api/stacks/shop/diagnose", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["sessionId"], session_id.as_str());
    assert_eq!(body[0]["service"], "db");

    let (status, follow_up) = server
        .request(
            "POST",
            &format!("/api/stacks/shop/diagnose/{session_id}/message"),
            Some(json!({"message": "what next?"})),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(follow_up["sessionId"], session_id.as_str());
    assert_ne!(follow_up["requestId"], started["requestId"]);

    let (status, body) = server
        .request(
            "POST",
            &format!("/api/stacks/shop/diagnose/{session_id}/interrupt"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "interrupted");

    let (status, body) = server
        .request(
            "DELETE",
            &format!("/api/stacks/shop/diagnose/{session_id}"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "closed", "sessionId": session_id}));

    let (status, _) = server
        .request(
            "DELETE",
            &format!("/api/stacks/shop/diagnose/{session_id}"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_diagnosis_validation_errors() {
    let server = TestServer::new();

    let (status, _) = server
        .request("POST", "/api/stacks/shop/diagnose", Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server
        .request(
            "POST",
            "/api/stacks/shop/diagnose",
            Some(json!({"service": "ghost"})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = server
        .request(
            "POST",
            "/api/stacks/shop/diagnose",
            Some(json!({"service": "api", "provider": "gemini"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server
        .request(
            "POST",
            "/api/stacks/shop/diagnose/missing/message",
            Some(json!({"message": "hello"})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    server.engine.set_available(false);
    let (status, body) = server
        .request(
            "POST",
            "/api/stacks/shop/diagnose",
            Some(json!({"service": "api"})),
        )
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "provider 'mock' is not available");
}

// ==================== Event Stream Tests ====================

#[tokio::test]
async fn test_event_stream_greets_then_forwards_broadcasts() {
    let server = TestServer::new();

    let response = server
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/stacks/shop/events")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );

    let mut body = response.into_body().into_data_stream();
    let first = tokio::time::timeout(Duration::from_secs(5), body.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let first = String::from_utf8(first.to_vec()).unwrap();
    assert!(first.contains("event: connected"));
    assert!(first.contains("clientId"));

    // Registered for as long as the response body is alive
    assert_eq!(server.stack().hub().client_count(), 1);
    server
        .stack()
        .hub()
        .broadcast("service_action", &json!({"service": "api"}));

    let next = tokio::time::timeout(Duration::from_secs(5), body.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let next = String::from_utf8(next.to_vec()).unwrap();
    assert!(next.contains("event: service_action"));
    assert!(next.contains(r#"data: {"service":"api"}"#));

    drop(body);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.stack().hub().client_count(), 0);
}
