use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use staff_dispatch::auth::StaticTokenVerifier;
use staff_dispatch::engine::Engine;
use staff_dispatch::http::{AppState, router};
use staff_dispatch::notify::{LogTransport, NotificationQueue, QueueSettings};
use staff_dispatch::outbox::Outbox;

const ADMIN: &str = "admin-token";
const USER: &str = "user-token";

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("staff_dispatch_test_http");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn app(name: &str) -> Router {
    let verifier = StaticTokenVerifier::new()
        .with_token(ADMIN, "dispatcher", "admin")
        .with_token(USER, "viewer", "user");
    router(AppState {
        engine: Arc::new(Engine::new(test_wal_path(name)).unwrap()),
        notifications: Arc::new(NotificationQueue::start(
            QueueSettings::default(),
            Arc::new(LogTransport),
            Outbox::open(&test_wal_path(&format!("{name}.outbox"))).unwrap(),
        )),
        verifier: Arc::new(verifier),
    })
}

async fn send(app: &Router, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        req = req.header("authorization", format!("Bearer {token}"));
    }
    let req = match body {
        Some(body) => req
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => req.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn add_staff_route(app: &Router, staff: Uuid, route: Uuid) {
    let (status, body) = send(
        app,
        "POST",
        "/staff_routes",
        Some(ADMIN),
        Some(json!({
            "staff_id": staff,
            "route_id": route,
            "full_name": "Nguyen Van A",
            "role": "driver",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
}

fn assignment(staff: Uuid, route: Uuid, start: &str, end: &str) -> Value {
    json!({
        "staff_id": staff,
        "trip_id": Uuid::new_v4(),
        "route_id": route,
        "assigned_at": format!("2025-03-01T{start}:00Z"),
        "expected_end_time": format!("2025-03-01T{end}:00Z"),
        "from_location": "Mien Dong",
        "to_location": "Vung Tau",
    })
}

fn window(staff: Uuid, start: &str, end: &str) -> Value {
    json!({
        "staff_id": staff,
        "start_time": format!("2025-03-01T{start}:00Z"),
        "end_time": format!("2025-03-01T{end}:00Z"),
    })
}

#[tokio::test]
async fn dispatcher_day_over_http() {
    let app = app("day.wal");
    let (staff, route) = (Uuid::new_v4(), Uuid::new_v4());
    add_staff_route(&app, staff, route).await;

    let (status, body) = send(&app, "POST", "/dispatch", Some(ADMIN), Some(assignment(staff, route, "09:00", "12:00"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "scheduled");
    assert!(body["error"].is_null());

    let (status, body) = send(&app, "POST", "/dispatch", Some(ADMIN), Some(assignment(staff, route, "11:00", "13:00"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["data"].is_null());
    assert!(body["error"].as_str().unwrap().contains("overlapping assignment"));

    let (status, _) = send(&app, "POST", "/dispatch", Some(ADMIN), Some(assignment(staff, route, "12:00", "14:00"))).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app, "POST", "/unavailability", Some(ADMIN), Some(window(staff, "13:00", "15:00"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, _) = send(&app, "POST", "/unavailability", Some(ADMIN), Some(window(staff, "14:00", "16:00"))).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app, "GET", &format!("/dispatch/{staff}"), Some(USER), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    let (status, body) = send(&app, "GET", &format!("/dispatch/{staff}/latest"), Some(USER), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["assigned_at"], "2025-03-01T12:00:00Z");

    let (status, body) = send(&app, "GET", &format!("/unavailability/{staff}"), Some(USER), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn invalid_interval_is_400_with_reason() {
    let app = app("invalid_interval.wal");
    let (staff, route) = (Uuid::new_v4(), Uuid::new_v4());
    add_staff_route(&app, staff, route).await;

    let (status, body) = send(&app, "POST", "/dispatch", Some(ADMIN), Some(assignment(staff, route, "12:00", "09:00"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "expected_end_time must be after assigned_at");
}

#[tokio::test]
async fn malformed_json_is_400_envelope() {
    let app = app("malformed.wal");
    let (status, body) = send(&app, "POST", "/dispatch", Some(ADMIN), Some(json!({"staff_id": "not-a-uuid"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn auth_is_enforced() {
    let app = app("auth.wal");
    let (staff, route) = (Uuid::new_v4(), Uuid::new_v4());

    let (status, body) = send(&app, "GET", "/dispatch", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);

    let (status, _) = send(&app, "GET", "/dispatch", Some("forged"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, "POST", "/dispatch", Some(USER), Some(assignment(staff, route, "09:00", "10:00"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&app, "GET", "/dispatch", Some(USER), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn staff_route_lifecycle() {
    let app = app("staff_routes.wal");
    let (staff, route) = (Uuid::new_v4(), Uuid::new_v4());

    let (status, _) = send(&app, "GET", "/staff_routes", Some(USER), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, "GET", &format!("/staff_routes/{staff}"), Some(USER), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    add_staff_route(&app, staff, route).await;

    let (status, body) = send(&app, "GET", &format!("/staff_routes/{staff}"), Some(USER), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["is_active"], true);

    let (status, body) = send(&app, "GET", &format!("/staff_routes/by_route/{route}"), Some(USER), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let uri = format!("/staff_routes/{staff}/{route}");
    let (status, body) = send(&app, "PUT", &uri, Some(ADMIN), Some(json!({"role": "conductor"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["role"], "conductor");

    let (status, body) = send(&app, "POST", &format!("{uri}/toggle"), Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_active"], false);

    // Inactive: dispatch refused.
    let (status, body) = send(&app, "POST", "/dispatch", Some(ADMIN), Some(assignment(staff, route, "09:00", "10:00"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("not eligible"));

    let (status, _) = send(&app, "DELETE", &uri, Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, "DELETE", &uri, Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, "PUT", &uri, Some(ADMIN), Some(json!({"is_active": true}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn duplicate_staff_route_is_400() {
    let app = app("dup_route.wal");
    let (staff, route) = (Uuid::new_v4(), Uuid::new_v4());
    add_staff_route(&app, staff, route).await;

    let (status, body) = send(
        &app,
        "POST",
        "/staff_routes",
        Some(ADMIN),
        Some(json!({"staff_id": staff, "route_id": route, "full_name": "X", "role": "driver"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("already exists"));
}

#[tokio::test]
async fn delete_and_status_endpoints() {
    let app = app("delete_status.wal");
    let (staff, route) = (Uuid::new_v4(), Uuid::new_v4());
    add_staff_route(&app, staff, route).await;

    let (_, body) = send(&app, "POST", "/dispatch", Some(ADMIN), Some(assignment(staff, route, "09:00", "12:00"))).await;
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, "PUT", &format!("/dispatch/{id}/status"), Some(ADMIN), Some(json!({"status": "completed"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("scheduled -> completed"));

    let (status, body) = send(&app, "PUT", &format!("/dispatch/{id}/status"), Some(ADMIN), Some(json!({"status": "in_progress"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "in_progress");

    let (status, _) = send(&app, "PUT", &format!("/dispatch/{id}/status"), Some(ADMIN), Some(json!({"status": "paused"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "DELETE", &format!("/dispatch/{id}"), Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&app, "DELETE", &format!("/dispatch/{id}"), Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);

    let (status, _) = send(&app, "GET", &format!("/dispatch/{staff}/latest"), Some(USER), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "DELETE", "/dispatch/not-a-uuid", Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn assignment_by_id() {
    let app = app("by_id.wal");
    let (staff, route) = (Uuid::new_v4(), Uuid::new_v4());
    add_staff_route(&app, staff, route).await;

    let (_, created) = send(&app, "POST", "/dispatch", Some(ADMIN), Some(assignment(staff, route, "09:00", "12:00"))).await;
    let id = created["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, "GET", &format!("/dispatch/assignment/{id}"), Some(USER), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], created["data"]);

    let (status, _) = send(&app, "GET", &format!("/dispatch/assignment/{id}"), None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&app, "GET", &format!("/dispatch/assignment/{}", Uuid::new_v4()), Some(USER), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);

    let (status, _) = send(&app, "GET", "/dispatch/assignment/not-a-uuid", Some(USER), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Staff listing on the neighbouring route is unaffected.
    let (status, body) = send(&app, "GET", &format!("/dispatch/{staff}"), Some(USER), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn reset_password_always_answers_200() {
    let app = app("reset.wal");

    let (status, body) = send(
        &app,
        "POST",
        "/send-reset-password",
        None,
        Some(json!({"email": "rider@example.com", "otp": "123456"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "email is being sent");

    let (status, body) = send(
        &app,
        "POST",
        "/send-reset-password",
        None,
        Some(json!({"email": "nobody", "otp": "123456"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].as_str().unwrap().starts_with("could not send email"));
}
