mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use common::*;
use gateway::engine::{ExecutionState, ExecutionStatus};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

fn farm_devices() -> InMemoryDevices {
    let mut devices = HashMap::new();
    devices.insert(
        "f1".to_string(),
        vec![
            device("d1", "f1", "MOISTURE"),
            device("d2", "f1", "TEMPERATURE"),
        ],
    );
    InMemoryDevices { devices }
}

fn moisture_rows() -> Vec<gateway::engine::ResultRow> {
    vec![
        row(&[Some("device_id"), Some("timestamp"), Some("moisture")]),
        row(&[Some("d1"), Some("2024-03-15T20:55:27.966Z"), Some("100")]),
        row(&[Some("d1"), Some("garbage"), Some("99")]),
        row(&[Some("d1"), Some("2024-03-15T21:55:27.966Z"), Some("97.5")]),
    ]
}

async fn get(app: axum::Router, uri: &str, bearer: Option<String>) -> (StatusCode, Value) {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    let response = app
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_missing_token_is_unauthenticated() {
    let engine = Arc::new(ScriptedEngine::succeeding(vec![]));
    let app = app(InMemoryGrants::default(), farm_devices(), engine);

    let (status, body) = get(app, "/api/v1/farms/f1/devices", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("authorization"));
}

#[tokio::test]
async fn test_admin_lists_every_device() {
    let engine = Arc::new(ScriptedEngine::succeeding(vec![]));
    let app = app(InMemoryGrants::default(), farm_devices(), engine);

    let (status, body) = get(
        app,
        "/api/v1/farms/f1/devices",
        Some(token("admin-1", &["farmAdmin"])),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let devices = body.as_array().unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0]["id"], "d1");
    assert_eq!(devices[0]["type"], "MOISTURE");
    assert_eq!(devices[0]["devEui"], "eui-d1");
    assert_eq!(devices[1]["type"], "TEMPERATURE");
}

#[tokio::test]
async fn test_temporary_lists_only_granted_devices() {
    let grants = InMemoryGrants {
        grants: vec![grant("u1", "f1", &["moisture"], &["d2"], 2)],
    };
    let engine = Arc::new(ScriptedEngine::succeeding(vec![]));
    let app = app(grants, farm_devices(), engine);

    let (status, body) = get(
        app,
        "/api/v1/farms/f1/devices",
        Some(token("u1", &["tempViewer"])),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["d2"]);
}

#[tokio::test]
async fn test_unknown_role_lists_nothing() {
    let grants = InMemoryGrants {
        grants: vec![grant("u1", "f1", &["moisture"], &[], 2)],
    };
    let engine = Arc::new(ScriptedEngine::succeeding(vec![]));
    let app = app(grants, farm_devices(), engine);

    let (status, body) = get(
        app,
        "/api/v1/farms/f1/devices",
        Some(token("u1", &["everyone"])),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_temporary_series_for_granted_dataset() {
    let grants = InMemoryGrants {
        grants: vec![grant("u1", "f1", &["moisture"], &[], 2)],
    };
    let engine = Arc::new(ScriptedEngine::new(
        vec![
            ExecutionStatus::new(ExecutionState::Queued),
            ExecutionStatus::new(ExecutionState::Running),
            ExecutionStatus::new(ExecutionState::Succeeded),
        ],
        moisture_rows(),
    ));
    let app = app(grants, farm_devices(), Arc::clone(&engine));

    let (status, body) = get(
        app,
        "/api/v1/farms/f1/devices/d1/series?dataset=moisture&from=2024-03-15T00:00:00Z",
        Some(token("u1", &["tempViewer"])),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let series = body.as_array().unwrap();
    assert_eq!(series.len(), 1);
    assert_eq!(series[0]["deviceId"], "d1");
    let points = series[0]["points"].as_array().unwrap();
    assert_eq!(points.len(), 2);
    assert_eq!(points[0]["value"], 100.0);
    assert_eq!(points[1]["value"], 97.5);
    assert_eq!(engine.submissions(), 1);
}

#[tokio::test]
async fn test_temporary_ungranted_dataset_is_empty_without_fetch() {
    let grants = InMemoryGrants {
        grants: vec![grant("u1", "f1", &["moisture"], &[], 2)],
    };
    let engine = Arc::new(ScriptedEngine::succeeding(moisture_rows()));
    let app = app(grants, farm_devices(), Arc::clone(&engine));

    let (status, body) = get(
        app,
        "/api/v1/farms/f1/devices/d1/series?dataset=temperature",
        Some(token("u1", &["tempViewer"])),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body[0]["points"].as_array().unwrap().is_empty());
    assert_eq!(engine.submissions(), 0);
}

#[tokio::test]
async fn test_device_outside_grant_is_forbidden() {
    let grants = InMemoryGrants {
        grants: vec![grant("u1", "f1", &["moisture"], &["d1"], 2)],
    };
    let engine = Arc::new(ScriptedEngine::succeeding(moisture_rows()));
    let app = app(grants, farm_devices(), Arc::clone(&engine));

    let (status, body) = get(
        app,
        "/api/v1/farms/f1/devices/d2/series?dataset=moisture",
        Some(token("u1", &["tempViewer"])),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["error"].as_str().unwrap().contains("d2"));
    assert_eq!(engine.submissions(), 0);
}

#[tokio::test]
async fn test_expired_grant_behaves_like_no_grant() {
    let grants = InMemoryGrants {
        grants: vec![grant("u1", "f1", &["moisture"], &["d1"], -1)],
    };
    let engine = Arc::new(ScriptedEngine::succeeding(moisture_rows()));
    let app = app(grants, farm_devices(), Arc::clone(&engine));

    let (status, body) = get(
        app,
        "/api/v1/farms/f1/devices/d1/series?dataset=moisture",
        Some(token("u1", &["tempViewer"])),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body[0]["points"].as_array().unwrap().is_empty());
    assert_eq!(engine.submissions(), 0);
}

#[tokio::test]
async fn test_failed_execution_maps_to_bad_gateway() {
    let engine = Arc::new(ScriptedEngine::new(
        vec![ExecutionStatus::with_reason(
            ExecutionState::Failed,
            "INSUFFICIENT_PRIVILEGES",
        )],
        vec![],
    ));
    let app = app(InMemoryGrants::default(), farm_devices(), engine);

    let (status, body) = get(
        app,
        "/api/v1/farms/f1/devices/d1/series",
        Some(token("admin-1", &["farmAdmin"])),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let message = body["error"].as_str().unwrap();
    assert!(message.contains("INSUFFICIENT_PRIVILEGES"));
    assert!(message.contains("exec-1"));
}

#[tokio::test]
async fn test_stuck_execution_maps_to_gateway_timeout() {
    let engine = Arc::new(ScriptedEngine::new(
        vec![ExecutionStatus::new(ExecutionState::Running)],
        vec![],
    ));
    let app = app(InMemoryGrants::default(), farm_devices(), engine);

    let (status, _) = get(
        app,
        "/api/v1/farms/f1/devices/d1/series?dataset=moisture",
        Some(token("admin-1", &["farmAdmin"])),
    )
    .await;

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn test_repeated_fetch_is_identical() {
    let engine = Arc::new(ScriptedEngine::succeeding(moisture_rows()));
    let app = app(InMemoryGrants::default(), farm_devices(), engine);
    let uri = "/api/v1/farms/f1/devices/d1/series?dataset=moisture";

    let (_, first) = get(app.clone(), uri, Some(token("admin-1", &["farmAdmin"]))).await;
    let (_, second) = get(app, uri, Some(token("admin-1", &["farmAdmin"]))).await;

    assert_eq!(first, second);
    assert_eq!(first[0]["points"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_unparseable_range_is_json_bad_request() {
    let engine = Arc::new(ScriptedEngine::succeeding(moisture_rows()));
    let app = app(InMemoryGrants::default(), farm_devices(), Arc::clone(&engine));

    let (status, body) = get(
        app,
        "/api/v1/farms/f1/devices/d1/series?dataset=moisture&from=yesterday",
        Some(token("admin-1", &["farmAdmin"])),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
    assert_eq!(engine.submissions(), 0);
}

#[tokio::test]
async fn test_stuck_execution_is_released() {
    let engine = Arc::new(ScriptedEngine::new(
        vec![ExecutionStatus::new(ExecutionState::Running)],
        vec![],
    ));
    let app = app(InMemoryGrants::default(), farm_devices(), Arc::clone(&engine));

    let (status, _) = get(
        app,
        "/api/v1/farms/f1/devices/d1/series?dataset=moisture",
        Some(token("admin-1", &["farmAdmin"])),
    )
    .await;

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(engine.forgotten(), 1);
}
