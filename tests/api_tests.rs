//! Edge validation: operational errors are rejected with 4xx before a
//! queue row exists. These tests drive the router directly; no simulators
//! or executor are running, so rows stay PENDING.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use std::sync::Arc;
use stf_twin::api::{router, AppState};
use stf_twin::model::*;
use stf_twin::{
    BroadcastHub, BusAdapter, InProcBroker, MemoryStore, SafetyHandle, SharedStore, TwinConfig,
};
use tower::ServiceExt;

async fn edge(seed_demo: bool) -> (axum::Router, SharedStore) {
    let cfg = Arc::new(TwinConfig::default());
    let memory = MemoryStore::new();
    if seed_demo {
        memory.seed_demo_inventory().await;
    }
    let store: SharedStore = Arc::new(memory);
    let broker = InProcBroker::new();
    let state = AppState {
        cfg: Arc::clone(&cfg),
        store: Arc::clone(&store),
        bus: BusAdapter::connect(&broker, "api", cfg.bus_buffer_depth),
        hub: BroadcastHub::new(cfg.hub_queue_depth),
        safety: SafetyHandle::new(),
    };
    (router(state), store)
}

async fn send(
    app: &axum::Router,
    method: &str,
    path: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, value)
}

#[tokio::test]
async fn store_enqueues_a_pending_row() {
    let (app, store) = edge(false).await;
    let (status, value) =
        send(&app, "POST", "/order/store", serde_json::json!({"flavor": "CHOCO"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["slot"], "A1", "first empty slot wins");

    let id = value["command_id"].as_i64().unwrap();
    let row = store.get_command(id).await.unwrap();
    assert_eq!(row.status, CommandStatus::Pending);
    assert_eq!(row.kind, CommandKind::Store);
    assert!(row.params.batch_uuid.is_some());
}

#[tokio::test]
async fn store_rejects_full_warehouse() {
    let (app, _) = edge(true).await;
    let (status, value) = send(&app, "POST", "/order/store", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(value["detail"], "no available slots");
}

#[tokio::test]
async fn store_rejects_occupied_and_invalid_slots() {
    let (app, _) = edge(true).await;
    let (status, _) =
        send(&app, "POST", "/order/store", serde_json::json!({"slot": "A1"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) =
        send(&app, "POST", "/order/store", serde_json::json!({"slot": "D9"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) =
        send(&app, "POST", "/order/store", serde_json::json!({"flavor": "MARZIPAN"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn retrieve_rejects_empty_slot() {
    let (app, _) = edge(false).await;
    let (status, value) =
        send(&app, "POST", "/order/retrieve", serde_json::json!({"slot": "A1"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(value["detail"], "slot A1 is empty");
}

#[tokio::test]
async fn process_auto_selects_lowest_raw_dough_slot() {
    let (app, store) = edge(true).await;
    // Bake A1 out of the running.
    let row = store
        .enqueue_command(CommandKind::Process, SlotName::parse("A1"), CommandParams::default())
        .await
        .unwrap();
    store.claim_next("test", false).await.unwrap();
    store
        .finish_command(
            row.id,
            CommandStatus::Completed,
            "baked",
            vec![stf_twin::store::Mutation::SetCookieStatus {
                slot: SlotName::parse("A1").unwrap(),
                status: CookieStatus::Baked,
            }],
        )
        .await
        .unwrap();

    let (status, value) = send(&app, "POST", "/order/process", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["slot"], "A2");
}

#[tokio::test]
async fn process_rejects_wrong_lifecycle_state() {
    let (app, store) = edge(true).await;
    let row = store
        .enqueue_command(CommandKind::Process, SlotName::parse("B1"), CommandParams::default())
        .await
        .unwrap();
    store.claim_next("test", false).await.unwrap();
    store
        .finish_command(
            row.id,
            CommandStatus::Completed,
            "baked",
            vec![stf_twin::store::Mutation::SetCookieStatus {
                slot: SlotName::parse("B1").unwrap(),
                status: CookieStatus::Baked,
            }],
        )
        .await
        .unwrap();

    let (status, value) =
        send(&app, "POST", "/order/process", serde_json::json!({"slot": "B1"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(value["detail"].as_str().unwrap().contains("not RAW_DOUGH"));
}

#[tokio::test]
async fn process_flavor_filter_applies_to_auto_selection() {
    let (app, _) = edge(true).await;
    // Demo inventory is all CHOCO.
    let (status, value) = send(
        &app,
        "POST",
        "/order/process",
        serde_json::json!({"flavor": "STRAWBERRY"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(value["detail"].as_str().unwrap().contains("no RAW_DOUGH"));
}

#[tokio::test]
async fn inventory_reflects_the_store() {
    let (app, _) = edge(true).await;
    let (status, value) = send(&app, "GET", "/inventory", serde_json::Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    let slots = value.as_array().unwrap();
    assert_eq!(slots.len(), 9);
    assert!(slots.iter().all(|s| s["cookie_status"] == "RAW_DOUGH"));
}

#[tokio::test]
async fn emergency_stop_latches_and_health_reports_it() {
    let (app, _) = edge(false).await;
    let (status, _) =
        send(&app, "POST", "/maintenance/emergency-stop", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);

    let (status, value) = send(&app, "GET", "/health", serde_json::Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["emergency"], true);
    assert_eq!(value["ok"], true);
}

#[tokio::test]
async fn reset_row_outranks_earlier_orders() {
    let (app, store) = edge(false).await;
    send(&app, "POST", "/order/store", serde_json::json!({})).await;
    let (_, value) = send(&app, "POST", "/maintenance/reset", serde_json::json!({})).await;
    let reset_id = value["command_id"].as_i64().unwrap();

    let claimed = store.claim_next("test", false).await.unwrap().unwrap();
    assert_eq!(claimed.id, reset_id);
}
