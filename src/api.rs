//! HTTP / WebSocket edge.
//!
//! Operational errors (empty slot, warehouse full, wrong lifecycle state)
//! are rejected here with 4xx before a queue row exists; everything that
//! reaches the queue is structurally valid. The WebSocket endpoint is
//! observation only: it drains one broadcast hub subscription per client.

use crate::bus::BusAdapter;
use crate::config::TwinConfig;
use crate::error::StoreError;
use crate::executor::trigger_emergency;
use crate::hub::BroadcastHub;
use crate::model::*;
use crate::safety::SafetyHandle;
use crate::store::SharedStore;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<TwinConfig>,
    pub store: SharedStore,
    pub bus: BusAdapter,
    pub hub: BroadcastHub,
    pub safety: SafetyHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/order/store", post(order_store))
        .route("/order/retrieve", post(order_retrieve))
        .route("/order/process", post(order_process))
        .route("/maintenance/reset", post(maintenance_reset))
        .route("/maintenance/emergency-stop", post(maintenance_emergency_stop))
        .route("/inventory", get(inventory))
        .route("/hardware/states", get(hardware_states))
        .route("/commands", get(commands))
        .route("/alerts", get(alerts))
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

pub async fn serve(state: AppState, addr: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(target: "stf_twin::api", addr, "edge listening");
    axum::serve(listener, router(state)).await
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, detail: detail.into() }
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, detail: detail.into() }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(json!({"detail": self.detail}))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Order endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StoreRequest {
    #[serde(default)]
    pub flavor: Option<String>,
    #[serde(default)]
    pub slot: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RetrieveRequest {
    pub slot: String,
}

#[derive(Debug, Deserialize)]
pub struct ProcessRequest {
    #[serde(default)]
    pub slot: Option<String>,
    #[serde(default)]
    pub flavor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub command_id: i64,
    pub slot: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_uuid: Option<String>,
}

async fn order_store(
    State(state): State<AppState>,
    Json(req): Json<StoreRequest>,
) -> Result<Json<OrderResponse>, ApiError> {
    let flavor = match &req.flavor {
        Some(raw) => CookieFlavor::parse(raw)
            .ok_or_else(|| ApiError::bad_request(format!("invalid flavor: {raw}")))?,
        None => CookieFlavor::Choco,
    };

    let slot = match &req.slot {
        Some(raw) => {
            let slot = SlotName::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("invalid slot name: {raw}")))?;
            let occupied = state
                .store
                .slots()
                .await?
                .into_iter()
                .any(|s| s.name == slot && s.carrier_id.is_some());
            if occupied {
                return Err(ApiError::bad_request(format!("slot {slot} not available")));
            }
            slot
        }
        None => state
            .store
            .find_empty_slot()
            .await?
            .ok_or_else(|| ApiError::bad_request("no available slots"))?,
    };

    let batch_uuid = uuid::Uuid::new_v4().to_string();
    let params = CommandParams {
        flavor: Some(flavor),
        batch_uuid: Some(batch_uuid.clone()),
        ..CommandParams::default()
    };
    let row = state
        .store
        .enqueue_command(CommandKind::Store, Some(slot), params)
        .await?;
    Ok(Json(OrderResponse {
        command_id: row.id,
        slot: slot.to_string(),
        batch_uuid: Some(batch_uuid),
    }))
}

async fn order_retrieve(
    State(state): State<AppState>,
    Json(req): Json<RetrieveRequest>,
) -> Result<Json<OrderResponse>, ApiError> {
    let slot = SlotName::parse(&req.slot)
        .ok_or_else(|| ApiError::not_found(format!("slot {} not found", req.slot)))?;
    let occupied = state
        .store
        .slots()
        .await?
        .into_iter()
        .find(|s| s.name == slot)
        .map(|s| s.carrier_id.is_some())
        .unwrap_or(false);
    if !occupied {
        return Err(ApiError::bad_request(format!("slot {slot} is empty")));
    }
    let row = state
        .store
        .enqueue_command(CommandKind::Retrieve, Some(slot), CommandParams::default())
        .await?;
    Ok(Json(OrderResponse {
        command_id: row.id,
        slot: slot.to_string(),
        batch_uuid: None,
    }))
}

async fn order_process(
    State(state): State<AppState>,
    Json(req): Json<ProcessRequest>,
) -> Result<Json<OrderResponse>, ApiError> {
    let flavor = match &req.flavor {
        Some(raw) => Some(
            CookieFlavor::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("invalid flavor: {raw}")))?,
        ),
        None => None,
    };

    let (slot, cookie) = match &req.slot {
        Some(raw) => {
            let slot = SlotName::parse(raw)
                .ok_or_else(|| ApiError::not_found(format!("slot {raw} not found")))?;
            let cookie = state
                .store
                .cookie_in_slot(slot)
                .await?
                .ok_or_else(|| ApiError::bad_request(format!("slot {slot} is empty")))?;
            if cookie.status != CookieStatus::RawDough {
                return Err(ApiError::bad_request(format!(
                    "cookie in {slot} is not RAW_DOUGH (current: {:?})",
                    cookie.status
                )));
            }
            (slot, cookie)
        }
        None => {
            // Deterministic auto-selection: lowest slot name holding
            // RAW_DOUGH, optionally flavor-filtered.
            let slot = state
                .store
                .find_raw_dough_slot(flavor)
                .await?
                .ok_or_else(|| {
                    ApiError::bad_request("no RAW_DOUGH cookies available for processing")
                })?;
            let cookie = state
                .store
                .cookie_in_slot(slot)
                .await?
                .ok_or_else(|| ApiError::bad_request(format!("slot {slot} is empty")))?;
            (slot, cookie)
        }
    };

    let params = CommandParams {
        batch_uuid: Some(cookie.batch_uuid.clone()),
        ..CommandParams::default()
    };
    let row = state
        .store
        .enqueue_command(CommandKind::Process, Some(slot), params)
        .await?;
    Ok(Json(OrderResponse {
        command_id: row.id,
        slot: slot.to_string(),
        batch_uuid: Some(cookie.batch_uuid),
    }))
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

async fn maintenance_reset(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let row = state
        .store
        .enqueue_command(CommandKind::Reset, None, CommandParams::default())
        .await?;
    Ok(Json(json!({"command_id": row.id})))
}

async fn maintenance_emergency_stop(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    trigger_emergency(&state.bus, &state.store, &state.hub, &state.safety, "API").await;
    Ok(Json(json!({})))
}

// ---------------------------------------------------------------------------
// Read endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct InventoryEntry {
    slot: String,
    x_pos: f64,
    y_pos: f64,
    carrier_id: Option<i64>,
    cookie_flavor: Option<CookieFlavor>,
    cookie_status: Option<CookieStatus>,
    batch_uuid: Option<String>,
}

async fn inventory(
    State(state): State<AppState>,
) -> Result<Json<Vec<InventoryEntry>>, ApiError> {
    let mut out = Vec::with_capacity(9);
    for slot in state.store.slots().await? {
        let cookie = state.store.cookie_in_slot(slot.name).await?;
        out.push(InventoryEntry {
            slot: slot.name.to_string(),
            x_pos: slot.x_pos,
            y_pos: slot.y_pos,
            carrier_id: slot.carrier_id,
            cookie_flavor: cookie.as_ref().map(|c| c.flavor),
            cookie_status: cookie.as_ref().map(|c| c.status),
            batch_uuid: cookie.map(|c| c.batch_uuid),
        });
    }
    Ok(Json(out))
}

async fn hardware_states(
    State(state): State<AppState>,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    Ok(Json(state.store.device_snapshots().await?))
}

async fn commands(State(state): State<AppState>) -> Result<Json<Vec<CommandRow>>, ApiError> {
    Ok(Json(state.store.list_commands(50).await?))
}

async fn alerts(State(state): State<AppState>) -> Result<Json<Vec<Alert>>, ApiError> {
    Ok(Json(state.store.alerts(50).await?))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let store_ok = state.store.ping().await;
    let bus_ok = state.bus.is_connected();
    Json(json!({
        "ok": store_ok && bus_ok,
        "deps": {
            "store": store_ok,
            "bus": bus_ok,
        },
        "emergency": state.safety.is_latched(),
    }))
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_stream(socket, state))
}

async fn ws_stream(socket: WebSocket, state: AppState) {
    let sub = state.hub.subscribe("ws");
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            event = sub.recv() => {
                if sender.send(Message::Text(event.to_string())).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    // Observation only: client frames are ignored, closes end
                    // the session.
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}
