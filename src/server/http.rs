//! HTTP transport: `POST /mcp`, `GET /health`, `GET /metrics`.
//!
//! Route shape grounded on the teacher's `server/routes.rs` — a thin
//! `AppState`, one `CorsLayer::permissive()`, JSON in/JSON out.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

use crate::dispatcher::Dispatcher;
use crate::security::api_key::hash_key;
use crate::server::jsonrpc::{self, JsonRpcRequest};
use crate::store::Store;
use crate::supervisor::Supervisor;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<dyn Store>,
    pub supervisor: Arc<Supervisor>,
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/mcp", post(mcp_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

const API_KEY_HEADER: &str = "x-api-key";

fn extract_credential(headers: &HeaderMap) -> Option<String> {
    headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()).map(str::to_string)
}

/// POST /mcp — the JSON-RPC 2.0 tool-call endpoint. Always returns 200;
/// the envelope itself carries success or error, per spec.md §6.1.
async fn mcp_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let credential = extract_credential(&headers);
    let response = jsonrpc::handle_request(&state.dispatcher, credential.as_deref(), request).await;
    Json(response)
}

/// GET /health — unauthenticated liveness probe, not the `health_check`
/// tool. Never blocks on the store.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.supervisor.health_snapshot();
    Json(serde_json::json!({
        "status": if snapshot.store_reachable { "ok" } else { "degraded" },
        "version": crate::VERSION,
        "service": "crew-forge",
    }))
}

/// GET /metrics — authenticated flat text exposition, per spec.md §6.1.
async fn metrics_handler(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let Some(credential) = extract_credential(&headers) else {
        return (StatusCode::UNAUTHORIZED, "missing x-api-key\n".to_string());
    };
    let hash = hash_key(&credential);
    match state.store.get_api_key_by_hash(&hash).await {
        Ok(Some(key)) if !key.disabled => {}
        _ => return (StatusCode::UNAUTHORIZED, "invalid api key\n".to_string()),
    }

    let snapshot = state.supervisor.health_snapshot();
    let body = format!(
        "crew_forge_store_reachable {}\ncrew_forge_worker_pool_available {}\ncrew_forge_worker_pool_capacity {}\n",
        if snapshot.store_reachable { 1 } else { 0 },
        snapshot.worker_pool_available,
        snapshot.worker_pool_capacity,
    );
    (StatusCode::OK, body)
}
