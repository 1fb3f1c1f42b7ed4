//! REST surface: order lifecycle, status reads, the event log, and trunk
//! introspection.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use dto::{CallSnapshot, CreateOrderRequest, OrderSnapshot, TrunkStatus};
use models::EventRecord;

use crate::ami::AmiManager;
use crate::error::ApiError;
use crate::orchestrator::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub ami: Arc<AmiManager>,
}

pub fn router(state: AppState) -> Router {
    // Operator dashboards live on another origin; keep CORS permissive here
    // and tighten at the edge.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/order/create", post(create_order))
        .route("/api/order/:id/execute", post(execute_order))
        .route("/api/order/:id/status", get(order_status))
        .route("/api/order/:id/events", get(order_events))
        .route("/api/call/:id/status", get(call_status))
        .route("/api/trunk/:name/status", get(trunk_status))
        .layer(cors)
        .with_state(state)
}

/// Lightweight probe for readiness checks.
async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy"}))
}

async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderSnapshot>), ApiError> {
    let snapshot = state.orchestrator.create_order(&request).await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn execute_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderSnapshot>, ApiError> {
    let snapshot = state.orchestrator.execute_order(order_id).await?;
    Ok(Json(snapshot))
}

async fn order_status(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderSnapshot>, ApiError> {
    let snapshot = state.orchestrator.order_status(order_id).await?;
    Ok(Json(snapshot))
}

async fn order_events(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Vec<EventRecord>>, ApiError> {
    let events = state.orchestrator.order_events(order_id).await?;
    Ok(Json(events))
}

async fn call_status(
    State(state): State<AppState>,
    Path(call_id): Path<Uuid>,
) -> Result<Json<CallSnapshot>, ApiError> {
    let snapshot = state.orchestrator.call_status(call_id).await?;
    Ok(Json(snapshot))
}

/// Whether the PBX knows a PJSIP endpoint with this name.
async fn trunk_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<TrunkStatus> {
    let client = match state.ami.ensure_connected().await {
        Ok(client) => client,
        Err(error) => {
            tracing::warn!(%error, "trunk status unavailable, pbx unreachable");
            return Json(TrunkStatus {
                status: "not_connected".to_string(),
                name: None,
            });
        }
    };

    match client.endpoint_names().await {
        Ok(names) if names.iter().any(|endpoint| endpoint == &name) => Json(TrunkStatus {
            status: "exists".to_string(),
            name: Some(name),
        }),
        Ok(_) => Json(TrunkStatus {
            status: "not_found".to_string(),
            name: Some(name),
        }),
        Err(error) => {
            tracing::warn!(%error, "endpoint listing failed");
            Json(TrunkStatus {
                status: "not_connected".to_string(),
                name: None,
            })
        }
    }
}
