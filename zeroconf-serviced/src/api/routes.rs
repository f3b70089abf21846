use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tokio::sync::watch;
use shared::protocol::RegistrationService;
use shared::types::{Record, ServiceEntry};
use crate::api::ws;
use crate::mdns::advertise::Advertiser;
use crate::serializer::RegistryHandle;

#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryHandle,
    pub digest_rx: watch::Receiver<String>,
    pub advertiser: Advertiser,
    pub subscriber_queue: usize,
}

#[derive(Deserialize)]
pub struct ServiceQuery {
    #[serde(rename = "type")]
    pub service_type: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/services", get(get_services))
        .route("/v1/services/hash", get(get_hash))
        .route("/v1/services/:key", get(get_service))
        .route("/v1/types", get(get_types))
        .route("/v1/registrations", axum::routing::post(register).delete(unregister))
        .route("/v1/subscribe", get(ws::ws_handler))
        .with_state(state)
}

fn internal_error(e: anyhow::Error) -> StatusCode {
    tracing::error!("Failed to query registry: {:#}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn get_services(
    State(state): State<AppState>,
    Query(params): Query<ServiceQuery>,
) -> Result<Json<Vec<ServiceEntry>>, StatusCode> {
    let services = match params.service_type {
        Some(service_type) => state.registry.get_by_type(service_type).await,
        None => state.registry.get_all().await,
    };

    services.map(Json).map_err(internal_error)
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.digest_rx.borrow().clone()
}

async fn get_service(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ServiceEntry>, StatusCode> {
    state
        .registry
        .get_one(key.to_lowercase())
        .await
        .map_err(internal_error)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_types(State(state): State<AppState>) -> Result<Json<Vec<String>>, StatusCode> {
    state.registry.get_types().await.map(Json).map_err(internal_error)
}

async fn register(State(state): State<AppState>, Json(record): Json<Record>) -> StatusCode {
    match state.advertiser.register_service(&record).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => {
            tracing::error!("Registration failed: {:#}", e);
            StatusCode::BAD_GATEWAY
        }
    }
}

async fn unregister(State(state): State<AppState>, Json(record): Json<Record>) -> StatusCode {
    match state.advertiser.unregister_service(&record).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => {
            tracing::error!("Unregistration failed: {:#}", e);
            StatusCode::BAD_GATEWAY
        }
    }
}
