//! Status endpoint.
//!
//! A small axum router exposing the dashboard counters: storage health,
//! running deliveries, ingestion counters, failure records and the hot
//! records themselves, plus a few operator actions.

use crate::core::{MessageRecord, SignalError};
use crate::dispatch::{Dispatcher, FailureRecord};
use crate::ingest::{IngestBridge, IngestStats};
use crate::storage::{SignalStore, StoreStats, SweepReport};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug)]
pub enum WebError {
    Signal(SignalError),
    Input(String),
}

impl From<SignalError> for WebError {
    fn from(err: SignalError) -> Self {
        WebError::Signal(err)
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let (status, message, code) = match self {
            WebError::Signal(SignalError::Timeout(msg)) => {
                (StatusCode::GATEWAY_TIMEOUT, msg, "timeout".to_string())
            }
            WebError::Signal(err @ (SignalError::StorageError(_) | SignalError::IoError(_))) => (
                StatusCode::SERVICE_UNAVAILABLE,
                err.to_string(),
                "storage_unavailable".to_string(),
            ),
            WebError::Signal(SignalError::ChannelClosed(msg)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                msg,
                "shutting_down".to_string(),
            ),
            WebError::Signal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
                "internal_error".to_string(),
            ),
            WebError::Input(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                msg,
                "input_error".to_string(),
            ),
        };

        (status, Json(ErrorResponse { error: message, code })).into_response()
    }
}

pub type Result<T> = std::result::Result<T, WebError>;

/// Everything the handlers read from.
#[derive(Clone)]
pub struct WebState {
    pub store: SignalStore,
    pub bridge: IngestBridge,
    pub dispatcher: Dispatcher,
    pub schedules: Arc<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub storage: StoreStats,
    pub ingest: IngestStats,
    pub protocol_response: String,
    pub running_deliveries: usize,
    pub active: bool,
    pub voice_enabled: bool,
    pub schedules: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RecordsQuery {
    pub client: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub records: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct SwitchesRequest {
    pub active: Option<bool>,
    pub voice_enabled: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SwitchesResponse {
    pub active: bool,
    pub voice_enabled: bool,
}

pub fn build_router(state: WebState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/failures", get(failures))
        .route("/records", get(records))
        .route("/refresh", post(refresh))
        .route("/sweep", post(sweep))
        .route("/switches", put(switches))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn status(State(state): State<WebState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        storage: state.store.stats().await,
        ingest: state.bridge.stats(),
        protocol_response: state.bridge.response(),
        running_deliveries: state.dispatcher.running_count(),
        active: state.dispatcher.is_active(),
        voice_enabled: state.dispatcher.voice_enabled(),
        schedules: state.schedules.as_ref().clone(),
    })
}

async fn failures(State(state): State<WebState>) -> Json<Vec<FailureRecord>> {
    Json(state.dispatcher.failures())
}

async fn records(
    State(state): State<WebState>,
    Query(query): Query<RecordsQuery>,
) -> Result<Json<Vec<MessageRecord>>> {
    if query.limit == Some(0) {
        return Err(WebError::Input("limit must be > 0".to_string()));
    }
    let mut records = match query.client {
        Some(client) => state.store.select(|r| r.client_name == client).await,
        None => state.store.load_all().await,
    };
    records.reverse();
    if let Some(limit) = query.limit {
        records.truncate(limit);
    }
    Ok(Json(records))
}

async fn refresh(State(state): State<WebState>) -> Result<Json<RefreshResponse>> {
    let records = state.store.refresh().await?;
    Ok(Json(RefreshResponse { records }))
}

async fn sweep(State(state): State<WebState>) -> Result<Json<SweepReport>> {
    Ok(Json(state.store.sweep_now().await?))
}

async fn switches(
    State(state): State<WebState>,
    Json(request): Json<SwitchesRequest>,
) -> Json<SwitchesResponse> {
    if let Some(active) = request.active {
        state.dispatcher.set_active(active);
    }
    if let Some(enabled) = request.voice_enabled {
        state.dispatcher.set_voice_enabled(enabled);
    }
    Json(SwitchesResponse {
        active: state.dispatcher.is_active(),
        voice_enabled: state.dispatcher.voice_enabled(),
    })
}
