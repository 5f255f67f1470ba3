//! REST surface.
//!
//! A thin front over the cache and the bus handler: reads are served
//! straight from the cache (stale data stays available when the bus is
//! down), writes go through the handler's validated write path.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use std::sync::Arc;

use crate::cache::ParameterCache;
use crate::cycling::CompressorMonitor;
use crate::error::WriteError;
use crate::handler::BusHandler;
use crate::model::{
    AlarmsResponse, ErrorResponse, HealthResponse, HealthStatus, ParameterSetRequest,
    ParameterSetResponse, ParametersResponse,
};

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<ParameterCache>,
    pub handler: Arc<BusHandler>,
    pub monitor: Arc<CompressorMonitor>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/parameters", get(get_parameters))
        .route("/parameters/{name}", post(set_parameter))
        .route("/alarms", get(get_alarms))
        .route("/cycling", get(get_cycling))
        .with_state(state)
}

struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn not_connected() -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "controller not connected")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                detail: self.detail,
            }),
        )
            .into_response()
    }
}

impl From<WriteError> for ApiError {
    fn from(err: WriteError) -> Self {
        let status = match &err {
            WriteError::NotFound(_) => StatusCode::NOT_FOUND,
            WriteError::NotAcknowledged | WriteError::NotConnected => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, err.to_string())
    }
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "heatbus-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let connected = state.handler.connected();
    let count = state.cache.count();
    let status = match (connected, count) {
        (true, 1..) => HealthStatus::Healthy,
        (true, 0) => HealthStatus::Degraded,
        (false, _) => HealthStatus::Unhealthy,
    };
    Json(HealthResponse {
        status,
        controller_connected: connected,
        parameters_count: count,
        last_update: state.cache.last_update(),
    })
}

async fn get_parameters(
    State(state): State<AppState>,
) -> Result<Json<ParametersResponse>, ApiError> {
    if !state.handler.connected() {
        return Err(ApiError::not_connected());
    }
    Ok(Json(ParametersResponse {
        timestamp: state.cache.last_update().unwrap_or_else(Utc::now),
        parameters: state.cache.get_all(),
    }))
}

async fn set_parameter(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<ParameterSetRequest>,
) -> Result<Json<ParameterSetResponse>, ApiError> {
    if !state.handler.connected() {
        return Err(ApiError::not_connected());
    }

    let old_value = state
        .cache
        .get_by_name(&name)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                format!("parameter not found: {name}"),
            )
        })?
        .value;

    state
        .handler
        .write_param(&name, request.value.clone())
        .await?;

    Ok(Json(ParameterSetResponse {
        success: true,
        name,
        old_value,
        new_value: request.value,
    }))
}

async fn get_alarms(State(state): State<AppState>) -> Result<Json<AlarmsResponse>, ApiError> {
    if !state.handler.connected() {
        return Err(ApiError::not_connected());
    }
    Ok(Json(AlarmsResponse {
        alarms: state.handler.alarms(),
    }))
}

async fn get_cycling(State(state): State<AppState>) -> Json<crate::cycling::CyclingMetrics> {
    Json(state.monitor.metrics(&state.cache))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_errors_map_to_expected_statuses() {
        let cases: [(WriteError, StatusCode); 6] = [
            (
                WriteError::NotFound("x".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                WriteError::ReadOnly("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                WriteError::BelowMinimum {
                    value: 1.0,
                    min: 2.0,
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                WriteError::AboveMaximum {
                    value: 9.0,
                    max: 5.0,
                },
                StatusCode::BAD_REQUEST,
            ),
            (WriteError::NotAcknowledged, StatusCode::SERVICE_UNAVAILABLE),
            (WriteError::NotConnected, StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status, expected);
        }
    }
}
