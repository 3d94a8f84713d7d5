use crate::errors::Error;
use crate::identity::{CallerIdentity, ClaimsVerifier, IdentityResolver};
use crate::metrics;
use crate::model::{DeviceTimeSeries, DeviceView};
use crate::query::SeriesRequest;
use crate::service::FarmService;
use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<FarmService>,
    pub verifier: Arc<ClaimsVerifier>,
    pub resolver: Arc<IdentityResolver>,
    pub request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
pub struct SeriesQuery {
    dataset: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/farms/:farm_id/devices", get(list_devices))
        .route(
            "/api/v1/farms/:farm_id/devices/:device_id/series",
            get(get_device_series),
        )
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<CallerIdentity, AppError> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| Error::Auth("Missing authorization header".to_string()))?
        .to_str()
        .map_err(|_| Error::Auth("Invalid authorization header".to_string()))?;

    let claims = state.verifier.verify_header(header)?;
    Ok(state.resolver.resolve(&claims)?)
}

async fn list_devices(
    State(state): State<AppState>,
    Path(farm_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<DeviceView>>, AppError> {
    let caller = authenticate(&state, &headers)?;
    let devices = state.service.list_devices(&caller, &farm_id).await?;
    Ok(Json(devices))
}

async fn get_device_series(
    State(state): State<AppState>,
    Path((farm_id, device_id)): Path<(String, String)>,
    params: Result<Query<SeriesQuery>, QueryRejection>,
    headers: HeaderMap,
) -> Result<Json<Vec<DeviceTimeSeries>>, AppError> {
    let caller = authenticate(&state, &headers)?;
    let Query(params) = params.map_err(|rejection| Error::Validation(rejection.body_text()))?;
    let deadline = Instant::now() + state.request_timeout;

    let request = SeriesRequest {
        farm_id,
        device_id,
        dataset_key: params.dataset,
        from: params.from,
        to: params.to,
    };

    let series = state
        .service
        .fetch_device_series(&caller, &request, Some(deadline))
        .await?;
    info!(
        "Returning {} points for device {}",
        series.iter().map(|s| s.points.len()).sum::<usize>(),
        request.device_id
    );
    Ok(Json(series))
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

pub struct AppError(Error);

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden { .. } => StatusCode::FORBIDDEN,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::QueryFailed { .. } => StatusCode::BAD_GATEWAY,
            Error::QueryTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::Engine(_) | Error::Database(_) | Error::Migration(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("API error: {}", self.0);
            "Internal server error".to_string()
        } else {
            warn!("API error ({}): {}", status, self.0);
            self.0.to_string()
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
