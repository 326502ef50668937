//! Authenticated inbound control API.
//!
//! Every endpoint is a POST carrying the signed envelope of the
//! authentication primitive; the [`Authenticated`] extractor verifies the
//! digest and hands the handler the unwrapped JSON payload. Handlers reply
//! with JSON objects whose `status` field is `"OK"` or a `"failed, …"`
//! explanation; structurally malformed requests get plain HTTP errors.

pub mod models;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use axum::extract::{FromRequest, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::auth::{self, SignedEnvelope};
use crate::pool::WorkerPool;
use crate::resources;
use crate::types::{now_secs, LoadingData};
use models::{
    build_customers, valid_entity_id, CustomerPauseRequest, CustomerRemoveRequest,
    CustomerSpec, RegionChangeRequest,
};

/// Shared state behind the router.
pub struct ApiState {
    pub pool: Arc<WorkerPool>,
    pub inbound_secret: Arc<RwLock<Vec<u8>>>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request")]
    BadRequest,
    #[error("authentication failed")]
    Unauthorized,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::BadRequest => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
        };
        status.into_response()
    }
}

/// Verified request payload; `Value::Null` for empty-body endpoints.
pub struct Authenticated(pub Value);

#[axum::async_trait]
impl FromRequest<Arc<ApiState>> for Authenticated {
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &Arc<ApiState>) -> Result<Self, Self::Rejection> {
        let Json(envelope): Json<SignedEnvelope> = Json::from_request(req, state)
            .await
            .map_err(|_| ApiError::BadRequest)?;

        let secret = state
            .inbound_secret
            .read()
            .map_err(|_| ApiError::Unauthorized)?
            .clone();

        let payload = auth::verify_json(&secret, &envelope, now_secs()).ok_or_else(|| {
            warn!("rejected inbound request with bad signature");
            ApiError::Unauthorized
        })?;

        if payload.is_empty() {
            return Ok(Authenticated(Value::Null));
        }
        let value = serde_json::from_slice(&payload).map_err(|_| ApiError::BadRequest)?;
        Ok(Authenticated(value))
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/state/active", post(state_active))
        .route("/state/inactive", post(state_inactive))
        .route("/region/change", post(region_change))
        .route("/loading/get", post(loading_get))
        .route("/customer/add", post(customer_add))
        .route("/customer/remove", post(customer_remove))
        .route("/customer/pause", post(customer_pause))
        .with_state(state)
}

/// Serves the API until the shutdown signal fires.
pub async fn serve(listener: TcpListener, state: Arc<ApiState>, mut shutdown: watch::Receiver<()>) {
    let app = router(state);
    if let Err(error) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown.changed().await.ok();
        })
        .await
    {
        error!(error = %error, "inbound API server error");
    }
}

fn ok_status() -> Json<Value> {
    Json(json!({"status": "OK"}))
}

fn failed_status(message: String) -> Json<Value> {
    Json(json!({"status": message}))
}

async fn state_active(
    State(state): State<Arc<ApiState>>,
    _request: Authenticated,
) -> Json<Value> {
    state.pool.go_active(true);
    ok_status()
}

async fn state_inactive(
    State(state): State<Arc<ApiState>>,
    _request: Authenticated,
) -> Json<Value> {
    state.pool.go_active(false);
    ok_status()
}

async fn region_change(
    State(state): State<Arc<ApiState>>,
    Authenticated(body): Authenticated,
) -> Result<Json<Value>, ApiError> {
    let request: RegionChangeRequest =
        serde_json::from_value(body).map_err(|_| ApiError::BadRequest)?;

    if request.number_regions <= 0
        || request.region_index < 0
        || request.region_index >= request.number_regions
    {
        return Ok(failed_status("failed, invalid parameters".to_string()));
    }

    state
        .pool
        .update_region_data(request.region_index as u32, request.number_regions as u32);
    Ok(ok_status())
}

async fn loading_get(
    State(state): State<Arc<ApiState>>,
    _request: Authenticated,
) -> Json<Value> {
    let mut single_region: BTreeMap<u32, Vec<LoadingData>> = BTreeMap::new();
    let mut multi_region: BTreeMap<u32, Vec<LoadingData>> = BTreeMap::new();

    for (signed_interval, data) in state.pool.loading_data().await {
        if signed_interval < 0 {
            single_region
                .entry((-signed_interval) as u32)
                .or_default()
                .push(data);
        } else {
            multi_region
                .entry(signed_interval as u32)
                .or_default()
                .push(data);
        }
    }

    Json(json!({
        "status": "OK",
        "data": {
            "cpu": resources::cpu_utilization(),
            "memory": resources::memory_utilization(),
            "single_region": loading_group(single_region),
            "multi_region": loading_group(multi_region),
        }
    }))
}

fn loading_group(groups: BTreeMap<u32, Vec<LoadingData>>) -> Value {
    let mut result = serde_json::Map::new();
    for (interval, entries) in groups {
        let list: Vec<Value> = entries
            .iter()
            .map(|data| {
                json!({
                    "polled_host_schemes": data.polled_host_schemes,
                    "missed_timing_marks": data.missed_timing_windows,
                    "average_timing_error": data.average_miss_seconds,
                })
            })
            .collect();
        result.insert(interval.to_string(), Value::Array(list));
    }
    Value::Object(result)
}

async fn customer_add(
    State(state): State<Arc<ApiState>>,
    Authenticated(body): Authenticated,
) -> Result<Json<Value>, ApiError> {
    if !body.is_object() {
        return Err(ApiError::BadRequest);
    }

    let specs: BTreeMap<String, CustomerSpec> = match serde_json::from_value(body) {
        Ok(specs) => specs,
        Err(error) => return Ok(failed_status(format!("failed, {error}"))),
    };

    // The whole batch parses before anything is adopted.
    let customers = match build_customers(specs) {
        Ok(customers) => customers,
        Err(message) => return Ok(failed_status(message)),
    };

    for customer in customers {
        // Idempotent replacement: an existing customer with this id goes
        // away before the new one is installed.
        state.pool.remove_customer(customer.id).await;
        state.pool.add_customer(customer).await;
    }

    Ok(ok_status())
}

async fn customer_remove(
    State(state): State<Arc<ApiState>>,
    Authenticated(body): Authenticated,
) -> Result<Json<Value>, ApiError> {
    let request: CustomerRemoveRequest =
        serde_json::from_value(body).map_err(|_| ApiError::BadRequest)?;

    if !valid_entity_id(request.customer_id) {
        return Ok(failed_status("failed, invalid customer ID".to_string()));
    }

    if state.pool.remove_customer(request.customer_id as u32).await {
        Ok(ok_status())
    } else {
        Ok(failed_status("failed, unknown customer ID".to_string()))
    }
}

async fn customer_pause(
    State(state): State<Arc<ApiState>>,
    Authenticated(body): Authenticated,
) -> Result<Json<Value>, ApiError> {
    let request: CustomerPauseRequest =
        serde_json::from_value(body).map_err(|_| ApiError::BadRequest)?;

    if !valid_entity_id(request.customer_id) {
        return Ok(failed_status("failed, invalid customer ID".to_string()));
    }

    if !state
        .pool
        .set_paused(request.customer_id as u32, request.pause)
        .await
    {
        info!(customer = request.customer_id, "pause request for unknown customer");
    }
    Ok(ok_status())
}
