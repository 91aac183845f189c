//! HTTP ingress.
//!
//! JSON handlers delegating to the core actors. Every /api route runs behind
//! bearer-token auth; fleet mutations additionally require the admin role.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{middleware, Extension, Json, Router};
use chrono::{NaiveDate, Utc};
use metrics_exporter_prometheus::PrometheusHandle;

use taskgate_common::api::balancer::{BalancerStatus, SetAlgorithmRequest};
use taskgate_common::api::servers::{
    MaintenanceRequest, RegisterServerRequest, RegisterServerResponse, ServerListQuery,
    ServerListResponse, SuccessResponse,
};
use taskgate_common::api::stats::{HourlyReport, StatsQuery};
use taskgate_common::api::tasks::{ActionResponse, CreateTaskRequest, TaskSnapshot};
use taskgate_common::config::GatewayConfig;
use taskgate_common::ids::{ServerId, TaskId};
use taskgate_common::types::{
    BalancerAlgorithm, ServerFilter, ServerMetrics, ServerStatistics, ServerStatus, Statistics,
    TaskUpdate,
};
use taskgate_common::GatewayError;

use crate::auth::{self, Claims};
use crate::runtime::Runtime;

/// Shared state for all handlers.
pub struct AppState {
    pub runtime: Arc<Runtime>,
    pub config: Arc<GatewayConfig>,
    pub metrics_handle: Option<PrometheusHandle>,
}

/// Error envelope: the mapped status code plus `{error, details}` with a
/// sanitized message. Internals never leak.
pub struct ApiError(GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatewayError::Validation(_) | GatewayError::IllegalTransition(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "Request failed");
            "internal error".to_string()
        } else {
            self.0.to_string()
        };

        let body = serde_json::json!({
            "error": message,
            "details": self.0.kind(),
        });
        (status, Json(body)).into_response()
    }
}

/// Build the full gateway router.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/task", post(create_task))
        .route("/task/{id}", get(get_task).put(update_task))
        .route("/task/{id}/retry", post(retry_task))
        .route("/task/{id}/cancel", post(cancel_task))
        .route("/servers", post(register_server).get(list_servers))
        .route("/servers/{id}", delete(unregister_server))
        .route("/servers/{id}/heartbeat", post(server_heartbeat))
        .route("/servers/{id}/maintenance", put(server_maintenance))
        .route("/servers/{id}/metrics", get(server_metrics))
        .route("/stats", get(day_stats))
        .route("/stats/hourly", get(hourly_stats))
        .route("/stats/server/{id}", get(server_stats))
        .route("/loadbalancer/status", get(balancer_status))
        .route("/loadbalancer/algorithm", put(set_algorithm))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_auth,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .nest("/api", api)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "healthy" })),
    )
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> String {
    state
        .metrics_handle
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default()
}

// --- Tasks ---

/// POST /api/task — create a task under a fresh id.
async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<Json<TaskSnapshot>, ApiError> {
    if request.task_type.trim().is_empty() {
        return Err(GatewayError::Validation("type must not be empty".into()).into());
    }
    if let Some(priority) = request.priority {
        if priority > 10 {
            return Err(
                GatewayError::Validation("priority must be between 0 and 10".into()).into(),
            );
        }
    }

    let id = TaskId::generate();
    let instance = state.runtime.task_instance(&id).await;
    let task = instance.create_task(request.into_request()).await?;

    Ok(Json(TaskSnapshot::from(&task)))
}

/// GET /api/task/{id} — task snapshot.
async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> Result<Json<TaskSnapshot>, ApiError> {
    let instance = state
        .runtime
        .existing_task_instance(&id)
        .await
        .ok_or_else(|| GatewayError::NotFound(format!("task {} not found", id)))?;

    let task = instance.get_status().await?;
    Ok(Json(TaskSnapshot::from(&task)))
}

/// PUT /api/task/{id} — worker callback delivering progress or the result.
async fn update_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
    Json(update): Json<TaskUpdate>,
) -> Result<Json<TaskSnapshot>, ApiError> {
    let instance = state
        .runtime
        .existing_task_instance(&id)
        .await
        .ok_or_else(|| GatewayError::NotFound(format!("task {} not found", id)))?;

    let task = instance.update_task(update).await?;
    Ok(Json(TaskSnapshot::from(&task)))
}

/// POST /api/task/{id}/retry
async fn retry_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> Result<Json<ActionResponse>, ApiError> {
    let instance = state
        .runtime
        .existing_task_instance(&id)
        .await
        .ok_or_else(|| GatewayError::NotFound(format!("task {} not found", id)))?;

    let retried = instance.retry().await;
    Ok(Json(ActionResponse {
        success: retried,
        message: if retried {
            "Task retry started".into()
        } else {
            "Task is not eligible for retry".into()
        },
    }))
}

/// POST /api/task/{id}/cancel
async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TaskId>,
) -> Result<Json<ActionResponse>, ApiError> {
    let instance = state
        .runtime
        .existing_task_instance(&id)
        .await
        .ok_or_else(|| GatewayError::NotFound(format!("task {} not found", id)))?;

    instance.cancel().await?;
    Ok(Json(ActionResponse {
        success: true,
        message: "Task cancelled".into(),
    }))
}

// --- Servers ---

/// POST /api/servers — admin only.
async fn register_server(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(request): Json<RegisterServerRequest>,
) -> Result<Json<RegisterServerResponse>, ApiError> {
    auth::require_admin(&claims)?;

    let server_id = state.runtime.registry().register_server(request).await?;
    Ok(Json(RegisterServerResponse {
        server_id,
        message: "Server registered".into(),
    }))
}

/// GET /api/servers?status=&group=
async fn list_servers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ServerListQuery>,
) -> Result<Json<ServerListResponse>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(ServerStatus::from_str)
        .transpose()
        .map_err(GatewayError::Validation)?;

    let servers = state
        .runtime
        .registry()
        .get_available_servers(ServerFilter {
            status,
            group: query.group,
            max_age_ms: None,
        })
        .await?;

    Ok(Json(ServerListResponse { servers }))
}

/// POST /api/servers/{id}/heartbeat
async fn server_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ServerId>,
) -> Result<Json<SuccessResponse>, ApiError> {
    state.runtime.registry().update_heartbeat(&id).await?;
    Ok(Json(SuccessResponse::ok()))
}

/// DELETE /api/servers/{id} — admin only.
async fn unregister_server(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<ServerId>,
) -> Result<Json<SuccessResponse>, ApiError> {
    auth::require_admin(&claims)?;

    state.runtime.registry().unregister_server(&id).await?;
    Ok(Json(SuccessResponse::ok()))
}

/// PUT /api/servers/{id}/maintenance — admin only.
async fn server_maintenance(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<ServerId>,
    Json(request): Json<MaintenanceRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    auth::require_admin(&claims)?;

    let instance = state
        .runtime
        .existing_server_instance(&id)
        .await
        .ok_or_else(|| GatewayError::NotFound(format!("server {} not found", id)))?;

    instance.set_maintenance_mode(request.enabled).await?;
    Ok(Json(SuccessResponse::ok()))
}

/// GET /api/servers/{id}/metrics
async fn server_metrics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ServerId>,
) -> Result<Json<ServerMetrics>, ApiError> {
    let instance = state
        .runtime
        .existing_server_instance(&id)
        .await
        .ok_or_else(|| GatewayError::NotFound(format!("server {} not found", id)))?;

    Ok(Json(instance.get_metrics().await))
}

// --- Statistics ---

fn resolve_date(query: &StatsQuery) -> Result<NaiveDate, ApiError> {
    match query.date.as_deref() {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
            GatewayError::Validation(format!("invalid date: {} (expected YYYY-MM-DD)", raw)).into()
        }),
        None => Ok(Utc::now().date_naive()),
    }
}

/// GET /api/stats?date=
async fn day_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Statistics>, ApiError> {
    let date = resolve_date(&query)?;
    let aggregator = state.runtime.stats_for(date).await;
    Ok(Json(aggregator.get_stats().await))
}

/// GET /api/stats/hourly?date=
async fn hourly_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<HourlyReport>, ApiError> {
    let date = resolve_date(&query)?;
    let aggregator = state.runtime.stats_for(date).await;
    Ok(Json(HourlyReport {
        date: date.format("%Y-%m-%d").to_string(),
        hours: aggregator.get_hourly_report().await,
    }))
}

/// GET /api/stats/server/{id} — today's rollup for one server.
async fn server_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<ServerId>,
) -> Result<Json<ServerStatistics>, ApiError> {
    let aggregator = state.runtime.stats_today().await;
    Ok(Json(aggregator.get_server_stats(&id).await))
}

// --- Load balancer ---

/// GET /api/loadbalancer/status
async fn balancer_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<BalancerStatus>, ApiError> {
    Ok(Json(state.runtime.balancer().status().await))
}

/// PUT /api/loadbalancer/algorithm
async fn set_algorithm(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SetAlgorithmRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let algorithm =
        BalancerAlgorithm::from_str(&request.algorithm).map_err(GatewayError::Validation)?;

    state.runtime.balancer().set_algorithm(algorithm).await;
    Ok(Json(SuccessResponse::ok()))
}
