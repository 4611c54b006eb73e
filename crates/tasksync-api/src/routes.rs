use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tasksync_core::util::user_fingerprint;
use tasksync_core::{PullRequest, PullResponse, PushOutcome, SyncStore};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{extract_bearer_token, AuthenticatedUser, JwtVerifier};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::rate_limit::{EndpointRateLimiter, ProtectedEndpoint, RateLimitMetricsSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    store: SyncStore,
    jwt_verifier: Arc<JwtVerifier>,
    endpoint_rate_limiter: Arc<EndpointRateLimiter>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, store: SyncStore) -> Self {
        Self {
            store,
            jwt_verifier: Arc::new(JwtVerifier::new(config.clone())),
            endpoint_rate_limiter: Arc::new(EndpointRateLimiter::from_config(config.as_ref())),
            config,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/sync/push", post(push_changes))
        .route("/sync/pull", get(pull_changes))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    rate_limit: RateLimitMetricsSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        rate_limit: state.endpoint_rate_limiter.metrics_snapshot(),
    })
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?;
    let user = state.jwt_verifier.verify_access_token(token)?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

async fn push_changes(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<PushOutcome>, AppError> {
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::Push, &user.user_id)
        .await?;

    let Json(payload) = payload.map_err(|rejection| AppError::bad_request(rejection.body_text()))?;
    let outcome = state.store.push(&user.user_id, &payload).await?;

    tracing::info!(
        endpoint = "sync_push",
        user = user_fingerprint(&user.user_id),
        session = user.session_id.as_deref().unwrap_or("none"),
        items = outcome.results.len(),
        transactional = outcome.transactional,
        "Accepted push"
    );
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct PullQuery {
    device_id: Option<String>,
    since: Option<String>,
}

async fn pull_changes(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<PullQuery>,
) -> Result<Json<PullResponse>, AppError> {
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::Pull, &user.user_id)
        .await?;

    let request = PullRequest::parse(query.device_id.as_deref(), query.since.as_deref())?;
    let response = state.store.pull(&user.user_id, &request).await?;

    tracing::info!(
        endpoint = "sync_pull",
        user = user_fingerprint(&user.user_id),
        session = user.session_id.as_deref().unwrap_or("none"),
        changes = response.changes.len(),
        has_more = response.has_more,
        "Served pull"
    );
    Ok(Json(response))
}
