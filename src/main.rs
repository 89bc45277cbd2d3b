mod config;
mod diff;
mod export;
mod feed;
mod http;
mod idempotency;
mod jobs;
mod metrics;
mod models;
mod photos;
mod security;
mod sources;
mod supabase;
mod sync;

use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use config::SyncConfig;
use models::{ApiError, PhotoSyncRequest, PhotoSyncResponse, SyncRequest, SyncResponse};
use security::{AuthContext, AuthState, require_api_auth};
use serde::Serialize;
use serde_json::json;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use supabase::SupabaseClient;
use sync::{Orchestrator, SyncError, SyncErrorKind};
use tokio::sync::Mutex;
// metrics macros disabled in demo build
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "sync.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let auth_state = AuthState::from_env();
    let config = Arc::new(SyncConfig::from_env());
    let supabase = Arc::new(
        SupabaseClient::from_env()
            .ok_or("SUPABASE_URL and a service key are required to start")?,
    );
    let orchestrator = Arc::new(Orchestrator::new(config, supabase));
    let (queue, _worker) = jobs::JobQueue::spawn(orchestrator.clone());
    let openapi: serde_json::Value =
        serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
            .unwrap_or(serde_json::json!({"openapi":"3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| format!("prometheus recorder: {err}"))?;
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|u| redis::Client::open(u).ok());
    let state = AppState {
        orchestrator,
        queue,
        openapi: Arc::new(openapi),
        idempotency: Arc::new(Mutex::new(HashMap::new())),
        prometheus_handle,
        redis,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .nest(
            "/sync",
            Router::new()
                .route("/{source}", post(run_sync).get(sync_status))
                .route("/{source}/photos", post(run_photo_sync)),
        )
        .nest(
            "/jobs",
            Router::new()
                .route("/sync/{source}", post(enqueue_sync_job))
                .route("/{id}", get(get_job_status)),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "sync.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    queue: jobs::JobQueue,
    openapi: Arc<serde_json::Value>,
    idempotency: Arc<Mutex<HashMap<String, SyncResponse>>>,
    prometheus_handle: PrometheusHandle,
    redis: Option<redis::Client>,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "driveby-sync-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::from(SyncError::invalid_input(
                "docs",
                "unauthorized",
            )));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Sync API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(axum::http::StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

/// Run a sync for one source and wait for its stats.
///
/// - Method: `POST`
/// - Path: `/sync/{source}` where source is `korea` | `china` | `dubai`
/// - Auth: `Authorization: Bearer <key>` or `X-Sync-Key: <key>`
/// - Body: `SyncRequest`
/// - Response: `SyncResponse`
///
/// `Idempotency-Key` replays the stored response instead of re-running.
async fn run_sync(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(source): Path<String>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, AppError> {
    crate::metrics::inc_requests("/sync");
    info!(
        target = "sync.api",
        operator = %context.operator,
        api_key = %context.api_key_id,
        source = %source,
        "sync invoked",
    );

    if let Some(key) = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        if let Some(client) = &state.redis {
            if let Some(existing) = idempotency::redis_get(client, &key).await {
                return Ok(Json(existing));
            }
            let response = state.orchestrator.run(&source, payload).await?;
            let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(3600);
            idempotency::redis_set(client, &key, &response, ttl).await;
            return Ok(Json(response));
        }
        if let Some(existing) = state.idempotency.lock().await.get(&key).cloned() {
            return Ok(Json(existing));
        }
        let response = state.orchestrator.run(&source, payload).await?;
        state.idempotency.lock().await.insert(key, response.clone());
        return Ok(Json(response));
    }

    let response = state.orchestrator.run(&source, payload).await?;
    Ok(Json(response))
}

/// Cursor and counters of one source.
///
/// - Method: `GET`
/// - Path: `/sync/{source}`
async fn sync_status(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> Result<Json<supabase::Checkpoint>, AppError> {
    crate::metrics::inc_requests("/sync/status");
    let checkpoint = state.orchestrator.status(&source).await?;
    Ok(Json(checkpoint))
}

/// Re-host expiring photos from the latest export file.
///
/// - Method: `POST`
/// - Path: `/sync/{source}/photos`
/// - Body: `PhotoSyncRequest`
async fn run_photo_sync(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(source): Path<String>,
    Json(payload): Json<PhotoSyncRequest>,
) -> Result<Json<PhotoSyncResponse>, AppError> {
    crate::metrics::inc_requests("/sync/photos");
    info!(
        target = "sync.api",
        operator = %context.operator,
        source = %source,
        dry_run = payload.dry_run,
        "photo sync invoked",
    );
    let response = state.orchestrator.refresh_photos(&source, payload).await?;
    Ok(Json(response))
}

#[derive(Debug)]
enum AppError {
    Sync(SyncError),
}

impl From<SyncError> for AppError {
    fn from(value: SyncError) -> Self {
        Self::Sync(value)
    }
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

/// Queue a sync in the background and return its job id.
async fn enqueue_sync_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(source): Path<String>,
    Json(payload): Json<SyncRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/sync");
    info!(
        target = "sync.api",
        operator = %context.operator,
        source = %source,
        "sync job enqueued",
    );
    let id = state
        .queue
        .enqueue_sync(source, payload)
        .await
        .map_err(|err| AppError::from(SyncError::internal("enqueue", err.error)))?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::from(SyncError::invalid_input(
            "jobs",
            "invalid_job_id",
        )));
    };
    if let Some(info) = state.queue.get(uuid).await {
        Ok(Json(info))
    } else {
        Err(AppError::from(SyncError::invalid_input("jobs", "not_found")))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Sync(err) => {
                let status = match err.kind() {
                    SyncErrorKind::InvalidInput | SyncErrorKind::MalformedRecord => {
                        StatusCode::BAD_REQUEST
                    }
                    SyncErrorKind::ExportUnavailable => StatusCode::NOT_FOUND,
                    SyncErrorKind::Auth => StatusCode::BAD_GATEWAY,
                    SyncErrorKind::RateLimited | SyncErrorKind::TransientNetwork => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    SyncErrorKind::StorageUpload | SyncErrorKind::Internal => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.to_string()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
