mod cache;
mod config;
mod http;
mod idempotency;
mod jobs;
mod metrics;
mod models;
mod pipeline;
mod profit;
mod providers;
mod ratelimit;
mod redis_store;
mod security;
mod supabase;
mod writer;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Extension, Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use cache::ResponseCache;
use config::{PipelineConfig, env_or, parse_env_bool};
use eyre::WrapErr;
use idempotency::IdempotencyStore;
use jobs::{Job, JobQueue, JobTracker, RunOutcome};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{AnalysisRequest, ApiError};
use pipeline::{Orchestrator, PipelineError, PipelineErrorKind, RunOptions, prepare_candidates};
use providers::{
    Provider, ProviderClient, keepa::KeepaClient, simulated::SimulatedClient, spapi::SpApiClient,
};
use ratelimit::RateLimiter;
use redis_store::RedisHandle;
use security::{AuthContext, AuthState, require_api_auth};
use serde::Serialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;
use writer::{MemoryWriter, ResultWriter, SupabaseWriter};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "sourcing.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Arc::new(PipelineConfig::from_env());
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|url| RedisHandle::open(&url));
    let limiter = Arc::new(RateLimiter::from_config(&config));
    let cache = Arc::new(ResponseCache::new(&config.cache).with_redis(redis.clone()));
    let (cheap, expensive) = build_providers();
    let writer = build_writer();
    let tracker = JobTracker::new(config.max_job_errors);

    let orchestrator = Orchestrator::new(
        config.clone(),
        limiter,
        cache.clone(),
        cheap,
        expensive,
        writer,
        tracker,
    );
    let (queue, _worker) = JobQueue::spawn(orchestrator.clone(), env_or("QUEUE_CAPACITY", 64usize));
    spawn_sweeps(
        cache,
        queue.tracker().clone(),
        Duration::from_secs(env_or("CACHE_SWEEP_SECS", 300u64).max(1)),
        Duration::from_secs(env_or("JOB_RETENTION_SECS", 86_400u64)),
    );

    let openapi: serde_json::Value = serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or_else(|_| json!({"openapi": "3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;

    let state = AppState {
        orchestrator,
        queue,
        idempotency: Arc::new(IdempotencyStore::new(
            redis,
            Duration::from_secs(env_or("IDEMPOTENCY_TTL_SECS", 86_400u64)),
        )),
        openapi: Arc::new(openapi),
        prometheus_handle,
        max_sync_items: env_or("MAX_SYNC_ITEMS", 100usize).max(1),
    };

    let protected = Router::new()
        .route("/analyses", post(create_analysis))
        .nest(
            "/jobs",
            Router::new()
                .route("/analyses", post(enqueue_analysis_job))
                .route("/{id}", get(get_job_status))
                .route("/{id}/cancel", post(cancel_job)),
        )
        .route_layer(middleware::from_fn_with_state(
            AuthState::from_env(),
            require_api_auth,
        ));

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .merge(protected)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(DefaultBodyLimit::max(
                    env_or("REQUEST_MAX_BYTES", 2 * 1024 * 1024usize).max(1024),
                )),
        );

    let port: u16 = env_or("PORT", 8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "sourcing.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

/// Real providers when credentials are present, simulated otherwise or when
/// `DEMO_MODE` is set.
fn build_providers() -> (Arc<dyn ProviderClient>, Arc<dyn ProviderClient>) {
    let demo = parse_env_bool("DEMO_MODE");
    let cheap: Arc<dyn ProviderClient> = match KeepaClient::from_env().filter(|_| !demo) {
        Some(client) => Arc::new(client),
        None => {
            warn!(target = "sourcing.provider", provider = "keepa", "using simulated provider");
            Arc::new(SimulatedClient::new(Provider::Keepa))
        }
    };
    let expensive: Arc<dyn ProviderClient> = match SpApiClient::from_env().filter(|_| !demo) {
        Some(client) => Arc::new(client),
        None => {
            warn!(target = "sourcing.provider", provider = "sp_api", "using simulated provider");
            Arc::new(SimulatedClient::new(Provider::SpApi))
        }
    };
    (cheap, expensive)
}

fn build_writer() -> Arc<dyn ResultWriter> {
    match supabase::SupabaseClient::from_env() {
        Some(client) => {
            info!(target = "sourcing.writer", "persisting analyses to supabase");
            Arc::new(SupabaseWriter::new(client))
        }
        None => {
            warn!(target = "sourcing.writer", "SUPABASE_URL not set; analyses kept in memory");
            Arc::new(MemoryWriter::new())
        }
    }
}

/// Periodically purges expired cache entries and evicts finished jobs older
/// than `job_retention`.
fn spawn_sweeps(
    cache: Arc<ResponseCache>,
    tracker: JobTracker,
    every: Duration,
    job_retention: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let purged = cache.purge_expired().await;
            if purged > 0 {
                info!(target = "sourcing.cache", purged, "cache_sweep");
            }
            let evicted = tracker.prune_finished(job_retention).await;
            if evicted > 0 {
                info!(target = "sourcing.jobs", evicted, "job_sweep");
            }
        }
    });
}

#[derive(Clone)]
struct AppState {
    orchestrator: Orchestrator,
    queue: JobQueue,
    idempotency: Arc<IdempotencyStore>,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
    max_sync_items: usize,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "sourcing-pipeline-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(PipelineError::invalid_input("docs", "unauthorized").into());
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

fn run_options(config: &PipelineConfig, request: &AnalysisRequest) -> Result<RunOptions, AppError> {
    let mut options = RunOptions::from_config(config);
    if let Some(min_roi) = request.min_roi_percent {
        if !min_roi.is_finite() {
            return Err(PipelineError::invalid_input("intake", "min_roi_percent must be a number").into());
        }
        options.min_roi_percent = min_roi;
    }
    if let Some(marketplace) = request.marketplace {
        options.marketplace = marketplace;
    }
    Ok(options)
}

/// Analyse a small batch synchronously.
///
/// - Method: `POST`
/// - Path: `/analyses`
/// - Auth: `Authorization: Bearer <key>` or `X-Api-Key: <key>`
/// - Body: `AnalysisRequest`
/// - Response: final job snapshot plus one record per distinct lookup key
async fn create_analysis(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<AnalysisRequest>,
) -> Result<Json<RunOutcome>, AppError> {
    crate::metrics::inc_requests("/analyses");
    if payload.items.len() > state.max_sync_items {
        return Err(PipelineError::invalid_input(
            "intake",
            format!(
                "{} items exceeds the synchronous limit of {}; use /jobs/analyses",
                payload.items.len(),
                state.max_sync_items
            ),
        )
        .into());
    }
    let mut options = run_options(state.orchestrator.config(), &payload)?;
    options.collect_results = true;
    let products = prepare_candidates(&context.owner_id, payload.items)?;
    info!(
        target = "sourcing.api",
        owner_id = %context.owner_id,
        api_key = %context.api_key_id,
        items = products.len(),
        "sync analysis invoked"
    );
    let outcome = state
        .orchestrator
        .run_now(&context.owner_id, products, options)
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
    deduplicated: bool,
}

/// Queue a batch of any size.
///
/// - Method: `POST`
/// - Path: `/jobs/analyses`
/// - Headers: optional `Idempotency-Key`; a repeated key returns the original job
/// - Response: `202` with `job_id`
async fn enqueue_analysis_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: HeaderMap,
    Json(payload): Json<AnalysisRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    crate::metrics::inc_requests("/jobs/analyses");
    let options = run_options(state.orchestrator.config(), &payload)?;
    let products = prepare_candidates(&context.owner_id, payload.items)?;

    let key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let enqueued = state
        .queue
        .enqueue_idempotent(&state.idempotency, &context.owner_id, key, products, options)
        .await
        .map_err(|err| PipelineError::internal("enqueue", err.error))?;
    let status = if enqueued.deduplicated {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((
        status,
        Json(EnqueueResponse {
            job_id: enqueued.job_id.to_string(),
            deduplicated: enqueued.deduplicated,
        }),
    ))
}

fn parse_job_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| PipelineError::invalid_input("jobs", "invalid_job_id").into())
}

async fn get_job_status(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<Job>, AppError> {
    let id = parse_job_id(&id)?;
    state
        .queue
        .tracker()
        .get_for_owner(id, &context.owner_id)
        .await
        .map(Json)
        .ok_or_else(|| PipelineError::not_found("jobs", "not_found").into())
}

async fn cancel_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<Job>, AppError> {
    crate::metrics::inc_requests("/jobs/cancel");
    let id = parse_job_id(&id)?;
    let tracker = state.queue.tracker();
    let current = tracker
        .get_for_owner(id, &context.owner_id)
        .await
        .ok_or_else(|| AppError::from(PipelineError::not_found("jobs", "not_found")))?;
    if current.status.is_terminal() {
        return Err(PipelineError::invalid_input("jobs", "job_already_finished").into());
    }
    tracker
        .cancel(id, &context.owner_id)
        .await
        .map(Json)
        .ok_or_else(|| PipelineError::not_found("jobs", "not_found").into())
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::NotFound => StatusCode::NOT_FOUND,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
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
