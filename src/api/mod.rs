//! HTTP API for health checks, status, and monitoring

use crate::chain::Chain;
use crate::config::ApiConfig;
use crate::error::{ReconcilerError, ReconcilerResult};
use crate::lock::LockStore;
use crate::metrics;
use crate::state::OrderStore;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orders: Arc<dyn OrderStore>,
    pub locks: LockStore,
    pub chains: Vec<Chain>,
    pub max_callback_attempts: i32,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/chains", get(get_chains))
        .route("/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> ReconcilerResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ReconcilerError::Internal(format!("API bind {}: {}", addr, e)))?;
    axum::serve(listener, router(state))
        .await
        .map_err(|e| ReconcilerError::Internal(format!("API server: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

/// Readiness check - database and lock cache reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.orders.health_check().await.is_ok();
    let cache = state.locks.health_check().await.is_ok();

    if !database {
        metrics::record_health_check_failure("database");
    }
    if !cache {
        metrics::record_health_check_failure("cache");
    }

    let ready = database && cache;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            database,
            cache,
        }),
    )
}

async fn get_chains(State(state): State<AppState>) -> impl IntoResponse {
    Json(ChainsResponse {
        chains: state
            .chains
            .iter()
            .map(|c| ChainInfo {
                prefix: c.prefix(),
                name: c.display_name(),
            })
            .collect(),
    })
}

/// Order counts by status
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.orders.stats(state.max_callback_attempts).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    cache: bool,
}

#[derive(Serialize)]
struct ChainInfo {
    prefix: &'static str,
    name: &'static str,
}

#[derive(Serialize)]
struct ChainsResponse {
    chains: Vec<ChainInfo>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}
