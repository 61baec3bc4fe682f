//! HTTP API for health checks, status, and monitoring

use crate::config::ApiConfig;
use crate::error::BridgeResult;
use crate::ledger::{BridgeStatus, Ledger};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn Ledger>,
    pub started_at: DateTime<Utc>,
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, ledger: Arc<dyn Ledger>) -> BridgeResult<()> {
    let state = AppState {
        ledger,
        started_at: Utc::now(),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/stats", get(get_stats))
        .route("/tx/:id", get(get_transaction))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify the ledger is reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let ledger_ok = state.ledger.health_check().await.is_ok();

    let status = if ledger_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: ledger_ok,
            ledger: ledger_ok,
        }),
    )
}

/// Service status snapshot
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds().max(0) as u64,
    })
}

/// Per-status transaction counts
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.ledger.stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "stats unavailable".to_string(),
            }),
        )
            .into_response(),
    }
}

/// Status snapshot for a single transaction. Read-only.
async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.ledger.get(&id).await {
        Ok(Some(tx)) => (
            StatusCode::OK,
            Json(TransactionResponse {
                id: tx.id,
                status: tx.status,
                source_amount: tx.source_amount,
                net_amount: tx.net_amount,
                destination_address: tx.destination_address,
                deposit_locus: tx.deposit_locus,
                hold_reason: tx.hold_reason,
                source_tx_ref: tx.source_tx_ref,
                settlement_tx_ref: tx.settlement_tx_ref,
                created_at: tx.created_at,
                detected_at: tx.detected_at,
                completed_at: tx.completed_at,
            }),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("transaction {} not found", id),
            }),
        )
            .into_response(),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "lookup failed".to_string(),
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
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    ledger: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
}

#[derive(Serialize)]
struct TransactionResponse {
    id: String,
    status: BridgeStatus,
    source_amount: Decimal,
    net_amount: Decimal,
    destination_address: String,
    deposit_locus: String,
    hold_reason: Option<String>,
    source_tx_ref: Option<String>,
    settlement_tx_ref: Option<String>,
    created_at: DateTime<Utc>,
    detected_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}
