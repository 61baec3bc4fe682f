//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Transaction lifecycle progress
//! - Deposit detection and reorg reverts
//! - Settlement outcomes
//! - Chain and store health

use crate::error::BridgeResult;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_gauge, register_gauge_vec, register_histogram, Counter, Encoder,
    Gauge, GaugeVec, Histogram, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Lifecycle metrics
    pub static ref TRANSACTIONS_OPENED: Counter = register_counter!(
        "conduit_transactions_opened_total",
        "Total bridge transactions opened"
    ).unwrap();

    pub static ref DEPOSITS_DETECTED: Counter = register_counter!(
        "conduit_deposits_detected_total",
        "Total deposits detected at a locus"
    ).unwrap();

    pub static ref DEPOSITS_CONFIRMED: Counter = register_counter!(
        "conduit_deposits_confirmed_total",
        "Total deposits that reached confirmation depth"
    ).unwrap();

    pub static ref AMOUNT_MISMATCHES: Counter = register_counter!(
        "conduit_amount_mismatches_total",
        "Deposits held for review due to amount mismatch"
    ).unwrap();

    pub static ref REORG_REVERTS: Counter = register_counter!(
        "conduit_reorg_reverts_total",
        "Confirming transactions reverted by a reorg"
    ).unwrap();

    pub static ref TRANSACTIONS_EXPIRED: Counter = register_counter!(
        "conduit_transactions_expired_total",
        "Transactions expired with no deposit"
    ).unwrap();

    // Settlement metrics
    pub static ref SETTLEMENTS_SUBMITTED: Counter = register_counter!(
        "conduit_settlements_submitted_total",
        "Destination releases submitted"
    ).unwrap();

    pub static ref SETTLEMENTS_COMPLETED: Counter = register_counter!(
        "conduit_settlements_completed_total",
        "Destination releases confirmed"
    ).unwrap();

    pub static ref SETTLEMENTS_FAILED: Counter = register_counter!(
        "conduit_settlements_failed_total",
        "Settlements that failed permanently"
    ).unwrap();

    // Watcher metrics
    pub static ref WATCH_CYCLE_SECONDS: Histogram = register_histogram!(
        "conduit_watch_cycle_seconds",
        "Deposit watcher cycle duration",
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    // Session metrics
    pub static ref SESSIONS_OPEN: Gauge = register_gauge!(
        "conduit_sessions_open",
        "Intake sessions currently open"
    ).unwrap();

    // Health metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "conduit_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain"]
    ).unwrap();

    pub static ref HEALTH_CHECK_SUCCESS: Counter = register_counter!(
        "conduit_health_check_success_total",
        "Total successful health checks"
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: Counter = register_counter!(
        "conduit_health_check_failure_total",
        "Total failed health checks"
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> BridgeResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
        axum::serve(listener, app).await.unwrap();

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

// Helper functions to record metrics

pub fn record_transaction_opened() {
    TRANSACTIONS_OPENED.inc();
}

pub fn record_deposit_detected() {
    DEPOSITS_DETECTED.inc();
}

pub fn record_deposit_confirmed() {
    DEPOSITS_CONFIRMED.inc();
}

pub fn record_amount_mismatch() {
    AMOUNT_MISMATCHES.inc();
}

pub fn record_reorg_revert() {
    REORG_REVERTS.inc();
}

pub fn record_transaction_expired() {
    TRANSACTIONS_EXPIRED.inc();
}

pub fn record_settlement_submitted() {
    SETTLEMENTS_SUBMITTED.inc();
}

pub fn record_settlement_completed() {
    SETTLEMENTS_COMPLETED.inc();
}

pub fn record_settlement_failed() {
    SETTLEMENTS_FAILED.inc();
}

pub fn record_sessions_open(count: usize) {
    SESSIONS_OPEN.set(count as f64);
}

pub fn record_chain_health(chain: &str, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.inc();
}
