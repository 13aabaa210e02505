//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Scan activity per chain
//! - Matches and integrity violations
//! - Scheduler ticks and job durations
//! - Callback delivery

use crate::chain::Chain;
use crate::error::{ReconcilerError, ReconcilerResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Scan metrics
    pub static ref SCANS: CounterVec = register_counter_vec!(
        "chainpay_scans_total",
        "Explorer scans by outcome",
        &["chain", "outcome"]
    ).unwrap();

    pub static ref SCANS_SKIPPED: CounterVec = register_counter_vec!(
        "chainpay_scans_skipped_total",
        "Scans skipped because the wallet had no live lock",
        &["chain"]
    ).unwrap();

    pub static ref CANDIDATES: CounterVec = register_counter_vec!(
        "chainpay_candidate_transfers_total",
        "Transfers that passed the chain filter",
        &["chain"]
    ).unwrap();

    // Matching metrics
    pub static ref MATCHES: CounterVec = register_counter_vec!(
        "chainpay_matches_total",
        "Mark-paid results for matched transfers",
        &["chain", "outcome"]
    ).unwrap();

    pub static ref CAUSALITY_VIOLATIONS: CounterVec = register_counter_vec!(
        "chainpay_causality_violations_total",
        "Matched transfers older than their order",
        &["chain"]
    ).unwrap();

    pub static ref ORDERS_EXPIRED: CounterVec = register_counter_vec!(
        "chainpay_orders_expired_total",
        "Orders moved to Expired by the sweep",
        &[]
    ).unwrap();

    // Scheduler metrics
    pub static ref TICKS_DROPPED: CounterVec = register_counter_vec!(
        "chainpay_ticks_dropped_total",
        "Ticks dropped because the previous run was still in flight",
        &["job"]
    ).unwrap();

    pub static ref TASK_FAILURES: CounterVec = register_counter_vec!(
        "chainpay_task_failures_total",
        "Fanned-out tasks that failed or panicked",
        &["job"]
    ).unwrap();

    pub static ref JOB_DURATION: HistogramVec = register_histogram_vec!(
        "chainpay_job_duration_seconds",
        "Wall time of one job invocation",
        &["job"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 30.0, 60.0]
    ).unwrap();

    // Callback metrics
    pub static ref CALLBACK_ATTEMPTS: CounterVec = register_counter_vec!(
        "chainpay_callback_attempts_total",
        "Merchant callback deliveries by outcome",
        &["outcome"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "chainpay_health_check_failure_total",
        "Total failed health checks",
        &["component"]
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

    pub async fn run(&self) -> ReconcilerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| ReconcilerError::Internal(format!("Metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| ReconcilerError::Internal(format!("Metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_scan(chain: Chain, ok: bool) {
    SCANS
        .with_label_values(&[chain.prefix(), if ok { "ok" } else { "failed" }])
        .inc();
}

pub fn record_scan_skipped(chain: Chain) {
    SCANS_SKIPPED.with_label_values(&[chain.prefix()]).inc();
}

pub fn record_candidates(chain: Chain, count: usize) {
    CANDIDATES
        .with_label_values(&[chain.prefix()])
        .inc_by(count as f64);
}

pub fn record_match(chain: Chain, outcome: &str) {
    MATCHES.with_label_values(&[chain.prefix(), outcome]).inc();
}

pub fn record_causality_violation(chain: Chain) {
    CAUSALITY_VIOLATIONS
        .with_label_values(&[chain.prefix()])
        .inc();
}

pub fn record_order_expired() {
    ORDERS_EXPIRED.with_label_values(&[]).inc();
}

pub fn record_tick_dropped(job: &str) {
    TICKS_DROPPED.with_label_values(&[job]).inc();
}

pub fn record_task_failure(job: &str) {
    TASK_FAILURES.with_label_values(&[job]).inc();
}

pub fn record_job_duration(job: &str, secs: f64) {
    JOB_DURATION.with_label_values(&[job]).observe(secs);
}

pub fn record_callback_attempt(outcome: &str) {
    CALLBACK_ATTEMPTS.with_label_values(&[outcome]).inc();
}

pub fn record_health_check_failure(component: &str) {
    HEALTH_CHECK_FAILURE.with_label_values(&[component]).inc();
}
