//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Orchestrator population
//! - Transaction acceptance, submission and confirmation
//! - Gas-price bumps and fueling transfers

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Encoder, Gauge, Histogram, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

use crate::error::{EngineError, EngineResult};

lazy_static! {
    pub static ref ORCHESTRATORS_ACTIVE: Gauge = register_gauge!(
        "txpilot_orchestrators_active",
        "Live per-signer orchestrators"
    )
    .unwrap();

    pub static ref TXS_ACCEPTED: CounterVec = register_counter_vec!(
        "txpilot_transactions_accepted_total",
        "Transactions accepted by the engine",
        &["kind"]
    )
    .unwrap();

    pub static ref TXS_SUBMITTED: Counter = register_counter!(
        "txpilot_submissions_total",
        "Raw transaction submissions to the ledger, including replacements"
    )
    .unwrap();

    pub static ref GAS_BUMPS: Counter = register_counter!(
        "txpilot_gas_bumps_total",
        "Gas-price bump replacements"
    )
    .unwrap();

    pub static ref TXS_CONFIRMED: CounterVec = register_counter_vec!(
        "txpilot_transactions_confirmed_total",
        "Transactions reaching a terminal status",
        &["result"]
    )
    .unwrap();

    pub static ref CONFIRMATIONS_DISPATCHED: Counter = register_counter!(
        "txpilot_confirmations_dispatched_total",
        "Indexed confirmations dispatched to orchestrators"
    )
    .unwrap();

    pub static ref FUELING_TRANSFERS: Counter = register_counter!(
        "txpilot_fueling_transfers_total",
        "Treasury auto-fueling transfers submitted"
    )
    .unwrap();

    pub static ref CONFIRMATION_LATENCY: Histogram = register_histogram!(
        "txpilot_confirmation_latency_seconds",
        "Time from acceptance to terminal status",
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    )
    .unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> EngineResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|err| EngineError::Internal(err.to_string()))?;
        axum::serve(listener, app)
            .await
            .map_err(|err| EngineError::Internal(err.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// Helper functions to record metrics

pub fn record_orchestrators(count: usize) {
    ORCHESTRATORS_ACTIVE.set(count as f64);
}

pub fn record_tx_accepted(fueling: bool) {
    let kind = if fueling { "fueling" } else { "request" };
    TXS_ACCEPTED.with_label_values(&[kind]).inc();
}

pub fn record_tx_submitted() {
    TXS_SUBMITTED.inc();
}

pub fn record_gas_bump() {
    GAS_BUMPS.inc();
}

pub fn record_tx_final(result: &str) {
    TXS_CONFIRMED.with_label_values(&[result]).inc();
}

pub fn record_confirmations(count: usize) {
    CONFIRMATIONS_DISPATCHED.inc_by(count as f64);
}

pub fn record_fueling_transfer() {
    FUELING_TRANSFERS.inc();
}

pub fn record_confirmation_latency(seconds: f64) {
    CONFIRMATION_LATENCY.observe(seconds);
}
