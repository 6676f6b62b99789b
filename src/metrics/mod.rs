//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain health per side
//! - Reconcile passes and protocol violations
//! - Chain writes and their latency
//! - Swaps by terminal outcome

use crate::error::{SwapError, SwapResult};
use crate::swap::{ChainSide, Role};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_HEALTHY: GaugeVec = register_gauge_vec!(
        "swap_agent_chain_healthy",
        "Chain RPC health (1=healthy, 0=unreachable)",
        &["chain"]
    ).expect("register swap_agent_chain_healthy");

    // Reconciler metrics
    pub static ref RECONCILE_PASSES: CounterVec = register_counter_vec!(
        "swap_agent_reconcile_passes_total",
        "Reconcile passes by result",
        &["result"]
    ).expect("register swap_agent_reconcile_passes_total");

    pub static ref PROTOCOL_VIOLATIONS: CounterVec = register_counter_vec!(
        "swap_agent_protocol_violations_total",
        "Protocol violations detected, by error",
        &["error"]
    ).expect("register swap_agent_protocol_violations_total");

    // Write metrics
    pub static ref CHAIN_WRITES: CounterVec = register_counter_vec!(
        "swap_agent_chain_writes_total",
        "Chain writes by chain, operation and outcome",
        &["chain", "operation", "outcome"]
    ).expect("register swap_agent_chain_writes_total");

    pub static ref WRITE_LATENCY: HistogramVec = register_histogram_vec!(
        "swap_agent_write_latency_seconds",
        "Time from submission to confirmed receipt",
        &["chain"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).expect("register swap_agent_write_latency_seconds");

    // Swap metrics
    pub static ref SWAP_OUTCOMES: CounterVec = register_counter_vec!(
        "swap_agent_swaps_total",
        "Swaps by role and final state",
        &["role", "outcome"]
    ).expect("register swap_agent_swaps_total");

    pub static ref ACTIVE_SWAPS: GaugeVec = register_gauge_vec!(
        "swap_agent_active_swaps",
        "Swaps currently driven by an agent loop",
        &["role"]
    ).expect("register swap_agent_active_swaps");

    // Health metrics
    pub static ref HEALTH_CHECKS: CounterVec = register_counter_vec!(
        "swap_agent_health_checks_total",
        "Health check rounds by result",
        &["result"]
    ).expect("register swap_agent_health_checks_total");
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> SwapResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SwapError::Config(format!("Cannot bind metrics port {}: {}", self.port, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| SwapError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Text exposition of every registered metric
pub fn render() -> SwapResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| SwapError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| SwapError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_chain_health(chain: ChainSide, healthy: bool) {
    CHAIN_HEALTHY
        .with_label_values(&[chain.label()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_reconcile(result: &str) {
    RECONCILE_PASSES.with_label_values(&[result]).inc();
}

pub fn record_protocol_violation(error: &SwapError) {
    let name = match error {
        SwapError::HashlockMismatch { .. } => "hashlock_mismatch",
        SwapError::SecretMismatch { .. } => "secret_mismatch",
        SwapError::TimelockOrdering { .. } => "timelock_ordering",
        SwapError::CorruptLeg { .. } => "corrupt_leg",
        _ => return,
    };
    PROTOCOL_VIOLATIONS.with_label_values(&[name]).inc();
}

pub fn record_chain_write(chain: ChainSide, operation: &str, outcome: &str) {
    CHAIN_WRITES
        .with_label_values(&[chain.label(), operation, outcome])
        .inc();
}

pub fn record_write_latency(chain: ChainSide, latency_secs: f64) {
    WRITE_LATENCY
        .with_label_values(&[chain.label()])
        .observe(latency_secs);
}

pub fn record_swap_started(role: Role) {
    ACTIVE_SWAPS.with_label_values(&[&role.to_string()]).inc();
}

pub fn record_swap_outcome(role: Role, outcome: &str) {
    let role = role.to_string();
    ACTIVE_SWAPS.with_label_values(&[&role]).dec();
    SWAP_OUTCOMES.with_label_values(&[&role, outcome]).inc();
}

pub fn record_health_check(all_healthy: bool) {
    let result = if all_healthy { "healthy" } else { "degraded" };
    HEALTH_CHECKS.with_label_values(&[result]).inc();
}
