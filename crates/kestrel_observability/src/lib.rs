//! Observability setup: structured logging and Prometheus metrics.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kestrel=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Initialize Prometheus metrics exporter on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

/// One remote operation (query, subplan, utility, copy) finished.
pub fn record_remote_query(kind: &str, node_count: usize, duration_us: u64, success: bool) {
    metrics::counter!(
        "kestrel_remote_queries_total",
        "kind" => kind.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
    metrics::histogram!("kestrel_remote_query_duration_us", "kind" => kind.to_string())
        .record(duration_us as f64);
    metrics::histogram!("kestrel_remote_query_fanout").record(node_count as f64);
}

pub fn record_rows_fetched(rows: u64) {
    metrics::counter!("kestrel_remote_rows_total").increment(rows);
}

/// A data-node connection was marked fatal. `reason` is a short label.
pub fn record_connection_fatal(reason: &str) {
    metrics::counter!("kestrel_connection_fatal_total", "reason" => reason.to_string())
        .increment(1);
}

/// Rows buffered because another combiner needed the connection.
pub fn record_rows_buffered(rows: u64) {
    metrics::counter!("kestrel_combiner_rows_buffered_total").increment(rows);
}

pub fn record_pool_acquire(node_count: usize, success: bool) {
    metrics::counter!(
        "kestrel_pool_acquire_total",
        "success" => success.to_string()
    )
    .increment(1);
    metrics::histogram!("kestrel_pool_acquire_nodes").record(node_count as f64);
}

pub fn record_pool_release(count: usize, discarded: usize) {
    metrics::counter!("kestrel_pool_release_total").increment(count as u64);
    metrics::counter!("kestrel_pool_discard_total").increment(discarded as u64);
}

/// Transaction outcome: "committed", "aborted", "prepare_failed",
/// "commit_failed", "part_committed", "part_aborted".
pub fn record_txn_outcome(outcome: &str, two_phase: bool) {
    metrics::counter!(
        "kestrel_txn_total",
        "outcome" => outcome.to_string(),
        "two_phase" => two_phase.to_string()
    )
    .increment(1);
}

pub fn record_active_connections(count: usize) {
    metrics::gauge!("kestrel_session_connections").set(count as f64);
}
