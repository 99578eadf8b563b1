//! Prometheus metrics for the node.
//!
//! [`NodeMetrics`] owns the registry; transport metrics
//! ([`NetworkMetrics`]) are registered into the same one so a single
//! `/metrics` endpoint exposes everything.

use std::sync::Arc;

use axum::{extract::State, routing::get, Router};
use idnet_network::NetworkMetrics;
use prometheus::{
    register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, Histogram, HistogramOpts, IntCounter, IntGauge,
    Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

use crate::NodeError;

pub struct NodeMetrics {
    pub registry: Registry,
    pub network: Arc<NetworkMetrics>,

    // ── Height gate ─────────────────────────────────────────────────────
    /// Messages parked until their ledger height arrives.
    pub deferred_messages: IntGauge,
    pub deferred_released: IntCounter,
    pub latest_height: IntGauge,

    // ── Task queue ──────────────────────────────────────────────────────
    pub tasks_enqueued: IntCounter,
    pub tasks_completed: IntCounter,
    pub tasks_failed: IntCounter,
    /// Request ids with at least one queued task.
    pub active_queues: IntGauge,
    pub task_duration_ms: Histogram,

    // ── Worker pool ─────────────────────────────────────────────────────
    pub connected_workers: IntGauge,
    /// Remote calls awaiting a result.
    pub outstanding_jobs: IntGauge,
}

impl NodeMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let network = Arc::new(NetworkMetrics::new(&registry));

        let deferred_messages = register_int_gauge_with_registry!(
            Opts::new("idnet_deferred_messages", "Messages waiting for a ledger height"),
            registry
        )
        .expect("failed to register deferred_messages gauge");

        let deferred_released = register_int_counter_with_registry!(
            Opts::new(
                "idnet_deferred_released_total",
                "Deferred messages released by a new block"
            ),
            registry
        )
        .expect("failed to register deferred_released counter");

        let latest_height = register_int_gauge_with_registry!(
            Opts::new("idnet_latest_height", "Latest ledger height seen by the gate"),
            registry
        )
        .expect("failed to register latest_height gauge");

        let tasks_enqueued = register_int_counter_with_registry!(
            Opts::new("idnet_tasks_enqueued_total", "Tasks added to request queues"),
            registry
        )
        .expect("failed to register tasks_enqueued counter");

        let tasks_completed = register_int_counter_with_registry!(
            Opts::new("idnet_tasks_completed_total", "Tasks that finished successfully"),
            registry
        )
        .expect("failed to register tasks_completed counter");

        let tasks_failed = register_int_counter_with_registry!(
            Opts::new("idnet_tasks_failed_total", "Tasks that finished with an error"),
            registry
        )
        .expect("failed to register tasks_failed counter");

        let active_queues = register_int_gauge_with_registry!(
            Opts::new("idnet_active_queues", "Request ids with queued tasks"),
            registry
        )
        .expect("failed to register active_queues gauge");

        let task_duration_ms = register_histogram_with_registry!(
            HistogramOpts::new("idnet_task_duration_ms", "Task execution time in milliseconds")
                .buckets(
                    prometheus::exponential_buckets(1.0, 2.0, 16)
                        .expect("static bucket layout is valid")
                ),
            registry
        )
        .expect("failed to register task_duration_ms histogram");

        let connected_workers = register_int_gauge_with_registry!(
            Opts::new("idnet_connected_workers", "Workers subscribed to this coordinator"),
            registry
        )
        .expect("failed to register connected_workers gauge");

        let outstanding_jobs = register_int_gauge_with_registry!(
            Opts::new("idnet_outstanding_jobs", "Remote calls awaiting a result"),
            registry
        )
        .expect("failed to register outstanding_jobs gauge");

        Self {
            registry,
            network,
            deferred_messages,
            deferred_released,
            latest_height,
            tasks_enqueued,
            tasks_completed,
            tasks_failed,
            active_queues,
            task_duration_ms,
            connected_workers,
            outstanding_jobs,
        }
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode_text(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serve `GET /metrics` until `shutdown` fires.
pub async fn serve_metrics(
    listener: TcpListener,
    metrics: Arc<NodeMetrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), NodeError> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);
    info!(addr = %listener.local_addr()?, "metrics endpoint listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

async fn metrics_handler(State(metrics): State<Arc<NodeMetrics>>) -> String {
    metrics.encode_text()
}
