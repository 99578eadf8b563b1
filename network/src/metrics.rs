//! Prometheus metrics for message delivery and receipt.
//!
//! Registered into the node's registry. Abandoned outbound sends are
//! observable only through `idnet_outbound_abandoned_total`.

use prometheus::{
    register_int_counter_with_registry, register_int_gauge_with_registry, IntCounter, IntGauge,
    Opts, Registry,
};

pub struct NetworkMetrics {
    /// Sends acknowledged by the receiver.
    pub outbound_delivered: IntCounter,
    /// Sends given up after the retry ceiling.
    pub outbound_abandoned: IntCounter,
    pub outbound_retries: IntCounter,
    /// Sends currently in flight (persisted, not yet acknowledged).
    pub outbound_pending: IntGauge,

    pub inbound_received: IntCounter,
    pub inbound_duplicates: IntCounter,
    /// Messages that failed integrity or schema checks.
    pub inbound_rejected: IntCounter,
}

impl NetworkMetrics {
    pub fn new(registry: &Registry) -> Self {
        let outbound_delivered = register_int_counter_with_registry!(
            Opts::new(
                "idnet_outbound_delivered_total",
                "Outbound messages acknowledged by the receiver"
            ),
            registry
        )
        .expect("failed to register outbound_delivered counter");

        let outbound_abandoned = register_int_counter_with_registry!(
            Opts::new(
                "idnet_outbound_abandoned_total",
                "Outbound messages abandoned after the retry ceiling"
            ),
            registry
        )
        .expect("failed to register outbound_abandoned counter");

        let outbound_retries = register_int_counter_with_registry!(
            Opts::new("idnet_outbound_retries_total", "Outbound delivery retries"),
            registry
        )
        .expect("failed to register outbound_retries counter");

        let outbound_pending = register_int_gauge_with_registry!(
            Opts::new("idnet_outbound_pending", "Outbound messages awaiting acknowledgement"),
            registry
        )
        .expect("failed to register outbound_pending gauge");

        let inbound_received = register_int_counter_with_registry!(
            Opts::new("idnet_inbound_received_total", "Inbound messages accepted for processing"),
            registry
        )
        .expect("failed to register inbound_received counter");

        let inbound_duplicates = register_int_counter_with_registry!(
            Opts::new(
                "idnet_inbound_duplicates_total",
                "Inbound redeliveries dropped inside the dedup window"
            ),
            registry
        )
        .expect("failed to register inbound_duplicates counter");

        let inbound_rejected = register_int_counter_with_registry!(
            Opts::new(
                "idnet_inbound_rejected_total",
                "Inbound messages rejected by integrity or schema checks"
            ),
            registry
        )
        .expect("failed to register inbound_rejected counter");

        Self {
            outbound_delivered,
            outbound_abandoned,
            outbound_retries,
            outbound_pending,
            inbound_received,
            inbound_duplicates,
            inbound_rejected,
        }
    }
}
