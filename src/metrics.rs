//! Prometheus metrics (spec SPEC_FULL.md §9/§10, ambient, carried from the
//! teacher's feature-gated `metrics` dependency rather than introduced fresh).
//!
//! Tracks the three counters the Reconciler naturally produces: tick
//! duration, VMs terminated by reason, and launch requests queued/fulfilled.
//! Exposed on `GET /metrics` only when the `metrics` feature (on by default)
//! is enabled.

use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelValue)]
pub enum TerminationReasonLabel {
    UserRequested,
    TerminatedExternally,
    AccountRemoved,
    QuotaExceeded,
    MaxHoursExceeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct TerminationLabels {
    pub reason: TerminationReasonLabel,
}

pub struct Metrics {
    registry: Mutex<Registry>,
    pub vms_terminated_total: Family<TerminationLabels, Counter>,
    pub launch_requests_queued_total: Counter,
    pub launch_requests_fulfilled_total: Counter,
    pub reconciler_tick_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        let mut registry = Registry::default();

        let vms_terminated_total = Family::<TerminationLabels, Counter>::default();
        registry.register(
            "vms_terminated",
            "VMs terminated, by reason",
            vms_terminated_total.clone(),
        );

        let launch_requests_queued_total = Counter::default();
        registry.register(
            "launch_requests_queued",
            "Launch requests admitted into the queued state",
            launch_requests_queued_total.clone(),
        );

        let launch_requests_fulfilled_total = Counter::default();
        registry.register(
            "launch_requests_fulfilled",
            "Launch requests fulfilled",
            launch_requests_fulfilled_total.clone(),
        );

        let reconciler_tick_seconds = Histogram::new(
            [0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0].into_iter(),
        );
        registry.register(
            "reconciler_tick_seconds",
            "Duration of a full Reconciler tick (passes A, B, C)",
            reconciler_tick_seconds.clone(),
        );

        Arc::new(Self {
            registry: Mutex::new(registry),
            vms_terminated_total,
            launch_requests_queued_total,
            launch_requests_fulfilled_total,
            reconciler_tick_seconds,
        })
    }

    pub async fn encode(&self) -> String {
        let registry = self.registry.lock().await;
        let mut buffer = String::new();
        let _ = prometheus_client::encoding::text::encode(&mut buffer, &registry);
        buffer
    }
}
