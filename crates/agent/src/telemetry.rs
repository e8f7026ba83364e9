use std::sync::OnceLock;

use axum::routing::get;
use axum::Router;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

/// Installs the process-wide Prometheus recorder once and returns the
/// render handle; later calls reuse the first installation.
pub fn init_metrics_recorder() -> PrometheusHandle {
    HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

/// Tiny `/metrics` router for the agent process.
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    )
}

/// Observes result-queue depth and pressure outcomes.
pub trait QueueRecorder: Send + Sync {
    fn observe_queue_depth(&self, depth: usize);
    fn inc_queue_drops(&self);
    fn inc_queue_spills(&self);
}

/// Observes bytes waiting in the spill log.
pub trait BackfillRecorder: Send + Sync {
    fn observe_pending_bytes(&self, bytes: u64);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopQueueRecorder;

impl QueueRecorder for NoopQueueRecorder {
    fn observe_queue_depth(&self, _depth: usize) {}
    fn inc_queue_drops(&self) {}
    fn inc_queue_spills(&self) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBackfillRecorder;

impl BackfillRecorder for NoopBackfillRecorder {
    fn observe_pending_bytes(&self, _bytes: u64) {}
}

/// Recorder backed by the `metrics` facade; what the runner wires in.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsQueueRecorder;

impl QueueRecorder for MetricsQueueRecorder {
    fn observe_queue_depth(&self, depth: usize) {
        gauge!("agent_queue_depth").set(depth as f64);
    }

    fn inc_queue_drops(&self) {
        counter!("agent_queue_drops_total").increment(1);
    }

    fn inc_queue_spills(&self) {
        counter!("agent_queue_spills_total").increment(1);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsBackfillRecorder;

impl BackfillRecorder for MetricsBackfillRecorder {
    fn observe_pending_bytes(&self, bytes: u64) {
        gauge!("agent_backfill_pending_bytes").set(bytes as f64);
    }
}
