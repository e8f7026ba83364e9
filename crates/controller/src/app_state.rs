use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::artifacts::ArtifactStore;
use crate::config::AppConfig;
use crate::persistence::PlanStore;

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub cfg: AppConfig,
    pub store: Arc<dyn PlanStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub metrics_handle: PrometheusHandle,
}
