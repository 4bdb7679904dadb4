use std::sync::Arc;

use ps_domain::config::Config;

use crate::runtime::orchestrator::SegmentationService;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub service: Arc<SegmentationService>,
}
