use std::sync::Arc;

use crate::pipeline::TailoringPipeline;
use crate::rate_limit::AdmissionGate;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    /// Per-caller limiter plus the global upstream quota. Counters live in memory
    /// for the lifetime of the process.
    pub gate: Arc<AdmissionGate>,
    pub pipeline: Arc<TailoringPipeline>,
}
