use std::sync::Arc;

use crate::services::{orchestrator::Orchestrator, transform::TransformationService};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub transform: Arc<TransformationService>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let transform = orchestrator.transform().clone();
        Self {
            orchestrator: Arc::new(orchestrator),
            transform,
        }
    }
}
