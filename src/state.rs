//! Application state management
//!
//! Contains shared state accessible across all handlers.

use crate::engine::ApprovalEngine;
use crate::pipeline::PipelinePromoter;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState {
    /// Approval engine over the configured change store and effector
    pub engine: Arc<ApprovalEngine>,

    /// Drives deployments through pipelines on top of the engine
    pub promoter: PipelinePromoter,
}

impl AppState {
    pub fn new(engine: Arc<ApprovalEngine>) -> Self {
        Self {
            promoter: PipelinePromoter::new(engine.clone()),
            engine,
        }
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
