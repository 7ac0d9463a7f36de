//! Deployment pipelines
//!
//! A pipeline is an ordered list of environments a codepage version is
//! promoted through. Every hop is its own deployment change, so each one goes
//! through the same approval and apply machinery as schema changes.

pub mod promoter;
pub mod types;

pub use promoter::PipelinePromoter;
pub use types::{Environment, EnvironmentType, Pipeline, PipelineHop, PipelineRun, RunState};
