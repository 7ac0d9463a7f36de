//! Table scope, environment and pipeline DTOs

use crate::change::TableScope;
use crate::pipeline::{Environment, EnvironmentType, Pipeline, PipelineRun};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use validator::Validate;

/// Register an external table (or base) as a change target
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateTableScopeRequest {
    /// Id of the table on the platform; generated when absent
    #[serde(default)]
    pub id: Option<Uuid>,

    #[validate(length(min = 1, max = 255, message = "Scope name must be between 1 and 255 characters"))]
    pub name: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateEnvironmentRequest {
    #[serde(default)]
    pub id: Option<Uuid>,

    #[validate(length(min = 1, max = 255, message = "Environment name must be between 1 and 255 characters"))]
    pub name: String,

    #[serde(rename = "type")]
    pub env_type: EnvironmentType,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreatePipelineRequest {
    #[validate(length(min = 1, max = 255, message = "Pipeline name must be between 1 and 255 characters"))]
    pub name: String,

    #[validate(length(min = 1, message = "At least one environment is required"))]
    pub environments: Vec<Uuid>,

    #[serde(default)]
    pub auto_promote: bool,

    #[serde(default)]
    pub requires_approval: bool,

    #[serde(default)]
    pub approval_environments: Vec<Uuid>,
}

/// Start a run with the deployment payload promoted through every hop
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoteRequest {
    pub payload: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableScopeResponse {
    pub scope: TableScope,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentResponse {
    pub environment: Environment,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentListResponse {
    pub environments: Vec<Environment>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResponse {
    pub pipeline: Pipeline,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub run: PipelineRun,
}
