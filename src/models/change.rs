//! Change, vote and rollback DTOs

use crate::change::{ApprovalRecord, Change, ChangeKind, Decision};
use crate::engine::RollbackOutcome;
use crate::pipeline::PipelineRun;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitChangeRequest {
    pub kind: ChangeKind,
    pub payload: Value,
    pub scope_id: Uuid,
    /// Keep the change as an editable draft instead of submitting it
    #[serde(default)]
    pub draft: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDraftRequest {
    pub payload: Value,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub decision: Decision,

    #[serde(default)]
    #[validate(length(max = 2000, message = "Comments are limited to 2000 characters"))]
    pub comments: Option<String>,
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RollbackChangeRequest {
    #[serde(default)]
    #[validate(length(max = 2000, message = "Reason is limited to 2000 characters"))]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeResponse {
    pub change: Change,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteResponse {
    pub change: Change,
    /// Set when the vote let an auto-promoting pipeline run continue
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<PipelineRun>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalHistoryResponse {
    pub approvals: Vec<ApprovalRecord>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResponse {
    pub rollback: RollbackOutcome,
}
