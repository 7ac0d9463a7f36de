//! Change route handlers
//!
//! Submission, drafts, votes, application and rollback of changes.

use crate::audit::{Page, Paged};
use crate::auth::Actor;
use crate::change::{Ballot, Change};
use crate::engine::{NewChange, RollbackOutcome};
use crate::error::{validation_error, ApiResult};
use crate::models::{
    ApprovalHistoryResponse, ChangeResponse, RollbackChangeRequest, RollbackResponse,
    SubmitChangeRequest, SuccessResponse, UpdateDraftRequest, VoteRequest, VoteResponse,
};
use crate::state::SharedState;
use crate::store::ChangeFilter;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use tracing::warn;
use uuid::Uuid;
use validator::Validate;

/// Submit a change for approval, or save it as a draft
pub async fn submit_change(
    State(state): State<SharedState>,
    actor: Actor,
    Json(req): Json<SubmitChangeRequest>,
) -> ApiResult<(StatusCode, Json<SuccessResponse<ChangeResponse>>)> {
    actor.require_proposer()?;

    let new = NewChange {
        kind: req.kind,
        payload: req.payload,
        scope_id: req.scope_id,
        author_id: actor.id,
    };
    let (change, message) = if req.draft {
        (state.engine.create_draft(new).await?, "Draft created")
    } else {
        (state.engine.submit(new).await?, "Change submitted for approval")
    };

    Ok((
        StatusCode::CREATED,
        Json(SuccessResponse::with_data(message, ChangeResponse { change })),
    ))
}

/// List changes; `?status=pending` is the pending-approvals queue
pub async fn list_changes(
    State(state): State<SharedState>,
    _actor: Actor,
    Query(filter): Query<ChangeFilter>,
    Query(page): Query<Page>,
) -> ApiResult<Json<SuccessResponse<Paged<Change>>>> {
    let changes = state.engine.list_changes(&filter, page).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Found {} changes", changes.total),
        changes,
    )))
}

pub async fn get_change(
    State(state): State<SharedState>,
    _actor: Actor,
    Path(change_id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<ChangeResponse>>> {
    let change = state.engine.get_change(change_id).await?;
    Ok(Json(SuccessResponse::with_data("Change retrieved", ChangeResponse { change })))
}

pub async fn update_draft(
    State(state): State<SharedState>,
    actor: Actor,
    Path(change_id): Path<Uuid>,
    Json(req): Json<UpdateDraftRequest>,
) -> ApiResult<Json<SuccessResponse<ChangeResponse>>> {
    let change = state
        .engine
        .update_draft(change_id, actor.id, req.payload)
        .await?;
    Ok(Json(SuccessResponse::with_data("Draft updated", ChangeResponse { change })))
}

pub async fn submit_draft(
    State(state): State<SharedState>,
    actor: Actor,
    Path(change_id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<ChangeResponse>>> {
    let change = state.engine.submit_draft(change_id, actor.id).await?;
    Ok(Json(SuccessResponse::with_data(
        "Change submitted for approval",
        ChangeResponse { change },
    )))
}

/// Vote on the current approval step
pub async fn cast_vote(
    State(state): State<SharedState>,
    actor: Actor,
    Path(change_id): Path<Uuid>,
    Json(req): Json<VoteRequest>,
) -> ApiResult<Json<SuccessResponse<VoteResponse>>> {
    req.validate().map_err(|e| validation_error(e.to_string()))?;

    let ballot = Ballot {
        approver_id: actor.id,
        approver_role: actor.role,
        decision: req.decision,
        comments: req.comments,
    };
    let change = state.engine.cast_vote(change_id, ballot).await?;

    // The vote is recorded either way; a stalled run can be pushed with promote
    let run = match state.promoter.resume_after_vote(&change, actor.id).await {
        Ok(run) => run,
        Err(e) => {
            warn!("Could not resume pipeline after vote on {}: {}", change_id, e);
            None
        }
    };

    Ok(Json(SuccessResponse::with_data(
        "Vote recorded",
        VoteResponse { change, run },
    )))
}

pub async fn list_votes(
    State(state): State<SharedState>,
    _actor: Actor,
    Path(change_id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<ApprovalHistoryResponse>>> {
    let approvals = state.engine.approval_history(change_id).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Found {} votes", approvals.len()),
        ApprovalHistoryResponse { approvals },
    )))
}

pub async fn withdraw_change(
    State(state): State<SharedState>,
    actor: Actor,
    Path(change_id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<ChangeResponse>>> {
    let change = state.engine.withdraw(change_id, actor.id).await?;
    Ok(Json(SuccessResponse::with_data("Change withdrawn", ChangeResponse { change })))
}

/// Apply a fully approved change through the effector
pub async fn apply_change(
    State(state): State<SharedState>,
    actor: Actor,
    Path(change_id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<ChangeResponse>>> {
    actor.require_proposer()?;
    let change = state.engine.apply(change_id, Some(actor.id)).await?;
    Ok(Json(SuccessResponse::with_data("Change applied", ChangeResponse { change })))
}

pub async fn rollback_change(
    State(state): State<SharedState>,
    actor: Actor,
    Path(change_id): Path<Uuid>,
    req: Option<Json<RollbackChangeRequest>>,
) -> ApiResult<(StatusCode, Json<SuccessResponse<RollbackResponse>>)> {
    actor.require_proposer()?;
    let req = req.map(|Json(req)| req).unwrap_or_default();
    req.validate().map_err(|e| validation_error(e.to_string()))?;

    let rollback = state.engine.rollback(change_id, actor.id, req.reason).await?;
    let (status, message) = match &rollback {
        RollbackOutcome::RolledBack { .. } => (StatusCode::OK, "Change rolled back"),
        RollbackOutcome::AwaitingApproval { .. } => {
            (StatusCode::ACCEPTED, "Rollback requested, awaiting approval")
        }
    };

    Ok((
        status,
        Json(SuccessResponse::with_data(message, RollbackResponse { rollback })),
    ))
}
