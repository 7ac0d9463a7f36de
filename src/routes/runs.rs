//! Pipeline run handlers

use crate::auth::Actor;
use crate::error::ApiResult;
use crate::models::{PromoteRequest, RunResponse, SuccessResponse};
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

/// Start promoting a deployment through a pipeline
pub async fn start_run(
    State(state): State<SharedState>,
    actor: Actor,
    Path(pipeline_id): Path<Uuid>,
    Json(req): Json<PromoteRequest>,
) -> ApiResult<(StatusCode, Json<SuccessResponse<RunResponse>>)> {
    actor.require_proposer()?;
    let run = state
        .promoter
        .promote(pipeline_id, req.payload, actor.id)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(SuccessResponse::with_data("Pipeline run started", RunResponse { run })),
    ))
}

pub async fn get_run(
    State(state): State<SharedState>,
    _actor: Actor,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<RunResponse>>> {
    let run = state.promoter.get_run(run_id).await?;
    Ok(Json(SuccessResponse::with_data("Pipeline run retrieved", RunResponse { run })))
}

/// Take the next step of a run
pub async fn promote_next(
    State(state): State<SharedState>,
    actor: Actor,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<RunResponse>>> {
    actor.require_proposer()?;
    let run = state.promoter.promote_next(run_id, actor.id).await?;
    Ok(Json(SuccessResponse::with_data("Pipeline run advanced", RunResponse { run })))
}
