//! Table scope, environment and pipeline definition handlers

use crate::auth::Actor;
use crate::change::TableScope;
use crate::error::{not_found_error, validation_error, ApiResult};
use crate::models::{
    CreateEnvironmentRequest, CreatePipelineRequest, CreateTableScopeRequest,
    EnvironmentListResponse, EnvironmentResponse, PipelineResponse, SuccessResponse,
    TableScopeResponse,
};
use crate::pipeline::{Environment, Pipeline};
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::info;
use uuid::Uuid;
use validator::Validate;

pub async fn create_table_scope(
    State(state): State<SharedState>,
    actor: Actor,
    Json(req): Json<CreateTableScopeRequest>,
) -> ApiResult<(StatusCode, Json<SuccessResponse<TableScopeResponse>>)> {
    actor.require_admin()?;
    req.validate().map_err(|e| validation_error(e.to_string()))?;

    let scope = TableScope {
        id: req.id.unwrap_or_else(Uuid::new_v4),
        name: req.name,
    };
    state.engine.store().insert_table_scope(&scope).await?;
    info!("📦 Registered table scope '{}' ({})", scope.name, scope.id);

    Ok((
        StatusCode::CREATED,
        Json(SuccessResponse::with_data("Table scope registered", TableScopeResponse { scope })),
    ))
}

pub async fn create_environment(
    State(state): State<SharedState>,
    actor: Actor,
    Json(req): Json<CreateEnvironmentRequest>,
) -> ApiResult<(StatusCode, Json<SuccessResponse<EnvironmentResponse>>)> {
    actor.require_admin()?;
    req.validate().map_err(|e| validation_error(e.to_string()))?;

    let mut environment = Environment::new(req.name, req.env_type);
    if let Some(id) = req.id {
        environment.id = id;
    }
    state.engine.store().insert_environment(&environment).await?;
    info!(
        "🌍 Registered {} environment '{}'",
        environment.env_type.as_str(),
        environment.name
    );

    Ok((
        StatusCode::CREATED,
        Json(SuccessResponse::with_data(
            "Environment registered",
            EnvironmentResponse { environment },
        )),
    ))
}

pub async fn list_environments(
    State(state): State<SharedState>,
    _actor: Actor,
) -> ApiResult<Json<SuccessResponse<EnvironmentListResponse>>> {
    let environments = state.engine.store().list_environments().await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Found {} environments", environments.len()),
        EnvironmentListResponse { environments },
    )))
}

pub async fn create_pipeline(
    State(state): State<SharedState>,
    actor: Actor,
    Json(req): Json<CreatePipelineRequest>,
) -> ApiResult<(StatusCode, Json<SuccessResponse<PipelineResponse>>)> {
    actor.require_admin()?;
    req.validate().map_err(|e| validation_error(e.to_string()))?;

    for environment_id in &req.environments {
        if state.engine.store().get_environment(*environment_id).await?.is_none() {
            return Err(not_found_error(format!("Environment {} not found", environment_id)));
        }
    }

    let pipeline = Pipeline::new(
        req.name,
        req.environments,
        req.auto_promote,
        req.requires_approval,
        req.approval_environments,
    )?;
    state.engine.store().insert_pipeline(&pipeline).await?;
    info!(
        "🚚 Created pipeline '{}' with {} environments",
        pipeline.name,
        pipeline.environments.len()
    );

    Ok((
        StatusCode::CREATED,
        Json(SuccessResponse::with_data("Pipeline created", PipelineResponse { pipeline })),
    ))
}

pub async fn get_pipeline(
    State(state): State<SharedState>,
    _actor: Actor,
    Path(pipeline_id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<PipelineResponse>>> {
    let pipeline = state
        .engine
        .store()
        .get_pipeline(pipeline_id)
        .await?
        .ok_or_else(|| not_found_error(format!("Pipeline {} not found", pipeline_id)))?;
    Ok(Json(SuccessResponse::with_data("Pipeline retrieved", PipelineResponse { pipeline })))
}
