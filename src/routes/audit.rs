//! Audit log handler

use crate::audit::{AuditEvent, AuditFilter, Page, Paged};
use crate::auth::Actor;
use crate::error::ApiResult;
use crate::models::SuccessResponse;
use crate::state::SharedState;
use axum::{
    extract::{Query, State},
    Json,
};

/// Newest-first audit events matching the query filters
pub async fn list_audit_log(
    State(state): State<SharedState>,
    _actor: Actor,
    Query(filter): Query<AuditFilter>,
    Query(page): Query<Page>,
) -> ApiResult<Json<SuccessResponse<Paged<AuditEvent>>>> {
    let events = state.engine.list_audit_log(&filter, page).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Found {} audit events", events.total),
        events,
    )))
}
