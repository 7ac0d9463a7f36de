//! Rollback coordinator
//!
//! Reverts applied changes from their rollback snapshot. Reverting a
//! high-risk change first needs its own approved rollback request, a linked
//! change that goes through the same approval plan as the original.

use crate::audit::{AuditAction, AuditEvent};
use crate::change::{Change, ChangeStatus, CurrentStep};
use crate::effector::ChangeDescriptor;
use crate::engine::{ApprovalEngine, RiskClassifier};
use crate::error::AppError;
use crate::store::{ChangeCommit, Lease};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum RollbackOutcome {
    /// The change is rolled back, now or by an earlier call
    #[serde(rename = "rolled_back")]
    RolledBack { change: Change },
    /// The linked rollback request still needs votes
    #[serde(rename = "awaiting_approval")]
    AwaitingApproval { change: Change, request: Change },
}

fn check_revertible(change: &Change) -> Result<(), AppError> {
    if change.is_rollback_request() {
        return Err(AppError::RollbackUnavailable(format!(
            "Change {} is itself a rollback request",
            change.id
        )));
    }
    if change.status != ChangeStatus::Applied || change.rollback_data.is_none() {
        return Err(AppError::RollbackUnavailable(format!(
            "Change {} is {} and has nothing to roll back",
            change.id,
            change.status.as_str()
        )));
    }
    Ok(())
}

impl ApprovalEngine {
    pub async fn rollback(
        &self,
        change_id: Uuid,
        requested_by: Uuid,
        reason: Option<String>,
    ) -> Result<RollbackOutcome, AppError> {
        let change = self.load(change_id).await?;
        if change.status == ChangeStatus::RolledBack {
            return Ok(RollbackOutcome::RolledBack { change });
        }
        check_revertible(&change)?;

        if RiskClassifier::is_high_risk(change.kind, change.environment_type) {
            let existing = match change.rollback_request_id {
                Some(id) => Some(self.load(id).await?),
                None => None,
            };

            match existing {
                Some(request) if request.current_step() == CurrentStep::Complete
                    && request.status == ChangeStatus::Pending => {}
                Some(request) if request.status == ChangeStatus::Pending => {
                    return Ok(RollbackOutcome::AwaitingApproval { change, request });
                }
                // No request yet, or the last one was rejected, expired or withdrawn
                _ => {
                    let (change, request) = self.request_rollback(change, requested_by, reason).await?;
                    return Ok(RollbackOutcome::AwaitingApproval { change, request });
                }
            }
        }

        let mut lease = self
            .store
            .acquire_lease(change_id, self.config.lease_ttl)
            .await?;
        let result = self.revert_leased(change_id, requested_by, reason, &mut lease).await;

        if let Err(e) = self.store.release_lease(&lease).await {
            warn!("Failed to release rollback lease on change {}: {}", change_id, e);
        }
        result
    }

    /// Open a linked rollback request carrying the original's approval plan
    async fn request_rollback(
        &self,
        mut original: Change,
        requested_by: Uuid,
        reason: Option<String>,
    ) -> Result<(Change, Change), AppError> {
        let mut request = Change::new(
            original.kind,
            original.environment_type,
            json!({ "rollbackOf": original.id, "reason": reason }),
            original.scope_id,
            requested_by,
        );
        request.rollback_of = Some(original.id);
        request.submit(RiskClassifier::classify(original.kind, original.environment_type))?;

        let expected = original.version;
        original.rollback_request_id = Some(request.id);
        original.updated_at = chrono::Utc::now();

        let requested = AuditEvent::for_change(&original, Some(requested_by), AuditAction::RollbackRequested)
            .with_details(json!({ "requestId": request.id, "reason": reason }));
        let submitted = AuditEvent::for_change(&request, Some(requested_by), AuditAction::ChangeSubmitted)
            .with_details(json!({ "rollbackOf": original.id }));

        let stored = self
            .store
            .commit(
                ChangeCommit::new(original, expected)
                    .with_insert(request.clone())
                    .with_event(requested)
                    .with_event(submitted),
            )
            .await?;

        info!(
            "⏪ Rollback of change {} requested, awaiting approval on {}",
            stored.id, request.id
        );
        Ok((stored, request))
    }

    async fn revert_leased(
        &self,
        change_id: Uuid,
        requested_by: Uuid,
        reason: Option<String>,
        lease: &mut Lease,
    ) -> Result<RollbackOutcome, AppError> {
        let mut change = self.load(change_id).await?;
        if change.status == ChangeStatus::RolledBack {
            return Ok(RollbackOutcome::RolledBack { change });
        }
        check_revertible(&change)?;

        let snapshot = change.rollback_data.clone().unwrap_or_default();
        let descriptor = ChangeDescriptor::from(&change);

        let outcome = self
            .under_lease(lease, self.effector.revert(&descriptor, &snapshot))
            .await?;
        if let Err(err) = outcome {
            let event = AuditEvent::for_change(&change, Some(requested_by), AuditAction::RollbackFailed)
                .with_details(json!({
                    "error": err.to_string(),
                    "retryable": err.is_retryable(),
                    "reason": reason,
                }));
            self.store.append_audit(&[event]).await?;

            warn!("⚠️  Rollback of change {} failed: {}", change_id, err);
            return Err(err.into());
        }

        let expected = change.version;
        change.mark_rolled_back();
        let event = AuditEvent::for_change(&change, Some(requested_by), AuditAction::ChangeRolledBack)
            .with_details(json!({ "reason": reason, "requestId": change.rollback_request_id }));
        let stored = self
            .store
            .commit(ChangeCommit::new(change, expected).with_event(event))
            .await?;

        if let Some(request_id) = stored.rollback_request_id {
            self.close_rollback_request(request_id, requested_by).await?;
        }

        info!("⏪ Change {} rolled back", change_id);
        Ok(RollbackOutcome::RolledBack { change: stored })
    }

    async fn close_rollback_request(&self, request_id: Uuid, actor_id: Uuid) -> Result<(), AppError> {
        let mut request = self.load(request_id).await?;
        if request.status != ChangeStatus::Pending {
            return Ok(());
        }

        let expected = request.version;
        let reverted = request.rollback_of;
        request.apply_attempts += 1;
        request.mark_applied(json!({ "reverted": reverted }));
        let event = AuditEvent::for_change(&request, Some(actor_id), AuditAction::ChangeApplied);
        self.store
            .commit(ChangeCommit::new(request, expected).with_event(event))
            .await?;
        Ok(())
    }
}
