//! Execution applier
//!
//! Realizes fully approved changes through the effector. The per-change lease,
//! renewed before every attempt and outliving each bounded effector call,
//! makes the external mutation at-most-once. Retryable failures are recorded
//! and retried with exponential backoff; fatal ones fail the change.

use crate::audit::{AuditAction, AuditEvent};
use crate::change::{Change, ChangeStatus, CurrentStep, FailureReason};
use crate::effector::ChangeDescriptor;
use crate::engine::ApprovalEngine;
use crate::error::{conflict_error, AppError};
use crate::store::{ChangeCommit, Lease};
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

fn check_applicable(change: &Change) -> Result<(), AppError> {
    if change.is_rollback_request() {
        return Err(conflict_error(format!(
            "Change {} is a rollback request and runs through the rollback coordinator",
            change.id
        )));
    }
    if change.status != ChangeStatus::Pending {
        return Err(conflict_error(format!(
            "Change {} is {} and cannot be applied",
            change.id,
            change.status.as_str()
        )));
    }
    if let CurrentStep::Step(index) = change.current_step() {
        return Err(conflict_error(format!(
            "Change {} is still waiting on approval step '{}'",
            change.id, change.plan[index].name
        )));
    }
    Ok(())
}

impl ApprovalEngine {
    /// Apply a change whose approval plan is complete
    pub async fn apply(&self, change_id: Uuid, actor_id: Option<Uuid>) -> Result<Change, AppError> {
        check_applicable(&self.load(change_id).await?)?;

        let mut lease = self
            .store
            .acquire_lease(change_id, self.config.lease_ttl)
            .await?;
        let result = self.apply_leased(change_id, actor_id, &mut lease).await;

        if let Err(e) = self.store.release_lease(&lease).await {
            warn!("Failed to release apply lease on change {}: {}", change_id, e);
        }
        result
    }

    async fn apply_leased(
        &self,
        change_id: Uuid,
        actor_id: Option<Uuid>,
        lease: &mut Lease,
    ) -> Result<Change, AppError> {
        // Another caller may have finished while we waited for the lease
        let mut change = self.load(change_id).await?;
        check_applicable(&change)?;

        let descriptor = ChangeDescriptor::from(&change);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = self.under_lease(lease, self.effector.apply(&descriptor)).await?;
            let expected = change.version;
            change.apply_attempts += 1;

            match outcome {
                Ok(snapshot) => {
                    change.mark_applied(snapshot);
                    let event = AuditEvent::for_change(&change, actor_id, AuditAction::ChangeApplied)
                        .with_details(json!({ "attempts": change.apply_attempts }));

                    let stored = self
                        .store
                        .commit(ChangeCommit::new(change, expected).with_event(event))
                        .await
                        .map_err(|e| {
                            error!("Change {} was applied but recording it failed: {}", change_id, e);
                            e
                        })?;

                    info!("✅ Change {} applied ({})", change_id, stored.kind.as_str());
                    return Ok(stored);
                }
                Err(err) if err.is_retryable() => {
                    change.last_error = Some(err.to_string());
                    change.updated_at = Utc::now();
                    let event =
                        AuditEvent::for_change(&change, actor_id, AuditAction::ApplyAttemptFailed)
                            .with_details(json!({
                                "attempt": attempt,
                                "error": err.to_string(),
                                "retryable": true,
                            }));
                    change = self
                        .store
                        .commit(ChangeCommit::new(change, expected).with_event(event))
                        .await?;

                    if attempt >= self.config.apply_max_attempts {
                        warn!(
                            "⚠️  Change {} still failing after {} attempts, left pending: {}",
                            change_id, attempt, err
                        );
                        return Err(err.into());
                    }

                    let delay = self.config.backoff_for(attempt);
                    warn!(
                        "⚠️  Apply attempt {} of change {} failed ({}), retrying in {:?}",
                        attempt, change_id, err, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    change.fail(FailureReason::Effector, Some(err.to_string()));
                    let event = AuditEvent::for_change(&change, actor_id, AuditAction::ChangeFailed)
                        .with_details(json!({
                            "attempt": attempt,
                            "error": err.to_string(),
                            "retryable": false,
                        }));
                    self.store
                        .commit(ChangeCommit::new(change, expected).with_event(event))
                        .await?;

                    error!("❌ Change {} refused by the platform: {}", change_id, err);
                    return Err(err.into());
                }
            }
        }
    }
}
