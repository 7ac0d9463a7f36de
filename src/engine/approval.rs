//! Approval workflow: submission, drafts, votes and withdrawal

use crate::audit::{AuditAction, AuditEvent, AuditFilter, Page, Paged};
use crate::change::{ApprovalRecord, Ballot, Change, ChangeKind, ChangePayload, ChangeStatus, Decision, FailureReason};
use crate::engine::{ApprovalEngine, RiskClassifier};
use crate::error::{conflict_error, not_found_error, validation_error, AppError};
use crate::pipeline::EnvironmentType;
use crate::store::{ChangeCommit, ChangeFilter};
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

/// A change as proposed by its author
#[derive(Debug, Clone)]
pub struct NewChange {
    pub kind: ChangeKind,
    pub payload: Value,
    pub scope_id: Uuid,
    pub author_id: Uuid,
}

impl ApprovalEngine {
    /// Schema kinds must target a table scope, deployments an environment.
    /// Returns the environment type for deployments.
    async fn resolve_scope(
        &self,
        kind: ChangeKind,
        scope_id: Uuid,
    ) -> Result<Option<EnvironmentType>, AppError> {
        let table = self.store.get_table_scope(scope_id).await?;
        let environment = self.store.get_environment(scope_id).await?;

        match (kind.is_schema_change(), table, environment) {
            (true, Some(_), _) => Ok(None),
            (false, _, Some(env)) => Ok(Some(env.env_type)),
            (true, None, Some(_)) => Err(validation_error(format!(
                "{} changes must target a table scope, {} is an environment",
                kind.as_str(),
                scope_id
            ))),
            (false, Some(_), None) => Err(validation_error(format!(
                "Deployments must target an environment, {} is a table scope",
                scope_id
            ))),
            (_, None, None) => Err(not_found_error(format!("Scope {} not found", scope_id))),
        }
    }

    /// Validate the payload and scope and build the draft
    pub(crate) async fn prepare(&self, new: NewChange) -> Result<Change, AppError> {
        let payload = ChangePayload::parse(new.kind, &new.payload)?.to_value()?;
        let environment = self.resolve_scope(new.kind, new.scope_id).await?;
        Ok(Change::new(new.kind, environment, payload, new.scope_id, new.author_id))
    }

    pub async fn submit(&self, new: NewChange) -> Result<Change, AppError> {
        let mut change = self.prepare(new).await?;
        change.submit(RiskClassifier::classify(change.kind, change.environment_type))?;

        let event = submitted_event(&change);
        self.store.insert_change(&change, &[event]).await?;

        info!(
            "📝 Change {} submitted ({}, {} approval steps)",
            change.id,
            change.kind.as_str(),
            change.plan.len()
        );
        Ok(change)
    }

    pub async fn create_draft(&self, new: NewChange) -> Result<Change, AppError> {
        let change = self.prepare(new).await?;
        let event = AuditEvent::for_change(&change, Some(change.author_id), AuditAction::ChangeDrafted);
        self.store.insert_change(&change, &[event]).await?;

        info!("📝 Draft {} created ({})", change.id, change.kind.as_str());
        Ok(change)
    }

    pub async fn update_draft(
        &self,
        change_id: Uuid,
        author_id: Uuid,
        payload: Value,
    ) -> Result<Change, AppError> {
        let mut change = self.load(change_id).await?;
        require_author(&change, author_id)?;
        if change.status != ChangeStatus::Draft {
            return Err(conflict_error(format!(
                "Change {} is {} and can no longer be edited",
                change_id,
                change.status.as_str()
            )));
        }

        let expected = change.version;
        change.payload = ChangePayload::parse(change.kind, &payload)?.to_value()?;
        change.updated_at = chrono::Utc::now();

        let event = AuditEvent::for_change(&change, Some(author_id), AuditAction::DraftUpdated);
        self.store
            .commit(ChangeCommit::new(change, expected).with_event(event))
            .await
    }

    pub async fn submit_draft(&self, change_id: Uuid, author_id: Uuid) -> Result<Change, AppError> {
        let mut change = self.load(change_id).await?;
        require_author(&change, author_id)?;

        let expected = change.version;
        change.submit(RiskClassifier::classify(change.kind, change.environment_type))?;

        let event = submitted_event(&change);
        let stored = self
            .store
            .commit(ChangeCommit::new(change, expected).with_event(event))
            .await?;

        info!("📝 Draft {} submitted ({} approval steps)", stored.id, stored.plan.len());
        Ok(stored)
    }

    /// Record a vote on the change's current step.
    ///
    /// Lost compare-and-swap races are retried against a fresh read; every
    /// validation runs again on each attempt.
    pub async fn cast_vote(&self, change_id: Uuid, ballot: Ballot) -> Result<Change, AppError> {
        let mut retries = 0;
        loop {
            let mut change = self.load(change_id).await?;
            let expected = change.version;
            let record = change.cast_vote(ballot.clone())?;

            let mut commit = ChangeCommit::new(change.clone(), expected)
                .with_event(
                    AuditEvent::for_change(&change, Some(ballot.approver_id), AuditAction::VoteCast)
                        .with_details(json!({
                            "stepIndex": record.step_index,
                            "stepName": change.plan[record.step_index].name,
                            "decision": record.decision,
                            "approverRole": record.approver_role,
                            "comments": record.comments,
                        })),
                );
            if record.decision == Decision::Rejected {
                commit = commit.with_event(AuditEvent::for_change(
                    &change,
                    Some(ballot.approver_id),
                    AuditAction::ChangeRejected,
                ));
            }
            commit = commit.with_approval(record.clone());

            match self.store.commit(commit).await {
                Ok(stored) => {
                    info!(
                        "🗳️  {} voted {} on step {} of change {}",
                        record.approver_role,
                        record.decision.as_str(),
                        record.step_index,
                        change_id
                    );
                    return Ok(stored);
                }
                Err(AppError::Conflict(_)) if retries < self.config.vote_retry_limit => {
                    retries += 1;
                    debug!("Vote on change {} lost a version race, retry {}", change_id, retries);
                }
                Err(AppError::Conflict(msg)) => {
                    return Err(conflict_error(format!(
                        "Vote not recorded after {} retries: {}",
                        retries, msg
                    )))
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Author pulls a pending change before anyone approved it
    pub async fn withdraw(&self, change_id: Uuid, author_id: Uuid) -> Result<Change, AppError> {
        let mut change = self.load(change_id).await?;
        require_author(&change, author_id)?;

        if change.status != ChangeStatus::Pending {
            return Err(conflict_error(format!(
                "Change {} is {} and cannot be withdrawn",
                change_id,
                change.status.as_str()
            )));
        }
        if change.has_binding_approval() {
            return Err(conflict_error(format!(
                "Change {} already has approvals and cannot be withdrawn",
                change_id
            )));
        }
        if self.store.lease_held(change_id).await? {
            return Err(conflict_error(format!("Change {} is being applied", change_id)));
        }

        let expected = change.version;
        change.fail(FailureReason::Withdrawn, None);
        let event = AuditEvent::for_change(&change, Some(author_id), AuditAction::ChangeWithdrawn);
        let stored = self
            .store
            .commit(ChangeCommit::new(change, expected).with_event(event))
            .await?;

        info!("↩️  Change {} withdrawn by its author", change_id);
        Ok(stored)
    }

    pub async fn get_change(&self, change_id: Uuid) -> Result<Change, AppError> {
        self.load(change_id).await
    }

    pub async fn list_changes(&self, filter: &ChangeFilter, page: Page) -> Result<Paged<Change>, AppError> {
        self.store.list_changes(filter, page).await
    }

    /// Every vote cast on a change, superseded ones included
    pub async fn approval_history(&self, change_id: Uuid) -> Result<Vec<ApprovalRecord>, AppError> {
        self.load(change_id).await?;
        self.store.list_approval_records(change_id).await
    }

    pub async fn list_audit_log(&self, filter: &AuditFilter, page: Page) -> Result<Paged<AuditEvent>, AppError> {
        self.store.list_audit(filter, page).await
    }
}

fn require_author(change: &Change, actor_id: Uuid) -> Result<(), AppError> {
    if change.author_id != actor_id {
        return Err(AppError::Permission(format!(
            "Only the author of change {} may do that",
            change.id
        )));
    }
    Ok(())
}

fn submitted_event(change: &Change) -> AuditEvent {
    let steps: Vec<&str> = change.plan.iter().map(|s| s.name.as_str()).collect();
    AuditEvent::for_change(change, Some(change.author_id), AuditAction::ChangeSubmitted)
        .with_details(json!({ "plan": steps }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::change::CurrentStep;
    use crate::effector::testing::ScriptedEffector;
    use crate::engine::testing::*;
    use crate::pipeline::Environment;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_submit_freezes_plan() {
        let (engine, _) = engine_with(ScriptedEffector::new());
        let change = submitted(&engine, ChangeKind::FieldDelete).await;

        assert_eq!(change.status, ChangeStatus::Pending);
        assert_eq!(change.plan.len(), 3);
        assert_eq!(change.current_step(), CurrentStep::Step(0));
        assert!(change.submitted_at.is_some());

        let audit = engine
            .list_audit_log(&AuditFilter::default(), Page::default())
            .await
            .unwrap();
        assert_eq!(audit.items[0].action, AuditAction::ChangeSubmitted);
    }

    #[tokio::test]
    async fn test_submit_validates_payload_and_scope() {
        let (engine, _) = engine_with(ScriptedEffector::new());
        let scope_id = table_scope(&engine).await;

        let empty = engine
            .submit(NewChange {
                kind: ChangeKind::TableDelete,
                payload: json!({}),
                scope_id,
                author_id: Uuid::new_v4(),
            })
            .await;
        assert!(matches!(empty, Err(AppError::Validation(_))));

        let unknown = engine
            .submit(NewChange {
                kind: ChangeKind::TableDelete,
                payload: payload_for(ChangeKind::TableDelete),
                scope_id: Uuid::new_v4(),
                author_id: Uuid::new_v4(),
            })
            .await;
        assert!(matches!(unknown, Err(AppError::NotFound(_))));

        // A deployment aimed at a table scope is the wrong sort of scope
        let misdirected = engine
            .submit(NewChange {
                kind: ChangeKind::Deployment,
                payload: payload_for(ChangeKind::Deployment),
                scope_id,
                author_id: Uuid::new_v4(),
            })
            .await;
        assert!(matches!(misdirected, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_deployment_plan_depends_on_environment() {
        let (engine, _) = engine_with(ScriptedEffector::new());
        let prod = Environment::new("prod", EnvironmentType::Production);
        engine.store().insert_environment(&prod).await.unwrap();

        let change = engine
            .submit(NewChange {
                kind: ChangeKind::Deployment,
                payload: payload_for(ChangeKind::Deployment),
                scope_id: prod.id,
                author_id: Uuid::new_v4(),
            })
            .await
            .unwrap();

        assert_eq!(change.environment_type, Some(EnvironmentType::Production));
        assert_eq!(change.plan.len(), 2);
    }

    #[tokio::test]
    async fn test_table_create_rejection_halts() {
        let (engine, _) = engine_with(ScriptedEffector::new());
        let change = submitted(&engine, ChangeKind::TableCreate).await;

        let rejected = engine
            .cast_vote(change.id, reject(Role::Developer))
            .await
            .unwrap();
        assert_eq!(rejected.status, ChangeStatus::Failed);
        assert_eq!(rejected.failure, Some(FailureReason::Rejected));

        let late = engine.cast_vote(change.id, approve(Role::Admin)).await;
        assert!(matches!(late, Err(AppError::Conflict(_))));

        let filter = AuditFilter {
            change_id: Some(change.id),
            ..AuditFilter::default()
        };
        let actions: Vec<AuditAction> = engine
            .list_audit_log(&filter, Page::default())
            .await
            .unwrap()
            .items
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::ChangeRejected,
                AuditAction::VoteCast,
                AuditAction::ChangeSubmitted
            ]
        );
    }

    #[tokio::test]
    async fn test_wrong_role_leaves_no_trace() {
        let (engine, _) = engine_with(ScriptedEffector::new());
        let change = submitted(&engine, ChangeKind::FieldDelete).await;

        let result = engine.cast_vote(change.id, approve(Role::Manager)).await;
        assert!(matches!(result, Err(AppError::Permission(_))));

        let stored = engine.get_change(change.id).await.unwrap();
        assert_eq!(stored.version, change.version);
        assert!(engine.approval_history(change.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_votes_are_both_recorded() {
        let (engine, _) = engine_with(ScriptedEffector::new());
        let scope_id = table_scope(&engine).await;

        let mut change = Change::new(
            ChangeKind::FieldUpdate,
            None,
            payload_for(ChangeKind::FieldUpdate),
            scope_id,
            Uuid::new_v4(),
        );
        change
            .submit(vec![crate::change::ApprovalStepDefinition::new(
                "peer_review",
                &[Role::Developer],
                2,
            )])
            .unwrap();
        engine.store().insert_change(&change, &[]).await.unwrap();

        let (a, b) = tokio::join!(
            engine.cast_vote(change.id, approve(Role::Developer)),
            engine.cast_vote(change.id, approve(Role::Developer)),
        );
        a.unwrap();
        b.unwrap();

        let stored = engine.get_change(change.id).await.unwrap();
        assert_eq!(stored.approvals.len(), 2);
        assert_eq!(stored.current_step(), CurrentStep::Complete);
        assert_eq!(engine.approval_history(change.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_superseded_votes_stay_in_history() {
        let (engine, _) = engine_with(ScriptedEffector::new());
        let change = submitted(&engine, ChangeKind::TableCreate).await;

        let dev = approve(Role::Developer);
        let after_approve = engine.cast_vote(change.id, dev.clone()).await.unwrap();
        assert_eq!(after_approve.current_step(), CurrentStep::Step(1));

        // Step 0 is satisfied, so the developer's next vote lands on step 1
        let moved_on = engine.cast_vote(change.id, dev).await;
        assert!(matches!(moved_on, Err(AppError::Permission(_))));

        let history = engine.approval_history(change.id).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_drafts_are_classified_on_submit() {
        let (engine, _) = engine_with(ScriptedEffector::new());
        let scope_id = table_scope(&engine).await;
        let author = Uuid::new_v4();

        let draft = engine
            .create_draft(NewChange {
                kind: ChangeKind::TableUpdate,
                payload: payload_for(ChangeKind::TableUpdate),
                scope_id,
                author_id: author,
            })
            .await
            .unwrap();
        assert_eq!(draft.status, ChangeStatus::Draft);
        assert!(draft.plan.is_empty());

        let stranger = engine
            .update_draft(draft.id, Uuid::new_v4(), json!({"tableId": "t", "name": "x"}))
            .await;
        assert!(matches!(stranger, Err(AppError::Permission(_))));

        let edited = engine
            .update_draft(draft.id, author, json!({"tableId": "tbl_orders", "description": "Orders"}))
            .await
            .unwrap();
        assert_eq!(edited.payload["description"], "Orders");

        let pending = engine.submit_draft(draft.id, author).await.unwrap();
        assert_eq!(pending.status, ChangeStatus::Pending);
        assert_eq!(pending.plan.len(), 1);

        let again = engine.update_draft(draft.id, author, payload_for(ChangeKind::TableUpdate)).await;
        assert!(matches!(again, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_withdraw_only_before_approval() {
        let (engine, _) = engine_with(ScriptedEffector::new());

        let change = submitted(&engine, ChangeKind::TableCreate).await;
        let other = engine.withdraw(change.id, Uuid::new_v4()).await;
        assert!(matches!(other, Err(AppError::Permission(_))));

        let withdrawn = engine.withdraw(change.id, change.author_id).await.unwrap();
        assert_eq!(withdrawn.failure, Some(FailureReason::Withdrawn));

        let approved_once = submitted(&engine, ChangeKind::TableCreate).await;
        engine
            .cast_vote(approved_once.id, approve(Role::Developer))
            .await
            .unwrap();
        let blocked = engine.withdraw(approved_once.id, approved_once.author_id).await;
        assert!(matches!(blocked, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_pending_approvals_query() {
        let (engine, _) = engine_with(ScriptedEffector::new());
        let pending = submitted(&engine, ChangeKind::FieldCreate).await;
        let rejected = submitted(&engine, ChangeKind::FieldCreate).await;
        engine
            .cast_vote(rejected.id, reject(Role::Developer))
            .await
            .unwrap();

        let filter = ChangeFilter {
            status: Some(ChangeStatus::Pending),
            ..ChangeFilter::default()
        };
        let page = engine.list_changes(&filter, Page::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, pending.id);
    }

    #[tokio::test]
    async fn test_unknown_change_is_not_found() {
        let (engine, _) = engine_with(ScriptedEffector::new());
        assert!(matches!(
            engine.get_change(Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            engine.approval_history(Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));
    }
}
