//! Change data models
//!
//! A change is one proposed mutation of the external platform (a schema edit
//! or a deployment hop) tracked through the approval lifecycle.

use crate::auth::Role;
use crate::error::{conflict_error, validation_error, AppError};
use crate::pipeline::EnvironmentType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;
use uuid::Uuid;

// =============================================================================
// KIND & STATUS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    TableCreate,
    TableUpdate,
    TableDelete,
    FieldCreate,
    FieldUpdate,
    FieldDelete,
    RelationshipCreate,
    RelationshipDelete,
    Deployment,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 9] = [
        ChangeKind::TableCreate,
        ChangeKind::TableUpdate,
        ChangeKind::TableDelete,
        ChangeKind::FieldCreate,
        ChangeKind::FieldUpdate,
        ChangeKind::FieldDelete,
        ChangeKind::RelationshipCreate,
        ChangeKind::RelationshipDelete,
        ChangeKind::Deployment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::TableCreate => "table_create",
            ChangeKind::TableUpdate => "table_update",
            ChangeKind::TableDelete => "table_delete",
            ChangeKind::FieldCreate => "field_create",
            ChangeKind::FieldUpdate => "field_update",
            ChangeKind::FieldDelete => "field_delete",
            ChangeKind::RelationshipCreate => "relationship_create",
            ChangeKind::RelationshipDelete => "relationship_delete",
            ChangeKind::Deployment => "deployment",
        }
    }

    /// Schema kinds target a table scope, deployments target an environment
    pub fn is_schema_change(&self) -> bool {
        !matches!(self, ChangeKind::Deployment)
    }
}

impl FromStr for ChangeKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChangeKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| validation_error(format!("Unknown change kind '{}'", s)))
    }
}

/// Change lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    /// Being edited by its author, no plan yet
    Draft,
    /// Collecting votes or waiting to be applied
    Pending,
    /// Realized on the platform; rollback data retained
    Applied,
    /// Rejected, expired, withdrawn or fatally refused by the platform
    Failed,
    RolledBack,
}

impl Default for ChangeStatus {
    fn default() -> Self {
        ChangeStatus::Draft
    }
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Draft => "draft",
            ChangeStatus::Pending => "pending",
            ChangeStatus::Applied => "applied",
            ChangeStatus::Failed => "failed",
            ChangeStatus::RolledBack => "rolled_back",
        }
    }
}

impl FromStr for ChangeStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(ChangeStatus::Draft),
            "pending" => Ok(ChangeStatus::Pending),
            "applied" => Ok(ChangeStatus::Applied),
            "failed" => Ok(ChangeStatus::Failed),
            "rolled_back" => Ok(ChangeStatus::RolledBack),
            other => Err(validation_error(format!("Unknown change status '{}'", other))),
        }
    }
}

/// Why a change ended up `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Rejected,
    Expired,
    Withdrawn,
    /// The platform refused the mutation with a fatal error
    Effector,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Rejected => "rejected",
            FailureReason::Expired => "expired",
            FailureReason::Withdrawn => "withdrawn",
            FailureReason::Effector => "effector",
        }
    }
}

impl FromStr for FailureReason {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rejected" => Ok(FailureReason::Rejected),
            "expired" => Ok(FailureReason::Expired),
            "withdrawn" => Ok(FailureReason::Withdrawn),
            "effector" => Ok(FailureReason::Effector),
            other => Err(validation_error(format!("Unknown failure reason '{}'", other))),
        }
    }
}

// =============================================================================
// APPROVALS
// =============================================================================

/// A named gate requiring a minimum count of role-matching approvals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalStepDefinition {
    pub name: String,
    pub required_roles: BTreeSet<Role>,
    pub min_approvals: u32,
}

impl ApprovalStepDefinition {
    pub fn new(name: impl Into<String>, roles: &[Role], min_approvals: u32) -> Self {
        Self {
            name: name.into(),
            required_roles: roles.iter().copied().collect(),
            min_approvals,
        }
    }

    pub fn accepts(&self, role: Role) -> bool {
        self.required_roles.contains(&role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approved => "approved",
            Decision::Rejected => "rejected",
        }
    }
}

impl FromStr for Decision {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Decision::Approved),
            "rejected" => Ok(Decision::Rejected),
            other => Err(validation_error(format!("Unknown decision '{}'", other))),
        }
    }
}

/// One vote by one approver on one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    pub id: Uuid,
    pub change_id: Uuid,
    pub step_index: usize,
    pub approver_id: Uuid,
    pub approver_role: Role,
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A vote as cast by a caller, before it is bound to a step
#[derive(Debug, Clone)]
pub struct Ballot {
    pub approver_id: Uuid,
    pub approver_role: Role,
    pub decision: Decision,
    pub comments: Option<String>,
}

/// Result of `Change::current_step`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "index")]
pub enum CurrentStep {
    Step(usize),
    Complete,
}

// =============================================================================
// CHANGE
// =============================================================================

/// Links a deployment change to the pipeline run it is a hop of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineLink {
    pub run_id: Uuid,
    pub pipeline_id: Uuid,
    pub hop: usize,
}

/// A registered external table (or base) that schema changes may target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableScope {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub id: Uuid,
    pub kind: ChangeKind,
    /// Target environment type, deployments only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_type: Option<EnvironmentType>,
    pub payload: Value,
    pub status: ChangeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub author_id: Uuid,
    pub scope_id: Uuid,
    pub version: u64,
    /// Frozen at submission; never recomputed
    pub plan: Vec<ApprovalStepDefinition>,
    /// Effective votes, at most one per (approver, step)
    pub approvals: Vec<ApprovalRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_data: Option<Value>,
    pub apply_attempts: u32,
    /// Set on rollback requests: the applied change they would revert
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_of: Option<Uuid>,
    /// Set on an applied change once a gated rollback was requested for it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_request_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineLink>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolled_back_at: Option<DateTime<Utc>>,
}

impl Change {
    /// Create a new draft change
    pub fn new(
        kind: ChangeKind,
        environment_type: Option<EnvironmentType>,
        payload: Value,
        scope_id: Uuid,
        author_id: Uuid,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            environment_type,
            payload,
            status: ChangeStatus::Draft,
            failure: None,
            last_error: None,
            author_id,
            scope_id,
            version: 0,
            plan: Vec::new(),
            approvals: Vec::new(),
            rollback_data: None,
            apply_attempts: 0,
            rollback_of: None,
            rollback_request_id: None,
            pipeline: None,
            created_at: now,
            updated_at: now,
            submitted_at: None,
            applied_at: None,
            rolled_back_at: None,
        }
    }

    /// Freeze a plan and open the change for votes
    pub fn submit(&mut self, plan: Vec<ApprovalStepDefinition>) -> Result<(), AppError> {
        if self.status != ChangeStatus::Draft {
            return Err(conflict_error(format!(
                "Change {} is {} and cannot be submitted",
                self.id,
                self.status.as_str()
            )));
        }
        let now = Utc::now();
        self.plan = plan;
        self.status = ChangeStatus::Pending;
        self.submitted_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Lowest step whose approval quota is not met yet
    pub fn current_step(&self) -> CurrentStep {
        for (index, step) in self.plan.iter().enumerate() {
            let approvers: HashSet<Uuid> = self
                .approvals
                .iter()
                .filter(|a| {
                    a.step_index == index
                        && a.decision == Decision::Approved
                        && step.accepts(a.approver_role)
                })
                .map(|a| a.approver_id)
                .collect();

            if (approvers.len() as u32) < step.min_approvals {
                return CurrentStep::Step(index);
            }
        }
        CurrentStep::Complete
    }

    pub fn is_ready_to_apply(&self) -> bool {
        self.status == ChangeStatus::Pending && self.current_step() == CurrentStep::Complete
    }

    /// Any approved vote on any step blocks plain withdrawal
    pub fn has_binding_approval(&self) -> bool {
        self.approvals.iter().any(|a| a.decision == Decision::Approved)
    }

    /// Apply a ballot to the current step.
    ///
    /// Returns the record that now stands for this approver on that step. A
    /// rejection halts the change immediately.
    pub fn cast_vote(&mut self, ballot: Ballot) -> Result<ApprovalRecord, AppError> {
        if self.status != ChangeStatus::Pending {
            return Err(conflict_error(format!(
                "Change {} is {} and no longer accepts votes",
                self.id,
                self.status.as_str()
            )));
        }

        let step_index = match self.current_step() {
            CurrentStep::Step(index) => index,
            CurrentStep::Complete => {
                return Err(conflict_error(format!(
                    "All approval steps of change {} are already satisfied",
                    self.id
                )))
            }
        };

        let step = &self.plan[step_index];
        if !step.accepts(ballot.approver_role) {
            return Err(AppError::Permission(format!(
                "Role {} cannot vote on step '{}'",
                ballot.approver_role, step.name
            )));
        }

        let existing = self
            .approvals
            .iter()
            .position(|a| a.approver_id == ballot.approver_id && a.step_index == step_index);

        if let Some(pos) = existing {
            if self.approvals[pos].decision == ballot.decision {
                return Err(conflict_error(format!(
                    "Approver {} already voted {} on step '{}'",
                    ballot.approver_id,
                    ballot.decision.as_str(),
                    step.name
                )));
            }
        }

        let now = Utc::now();
        let record = ApprovalRecord {
            id: Uuid::new_v4(),
            change_id: self.id,
            step_index,
            approver_id: ballot.approver_id,
            approver_role: ballot.approver_role,
            decision: ballot.decision,
            comments: ballot.comments,
            timestamp: now,
        };

        match existing {
            Some(pos) => self.approvals[pos] = record.clone(),
            None => self.approvals.push(record.clone()),
        }

        if record.decision == Decision::Rejected {
            self.fail(FailureReason::Rejected, None);
        }
        self.updated_at = now;
        Ok(record)
    }

    pub fn mark_applied(&mut self, rollback_data: Value) {
        let now = Utc::now();
        self.status = ChangeStatus::Applied;
        self.rollback_data = Some(rollback_data);
        self.failure = None;
        self.last_error = None;
        self.applied_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_rolled_back(&mut self) {
        let now = Utc::now();
        self.status = ChangeStatus::RolledBack;
        self.rollback_data = None;
        self.rolled_back_at = Some(now);
        self.updated_at = now;
    }

    pub fn fail(&mut self, reason: FailureReason, error: Option<String>) {
        self.status = ChangeStatus::Failed;
        self.failure = Some(reason);
        if error.is_some() {
            self.last_error = error;
        }
        self.updated_at = Utc::now();
    }

    pub fn is_rollback_request(&self) -> bool {
        self.rollback_of.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn two_step_change() -> Change {
        let mut change = Change::new(
            ChangeKind::TableCreate,
            None,
            json!({"name": "orders"}),
            Uuid::new_v4(),
            Uuid::new_v4(),
        );
        change
            .submit(vec![
                ApprovalStepDefinition::new("technical", &[Role::Developer, Role::Admin], 1),
                ApprovalStepDefinition::new("manager", &[Role::Manager, Role::Admin], 2),
            ])
            .unwrap();
        change
    }

    fn ballot(role: Role, decision: Decision) -> Ballot {
        Ballot {
            approver_id: Uuid::new_v4(),
            approver_role: role,
            decision,
            comments: None,
        }
    }

    #[test]
    fn test_current_step_counts_distinct_matching_approvers() {
        let mut change = two_step_change();
        assert_eq!(change.current_step(), CurrentStep::Step(0));

        change.cast_vote(ballot(Role::Developer, Decision::Approved)).unwrap();
        assert_eq!(change.current_step(), CurrentStep::Step(1));

        let manager = ballot(Role::Manager, Decision::Approved);
        change.cast_vote(manager.clone()).unwrap();
        assert_eq!(change.current_step(), CurrentStep::Step(1));

        // The same manager voting again does not count twice
        assert!(matches!(change.cast_vote(manager), Err(AppError::Conflict(_))));

        change.cast_vote(ballot(Role::Admin, Decision::Approved)).unwrap();
        assert_eq!(change.current_step(), CurrentStep::Complete);
        assert!(change.is_ready_to_apply());
    }

    #[test]
    fn test_wrong_role_is_permission_error() {
        let mut change = two_step_change();
        let result = change.cast_vote(ballot(Role::Manager, Decision::Approved));
        assert!(matches!(result, Err(AppError::Permission(_))));
        assert!(change.approvals.is_empty());
    }

    #[test]
    fn test_rejection_halts_and_blocks_votes() {
        let mut change = two_step_change();
        change.cast_vote(ballot(Role::Developer, Decision::Rejected)).unwrap();

        assert_eq!(change.status, ChangeStatus::Failed);
        assert_eq!(change.failure, Some(FailureReason::Rejected));

        let result = change.cast_vote(ballot(Role::Developer, Decision::Approved));
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[test]
    fn test_changing_own_vote_supersedes() {
        let mut change = Change::new(
            ChangeKind::FieldUpdate,
            None,
            json!({"tableId": "t"}),
            Uuid::new_v4(),
            Uuid::new_v4(),
        );
        change
            .submit(vec![ApprovalStepDefinition::new(
                "technical",
                &[Role::Developer],
                2,
            )])
            .unwrap();

        let dev = ballot(Role::Developer, Decision::Approved);
        change.cast_vote(dev.clone()).unwrap();

        let flipped = Ballot {
            decision: Decision::Rejected,
            comments: Some("found a problem".into()),
            ..dev
        };
        change.cast_vote(flipped).unwrap();

        assert_eq!(change.approvals.len(), 1);
        assert_eq!(change.approvals[0].decision, Decision::Rejected);
        assert_eq!(change.status, ChangeStatus::Failed);
    }

    #[test]
    fn test_empty_plan_is_complete() {
        let mut change = Change::new(
            ChangeKind::Deployment,
            Some(EnvironmentType::Development),
            json!({"codepageId": "cp"}),
            Uuid::new_v4(),
            Uuid::new_v4(),
        );
        change.submit(Vec::new()).unwrap();
        assert_eq!(change.current_step(), CurrentStep::Complete);
        assert!(change.cast_vote(ballot(Role::Admin, Decision::Approved)).is_err());
    }

    #[test]
    fn test_submit_only_from_draft() {
        let mut change = two_step_change();
        assert!(matches!(change.submit(Vec::new()), Err(AppError::Conflict(_))));
    }

    #[test]
    fn test_kind_names_parse_back() {
        for kind in ChangeKind::ALL {
            assert_eq!(kind.as_str().parse::<ChangeKind>().unwrap(), kind);
        }
        assert!("table_truncate".parse::<ChangeKind>().is_err());
    }
}
