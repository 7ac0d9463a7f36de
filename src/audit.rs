//! Audit log
//!
//! Append-only projection of every change transition, vote and effector
//! attempt. Events are never updated; the queryable log is a filtered,
//! newest-first view over them.

use crate::change::{Change, ChangeKind, ChangeStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{validation_error, AppError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ChangeDrafted,
    DraftUpdated,
    ChangeSubmitted,
    VoteCast,
    ChangeRejected,
    ChangeWithdrawn,
    ChangeExpired,
    ApplyAttemptFailed,
    ChangeApplied,
    ChangeFailed,
    RollbackRequested,
    ChangeRolledBack,
    RollbackFailed,
    PipelineHopOpened,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::ChangeDrafted => "change_drafted",
            AuditAction::DraftUpdated => "draft_updated",
            AuditAction::ChangeSubmitted => "change_submitted",
            AuditAction::VoteCast => "vote_cast",
            AuditAction::ChangeRejected => "change_rejected",
            AuditAction::ChangeWithdrawn => "change_withdrawn",
            AuditAction::ChangeExpired => "change_expired",
            AuditAction::ApplyAttemptFailed => "apply_attempt_failed",
            AuditAction::ChangeApplied => "change_applied",
            AuditAction::ChangeFailed => "change_failed",
            AuditAction::RollbackRequested => "rollback_requested",
            AuditAction::ChangeRolledBack => "change_rolled_back",
            AuditAction::RollbackFailed => "rollback_failed",
            AuditAction::PipelineHopOpened => "pipeline_hop_opened",
        }
    }
}

impl FromStr for AuditAction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| validation_error(format!("Unknown audit action '{}'", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: Uuid,
    pub change_id: Uuid,
    pub scope_id: Uuid,
    pub kind: ChangeKind,
    /// Author of the change the event belongs to
    pub author_id: Uuid,
    /// Who caused the event; `None` for the background sweeper
    pub actor_id: Option<Uuid>,
    pub action: AuditAction,
    /// Change status after the event
    pub status: ChangeStatus,
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// Event describing `change` as it stands after the transition
    pub fn for_change(change: &Change, actor_id: Option<Uuid>, action: AuditAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            change_id: change.id,
            scope_id: change.scope_id,
            kind: change.kind,
            author_id: change.author_id,
            actor_id,
            action,
            status: change.status,
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Filters for `list_audit_log`; every field narrows the result
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFilter {
    pub scope_id: Option<Uuid>,
    pub status: Option<ChangeStatus>,
    pub kind: Option<ChangeKind>,
    pub author_id: Option<Uuid>,
    pub change_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.scope_id.map_or(true, |id| event.scope_id == id)
            && self.status.map_or(true, |s| event.status == s)
            && self.kind.map_or(true, |k| event.kind == k)
            && self.author_id.map_or(true, |id| event.author_id == id)
            && self.change_id.map_or(true, |id| event.change_id == id)
            && self.from.map_or(true, |from| event.timestamp >= from)
            && self.to.map_or(true, |to| event.timestamp <= to)
    }
}

/// Page request (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    50
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: default_page(),
            per_page: default_per_page(),
        }
    }
}

impl Page {
    pub const MAX_PER_PAGE: u32 = 500;

    pub fn new(page: u32, per_page: u32) -> Self {
        Self { page, per_page }
    }

    pub fn limit(&self) -> usize {
        self.per_page.clamp(1, Self::MAX_PER_PAGE) as usize
    }

    pub fn offset(&self) -> usize {
        (self.page.max(1) as usize - 1) * self.limit()
    }

    /// Slice an already-ordered result set
    pub fn apply<T>(&self, items: Vec<T>) -> Paged<T> {
        let total = items.len() as u64;
        let items = items.into_iter().skip(self.offset()).take(self.limit()).collect();
        Paged::new(items, total, *self)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

impl<T> Paged<T> {
    pub fn new(items: Vec<T>, total: u64, page: Page) -> Self {
        Self {
            items,
            total,
            page: page.page.max(1),
            per_page: page.limit() as u32,
        }
    }
}
