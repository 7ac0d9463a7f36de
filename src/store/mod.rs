//! Change Store
//!
//! Durable record of every change, its vote history and the audit trail,
//! plus the catalog of scopes, environments and pipelines changes refer to.
//!
//! Changes are only ever written through `commit`, a compare-and-swap on the
//! change version. The store never holds a lock across an await on anything
//! but itself, so slow effector calls happen outside of it.

mod memory;
mod postgres;

pub use memory::InMemoryChangeStore;
pub use postgres::PostgresChangeStore;

use crate::audit::{AuditEvent, AuditFilter, Page, Paged};
use crate::change::{ApprovalRecord, Change, ChangeKind, ChangeStatus, TableScope};
use crate::error::AppError;
use crate::pipeline::{Environment, Pipeline};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

/// One atomic write: the new state of a change, the vote that produced it,
/// audit events, and changes created alongside it (rollback requests)
#[derive(Debug, Clone)]
pub struct ChangeCommit {
    pub change: Change,
    /// Version the caller read; the write fails with a conflict otherwise
    pub expected_version: u64,
    pub approval: Option<ApprovalRecord>,
    pub events: Vec<AuditEvent>,
    pub inserts: Vec<Change>,
}

impl ChangeCommit {
    pub fn new(change: Change, expected_version: u64) -> Self {
        Self {
            change,
            expected_version,
            approval: None,
            events: Vec::new(),
            inserts: Vec::new(),
        }
    }

    pub fn with_approval(mut self, record: ApprovalRecord) -> Self {
        self.approval = Some(record);
        self
    }

    pub fn with_event(mut self, event: AuditEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn with_insert(mut self, change: Change) -> Self {
        self.inserts.push(change);
        self
    }
}

/// Filters for listing changes (the "pending approvals" query among others)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeFilter {
    pub scope_id: Option<Uuid>,
    pub status: Option<ChangeStatus>,
    pub kind: Option<ChangeKind>,
    pub author_id: Option<Uuid>,
    pub run_id: Option<Uuid>,
}

impl ChangeFilter {
    pub fn matches(&self, change: &Change) -> bool {
        self.scope_id.map_or(true, |id| change.scope_id == id)
            && self.status.map_or(true, |s| change.status == s)
            && self.kind.map_or(true, |k| change.kind == k)
            && self.author_id.map_or(true, |id| change.author_id == id)
            && self
                .run_id
                .map_or(true, |id| change.pipeline.map(|l| l.run_id) == Some(id))
    }
}

/// Exclusive, expiring claim on a key (a change id or a pipeline run id)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: Uuid,
    pub holder: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(key: Uuid, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        Self {
            key,
            holder: Uuid::new_v4(),
            expires_at: Utc::now() + ttl,
        }
    }

    /// Same holder, fresh expiry
    pub fn renewed(&self, ttl: Duration) -> Self {
        Self {
            expires_at: Lease::new(self.key, ttl).expires_at,
            ..self.clone()
        }
    }

    /// Time left before the lease can be taken over
    pub fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

#[async_trait]
pub trait ChangeStore: Send + Sync {
    // --- changes -----------------------------------------------------------

    async fn insert_change(&self, change: &Change, events: &[AuditEvent]) -> Result<(), AppError>;

    async fn get_change(&self, id: Uuid) -> Result<Option<Change>, AppError>;

    /// Compare-and-swap on `expected_version`; returns the stored change
    /// with its version bumped
    async fn commit(&self, commit: ChangeCommit) -> Result<Change, AppError>;

    /// Newest first
    async fn list_changes(&self, filter: &ChangeFilter, page: Page) -> Result<Paged<Change>, AppError>;

    /// Pending changes submitted before the cutoff
    async fn list_stale_pending(&self, submitted_before: DateTime<Utc>) -> Result<Vec<Change>, AppError>;

    // --- approval history and audit ---------------------------------------

    /// Every vote ever cast on a change, oldest first
    async fn list_approval_records(&self, change_id: Uuid) -> Result<Vec<ApprovalRecord>, AppError>;

    async fn append_audit(&self, events: &[AuditEvent]) -> Result<(), AppError>;

    /// Newest first
    async fn list_audit(&self, filter: &AuditFilter, page: Page) -> Result<Paged<AuditEvent>, AppError>;

    // --- leases ------------------------------------------------------------

    /// Conflict if an unexpired lease on `key` exists
    async fn acquire_lease(&self, key: Uuid, ttl: Duration) -> Result<Lease, AppError>;

    /// Push the expiry of a lease this holder still owns; Conflict once
    /// another holder has taken the key over
    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Lease, AppError>;

    /// Releasing a lease that was lost to expiry is a no-op
    async fn release_lease(&self, lease: &Lease) -> Result<(), AppError>;

    async fn lease_held(&self, key: Uuid) -> Result<bool, AppError>;

    // --- catalog -----------------------------------------------------------

    async fn insert_table_scope(&self, scope: &TableScope) -> Result<(), AppError>;

    async fn get_table_scope(&self, id: Uuid) -> Result<Option<TableScope>, AppError>;

    async fn insert_environment(&self, environment: &Environment) -> Result<(), AppError>;

    async fn get_environment(&self, id: Uuid) -> Result<Option<Environment>, AppError>;

    async fn list_environments(&self) -> Result<Vec<Environment>, AppError>;

    async fn insert_pipeline(&self, pipeline: &Pipeline) -> Result<(), AppError>;

    async fn get_pipeline(&self, id: Uuid) -> Result<Option<Pipeline>, AppError>;
}
