//! In-memory change store
//!
//! Used for tests and for running the service without a database. Change
//! rows, vote history and audit events share one lock so a commit is atomic.

use crate::audit::{AuditEvent, AuditFilter, Page, Paged};
use crate::change::{ApprovalRecord, Change, ChangeStatus, TableScope};
use crate::error::{conflict_error, not_found_error, AppError};
use crate::pipeline::{Environment, Pipeline};
use crate::store::{ChangeCommit, ChangeFilter, ChangeStore, Lease};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct ChangeTables {
    changes: HashMap<Uuid, Change>,
    approval_records: Vec<ApprovalRecord>,
    audit_events: Vec<AuditEvent>,
}

#[derive(Default)]
struct Catalog {
    table_scopes: HashMap<Uuid, TableScope>,
    environments: HashMap<Uuid, Environment>,
    pipelines: HashMap<Uuid, Pipeline>,
}

/// Thread-safe in-memory store
pub struct InMemoryChangeStore {
    tables: RwLock<ChangeTables>,
    leases: RwLock<HashMap<Uuid, Lease>>,
    catalog: RwLock<Catalog>,
}

impl InMemoryChangeStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(ChangeTables::default()),
            leases: RwLock::new(HashMap::new()),
            catalog: RwLock::new(Catalog::default()),
        }
    }
}

impl Default for InMemoryChangeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeStore for InMemoryChangeStore {
    async fn insert_change(&self, change: &Change, events: &[AuditEvent]) -> Result<(), AppError> {
        let mut tables = self.tables.write().await;
        if tables.changes.contains_key(&change.id) {
            return Err(conflict_error(format!("Change {} already exists", change.id)));
        }
        tables.changes.insert(change.id, change.clone());
        tables.audit_events.extend_from_slice(events);
        Ok(())
    }

    async fn get_change(&self, id: Uuid) -> Result<Option<Change>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables.changes.get(&id).cloned())
    }

    async fn commit(&self, commit: ChangeCommit) -> Result<Change, AppError> {
        let mut tables = self.tables.write().await;

        let stored = tables
            .changes
            .get(&commit.change.id)
            .ok_or_else(|| not_found_error(format!("Change {} not found", commit.change.id)))?;

        if stored.version != commit.expected_version {
            debug!(
                "Version conflict on change {}: expected {}, stored {}",
                commit.change.id, commit.expected_version, stored.version
            );
            return Err(conflict_error(format!(
                "Change {} was modified concurrently (expected version {}, found {})",
                commit.change.id, commit.expected_version, stored.version
            )));
        }

        if let Some(dup) = commit.inserts.iter().find(|c| tables.changes.contains_key(&c.id)) {
            return Err(conflict_error(format!("Change {} already exists", dup.id)));
        }

        let mut change = commit.change;
        change.version = commit.expected_version + 1;
        tables.changes.insert(change.id, change.clone());

        for inserted in commit.inserts {
            tables.changes.insert(inserted.id, inserted);
        }
        if let Some(record) = commit.approval {
            tables.approval_records.push(record);
        }
        tables.audit_events.extend(commit.events);

        Ok(change)
    }

    async fn list_changes(&self, filter: &ChangeFilter, page: Page) -> Result<Paged<Change>, AppError> {
        let tables = self.tables.read().await;
        let mut matching: Vec<Change> = tables
            .changes
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page.apply(matching))
    }

    async fn list_stale_pending(&self, submitted_before: DateTime<Utc>) -> Result<Vec<Change>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .changes
            .values()
            .filter(|c| {
                c.status == ChangeStatus::Pending
                    && c.submitted_at.unwrap_or(c.created_at) < submitted_before
            })
            .cloned()
            .collect())
    }

    async fn list_approval_records(&self, change_id: Uuid) -> Result<Vec<ApprovalRecord>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .approval_records
            .iter()
            .filter(|r| r.change_id == change_id)
            .cloned()
            .collect())
    }

    async fn append_audit(&self, events: &[AuditEvent]) -> Result<(), AppError> {
        let mut tables = self.tables.write().await;
        tables.audit_events.extend_from_slice(events);
        Ok(())
    }

    async fn list_audit(&self, filter: &AuditFilter, page: Page) -> Result<Paged<AuditEvent>, AppError> {
        let tables = self.tables.read().await;
        let matching: Vec<AuditEvent> = tables
            .audit_events
            .iter()
            .rev() // Most recent first
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        Ok(page.apply(matching))
    }

    async fn acquire_lease(&self, key: Uuid, ttl: Duration) -> Result<Lease, AppError> {
        let mut leases = self.leases.write().await;
        if let Some(current) = leases.get(&key) {
            if !current.is_expired() {
                return Err(conflict_error(format!("{} is locked by another worker", key)));
            }
        }
        let lease = Lease::new(key, ttl);
        leases.insert(key, lease.clone());
        Ok(lease)
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Lease, AppError> {
        let mut leases = self.leases.write().await;
        match leases.get_mut(&lease.key) {
            Some(current) if current.holder == lease.holder => {
                *current = lease.renewed(ttl);
                Ok(current.clone())
            }
            _ => Err(conflict_error(format!("Lease on {} was lost", lease.key))),
        }
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), AppError> {
        let mut leases = self.leases.write().await;
        if leases.get(&lease.key).map(|l| l.holder) == Some(lease.holder) {
            leases.remove(&lease.key);
        }
        Ok(())
    }

    async fn lease_held(&self, key: Uuid) -> Result<bool, AppError> {
        let leases = self.leases.read().await;
        Ok(leases.get(&key).map_or(false, |l| !l.is_expired()))
    }

    async fn insert_table_scope(&self, scope: &TableScope) -> Result<(), AppError> {
        let mut catalog = self.catalog.write().await;
        catalog.table_scopes.insert(scope.id, scope.clone());
        Ok(())
    }

    async fn get_table_scope(&self, id: Uuid) -> Result<Option<TableScope>, AppError> {
        let catalog = self.catalog.read().await;
        Ok(catalog.table_scopes.get(&id).cloned())
    }

    async fn insert_environment(&self, environment: &Environment) -> Result<(), AppError> {
        let mut catalog = self.catalog.write().await;
        catalog.environments.insert(environment.id, environment.clone());
        Ok(())
    }

    async fn get_environment(&self, id: Uuid) -> Result<Option<Environment>, AppError> {
        let catalog = self.catalog.read().await;
        Ok(catalog.environments.get(&id).cloned())
    }

    async fn list_environments(&self) -> Result<Vec<Environment>, AppError> {
        let catalog = self.catalog.read().await;
        let mut environments: Vec<Environment> = catalog.environments.values().cloned().collect();
        environments.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(environments)
    }

    async fn insert_pipeline(&self, pipeline: &Pipeline) -> Result<(), AppError> {
        let mut catalog = self.catalog.write().await;
        catalog.pipelines.insert(pipeline.id, pipeline.clone());
        Ok(())
    }

    async fn get_pipeline(&self, id: Uuid) -> Result<Option<Pipeline>, AppError> {
        let catalog = self.catalog.read().await;
        Ok(catalog.pipelines.get(&id).cloned())
    }
}
