//! PostgreSQL change store
//!
//! Changes are kept as JSONB documents next to the columns we filter on.
//! The `version` column is authoritative; compare-and-swap is a conditional
//! UPDATE inside the same transaction as the vote and audit inserts.

use crate::audit::{AuditAction, AuditEvent, AuditFilter, Page, Paged};
use crate::change::{ApprovalRecord, Change, TableScope};
use crate::error::{conflict_error, not_found_error, AppError};
use crate::pipeline::{Environment, Pipeline};
use crate::store::{ChangeCommit, ChangeFilter, ChangeStore, Lease};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Pool, Transaction};
use postgres_types::ToSql;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio_postgres::Row;
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS changes (
        id UUID PRIMARY KEY,
        kind VARCHAR(32) NOT NULL,
        status VARCHAR(16) NOT NULL,
        scope_id UUID NOT NULL,
        author_id UUID NOT NULL,
        run_id UUID,
        version BIGINT NOT NULL,
        data JSONB NOT NULL,
        submitted_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_changes_scope_status ON changes(scope_id, status);
    CREATE INDEX IF NOT EXISTS idx_changes_pending_submitted ON changes(submitted_at) WHERE status = 'pending';
    CREATE INDEX IF NOT EXISTS idx_changes_run ON changes(run_id) WHERE run_id IS NOT NULL;

    CREATE TABLE IF NOT EXISTS approval_records (
        id UUID PRIMARY KEY,
        change_id UUID NOT NULL REFERENCES changes(id) ON DELETE CASCADE,
        step_index INTEGER NOT NULL,
        approver_id UUID NOT NULL,
        approver_role VARCHAR(16) NOT NULL,
        decision VARCHAR(16) NOT NULL,
        comments TEXT,
        created_at TIMESTAMPTZ NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_approval_records_change ON approval_records(change_id, created_at);

    CREATE TABLE IF NOT EXISTS audit_events (
        seq BIGSERIAL PRIMARY KEY,
        id UUID UNIQUE NOT NULL,
        change_id UUID NOT NULL,
        scope_id UUID NOT NULL,
        kind VARCHAR(32) NOT NULL,
        author_id UUID NOT NULL,
        actor_id UUID,
        action VARCHAR(32) NOT NULL,
        status VARCHAR(16) NOT NULL,
        details JSONB,
        created_at TIMESTAMPTZ NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_audit_events_scope_status ON audit_events(scope_id, status);
    CREATE INDEX IF NOT EXISTS idx_audit_events_change ON audit_events(change_id);

    CREATE TABLE IF NOT EXISTS change_leases (
        key UUID PRIMARY KEY,
        holder UUID NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    );

    CREATE TABLE IF NOT EXISTS table_scopes (
        id UUID PRIMARY KEY,
        name VARCHAR(255) NOT NULL
    );

    CREATE TABLE IF NOT EXISTS environments (
        id UUID PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        env_type VARCHAR(16) NOT NULL
    );

    CREATE TABLE IF NOT EXISTS pipelines (
        id UUID PRIMARY KEY,
        data JSONB NOT NULL
    );
"#;

const INSERT_CHANGE: &str = r#"
    INSERT INTO changes (id, kind, status, scope_id, author_id, run_id, version, data, submitted_at, created_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
"#;

const UPDATE_CHANGE_CAS: &str = r#"
    UPDATE changes
    SET status = $3, run_id = $4, version = $2 + 1, data = $5, submitted_at = $6
    WHERE id = $1 AND version = $2
"#;

const INSERT_APPROVAL_RECORD: &str = r#"
    INSERT INTO approval_records (id, change_id, step_index, approver_id, approver_role, decision, comments, created_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
"#;

const INSERT_AUDIT_EVENT: &str = r#"
    INSERT INTO audit_events (id, change_id, scope_id, kind, author_id, actor_id, action, status, details, created_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
"#;

const ACQUIRE_LEASE: &str = r#"
    INSERT INTO change_leases (key, holder, expires_at)
    VALUES ($1, $2, $3)
    ON CONFLICT (key) DO UPDATE
        SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
        WHERE change_leases.expires_at <= now()
    RETURNING holder
"#;

const RENEW_LEASE: &str = r#"
    UPDATE change_leases SET expires_at = $3
    WHERE key = $1 AND holder = $2
    RETURNING holder
"#;

type Param = Box<dyn ToSql + Sync + Send>;

/// Incrementally built `WHERE` clause with positional parameters
#[derive(Default)]
struct WhereClause {
    conditions: Vec<String>,
    params: Vec<Param>,
}

impl WhereClause {
    /// `condition` uses `{}` where the placeholder goes, e.g. `"status = {}"`
    fn push<T: ToSql + Sync + Send + 'static>(&mut self, condition: &str, value: T) {
        self.params.push(Box::new(value));
        let placeholder = format!("${}", self.params.len());
        self.conditions.push(condition.replace("{}", &placeholder));
    }

    fn push_opt<T: ToSql + Sync + Send + 'static>(&mut self, condition: &str, value: Option<T>) {
        if let Some(value) = value {
            self.push(condition, value);
        }
    }

    fn sql(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.conditions.join(" AND "))
        }
    }

    fn params(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect()
    }

    fn for_changes(filter: &ChangeFilter) -> Self {
        let mut clause = Self::default();
        clause.push_opt("scope_id = {}", filter.scope_id);
        clause.push_opt("status = {}", filter.status.map(|s| s.as_str().to_string()));
        clause.push_opt("kind = {}", filter.kind.map(|k| k.as_str().to_string()));
        clause.push_opt("author_id = {}", filter.author_id);
        clause.push_opt("run_id = {}", filter.run_id);
        clause
    }

    fn for_audit(filter: &AuditFilter) -> Self {
        let mut clause = Self::default();
        clause.push_opt("scope_id = {}", filter.scope_id);
        clause.push_opt("status = {}", filter.status.map(|s| s.as_str().to_string()));
        clause.push_opt("kind = {}", filter.kind.map(|k| k.as_str().to_string()));
        clause.push_opt("author_id = {}", filter.author_id);
        clause.push_opt("change_id = {}", filter.change_id);
        clause.push_opt("created_at >= {}", filter.from);
        clause.push_opt("created_at <= {}", filter.to);
        clause
    }
}

fn decode<T: DeserializeOwned>(value: serde_json::Value, what: &str) -> Result<T, AppError> {
    serde_json::from_value(value)
        .map_err(|e| AppError::Internal(format!("Corrupt {} document: {}", what, e)))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, AppError> {
    serde_json::to_value(value).map_err(|e| AppError::Internal(format!("Serialization failed: {}", e)))
}

fn parse_column<T>(row: &Row, column: &str) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(column);
    raw.parse()
        .map_err(|e| AppError::Internal(format!("Bad value in column {}: {}", column, e)))
}

fn row_to_change(row: &Row) -> Result<Change, AppError> {
    let mut change: Change = decode(row.get("data"), "change")?;
    change.version = row.get::<_, i64>("version") as u64;
    Ok(change)
}

fn row_to_approval(row: &Row) -> Result<ApprovalRecord, AppError> {
    Ok(ApprovalRecord {
        id: row.get("id"),
        change_id: row.get("change_id"),
        step_index: row.get::<_, i32>("step_index") as usize,
        approver_id: row.get("approver_id"),
        approver_role: parse_column(row, "approver_role")?,
        decision: parse_column(row, "decision")?,
        comments: row.get("comments"),
        timestamp: row.get("created_at"),
    })
}

fn row_to_audit(row: &Row) -> Result<AuditEvent, AppError> {
    Ok(AuditEvent {
        id: row.get("id"),
        change_id: row.get("change_id"),
        scope_id: row.get("scope_id"),
        kind: parse_column(row, "kind")?,
        author_id: row.get("author_id"),
        actor_id: row.get("actor_id"),
        action: parse_column::<AuditAction>(row, "action")?,
        status: parse_column(row, "status")?,
        details: row.get("details"),
        timestamp: row.get("created_at"),
    })
}

async fn insert_change_row(client: &Transaction<'_>, change: &Change) -> Result<(), AppError> {
    client
        .execute(
            INSERT_CHANGE,
            &[
                &change.id,
                &change.kind.as_str(),
                &change.status.as_str(),
                &change.scope_id,
                &change.author_id,
                &change.pipeline.map(|l| l.run_id),
                &(change.version as i64),
                &encode(change)?,
                &change.submitted_at,
                &change.created_at,
            ],
        )
        .await?;
    Ok(())
}

async fn insert_audit_rows(client: &Transaction<'_>, events: &[AuditEvent]) -> Result<(), AppError> {
    for event in events {
        client
            .execute(
                INSERT_AUDIT_EVENT,
                &[
                    &event.id,
                    &event.change_id,
                    &event.scope_id,
                    &event.kind.as_str(),
                    &event.author_id,
                    &event.actor_id,
                    &event.action.as_str(),
                    &event.status.as_str(),
                    &event.details,
                    &event.timestamp,
                ],
            )
            .await?;
    }
    Ok(())
}

/// Change store backed by a deadpool connection pool
pub struct PostgresChangeStore {
    pool: Pool,
}

impl PostgresChangeStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they don't exist
    pub async fn init_schema(&self) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        client.batch_execute(SCHEMA).await?;
        info!("✅ Change store tables initialized");
        Ok(())
    }
}

#[async_trait]
impl ChangeStore for PostgresChangeStore {
    async fn insert_change(&self, change: &Change, events: &[AuditEvent]) -> Result<(), AppError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        insert_change_row(&tx, change).await?;
        insert_audit_rows(&tx, events).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_change(&self, id: Uuid) -> Result<Option<Change>, AppError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT version, data FROM changes WHERE id = $1", &[&id])
            .await?;
        row.as_ref().map(row_to_change).transpose()
    }

    async fn commit(&self, commit: ChangeCommit) -> Result<Change, AppError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let mut change = commit.change;
        change.version = commit.expected_version + 1;

        let updated = tx
            .execute(
                UPDATE_CHANGE_CAS,
                &[
                    &change.id,
                    &(commit.expected_version as i64),
                    &change.status.as_str(),
                    &change.pipeline.map(|l| l.run_id),
                    &encode(&change)?,
                    &change.submitted_at,
                ],
            )
            .await?;

        if updated == 0 {
            let exists = tx
                .query_opt("SELECT version FROM changes WHERE id = $1", &[&change.id])
                .await?;
            return Err(match exists {
                None => not_found_error(format!("Change {} not found", change.id)),
                Some(row) => {
                    let stored: i64 = row.get("version");
                    debug!(
                        "Version conflict on change {}: expected {}, stored {}",
                        change.id, commit.expected_version, stored
                    );
                    conflict_error(format!(
                        "Change {} was modified concurrently (expected version {}, found {})",
                        change.id, commit.expected_version, stored
                    ))
                }
            });
        }

        for inserted in &commit.inserts {
            insert_change_row(&tx, inserted).await?;
        }

        if let Some(record) = &commit.approval {
            tx.execute(
                INSERT_APPROVAL_RECORD,
                &[
                    &record.id,
                    &record.change_id,
                    &(record.step_index as i32),
                    &record.approver_id,
                    &record.approver_role.as_str(),
                    &record.decision.as_str(),
                    &record.comments,
                    &record.timestamp,
                ],
            )
            .await?;
        }

        insert_audit_rows(&tx, &commit.events).await?;
        tx.commit().await?;
        Ok(change)
    }

    async fn list_changes(&self, filter: &ChangeFilter, page: Page) -> Result<Paged<Change>, AppError> {
        let client = self.pool.get().await?;
        let clause = WhereClause::for_changes(filter);
        let params = clause.params();

        let count = format!("SELECT COUNT(*) FROM changes{}", clause.sql());
        let total: i64 = client
            .query_one(count.as_str(), &params)
            .await?
            .get(0);

        let query = format!(
            "SELECT version, data FROM changes{} ORDER BY created_at DESC LIMIT {} OFFSET {}",
            clause.sql(),
            page.limit(),
            page.offset()
        );
        let rows = client.query(query.as_str(), &params).await?;
        let items = rows.iter().map(row_to_change).collect::<Result<Vec<_>, _>>()?;

        Ok(Paged::new(items, total as u64, page))
    }

    async fn list_stale_pending(&self, submitted_before: DateTime<Utc>) -> Result<Vec<Change>, AppError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT version, data FROM changes WHERE status = 'pending' AND submitted_at < $1",
                &[&submitted_before],
            )
            .await?;
        rows.iter().map(row_to_change).collect()
    }

    async fn list_approval_records(&self, change_id: Uuid) -> Result<Vec<ApprovalRecord>, AppError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT * FROM approval_records WHERE change_id = $1 ORDER BY created_at, id",
                &[&change_id],
            )
            .await?;
        rows.iter().map(row_to_approval).collect()
    }

    async fn append_audit(&self, events: &[AuditEvent]) -> Result<(), AppError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        insert_audit_rows(&tx, events).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_audit(&self, filter: &AuditFilter, page: Page) -> Result<Paged<AuditEvent>, AppError> {
        let client = self.pool.get().await?;
        let clause = WhereClause::for_audit(filter);
        let params = clause.params();

        let count = format!("SELECT COUNT(*) FROM audit_events{}", clause.sql());
        let total: i64 = client
            .query_one(count.as_str(), &params)
            .await?
            .get(0);

        let query = format!(
            "SELECT * FROM audit_events{} ORDER BY seq DESC LIMIT {} OFFSET {}",
            clause.sql(),
            page.limit(),
            page.offset()
        );
        let rows = client.query(query.as_str(), &params).await?;
        let items = rows.iter().map(row_to_audit).collect::<Result<Vec<_>, _>>()?;

        Ok(Paged::new(items, total as u64, page))
    }

    async fn acquire_lease(&self, key: Uuid, ttl: Duration) -> Result<Lease, AppError> {
        let lease = Lease::new(key, ttl);
        let client = self.pool.get().await?;
        let row = client
            .query_opt(ACQUIRE_LEASE, &[&lease.key, &lease.holder, &lease.expires_at])
            .await?;

        match row {
            Some(_) => Ok(lease),
            None => Err(conflict_error(format!("{} is locked by another worker", key))),
        }
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Lease, AppError> {
        let renewed = lease.renewed(ttl);
        let client = self.pool.get().await?;
        let row = client
            .query_opt(RENEW_LEASE, &[&renewed.key, &renewed.holder, &renewed.expires_at])
            .await?;

        match row {
            Some(_) => Ok(renewed),
            None => Err(conflict_error(format!("Lease on {} was lost", lease.key))),
        }
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "DELETE FROM change_leases WHERE key = $1 AND holder = $2",
                &[&lease.key, &lease.holder],
            )
            .await?;
        Ok(())
    }

    async fn lease_held(&self, key: Uuid) -> Result<bool, AppError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT 1 FROM change_leases WHERE key = $1 AND expires_at > now()",
                &[&key],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn insert_table_scope(&self, scope: &TableScope) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO table_scopes (id, name) VALUES ($1, $2)",
                &[&scope.id, &scope.name],
            )
            .await?;
        Ok(())
    }

    async fn get_table_scope(&self, id: Uuid) -> Result<Option<TableScope>, AppError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT id, name FROM table_scopes WHERE id = $1", &[&id])
            .await?;
        Ok(row.map(|row| TableScope {
            id: row.get("id"),
            name: row.get("name"),
        }))
    }

    async fn insert_environment(&self, environment: &Environment) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO environments (id, name, env_type) VALUES ($1, $2, $3)",
                &[&environment.id, &environment.name, &environment.env_type.as_str()],
            )
            .await?;
        Ok(())
    }

    async fn get_environment(&self, id: Uuid) -> Result<Option<Environment>, AppError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT id, name, env_type FROM environments WHERE id = $1", &[&id])
            .await?;
        row.map(|row| {
            Ok(Environment {
                id: row.get("id"),
                name: row.get("name"),
                env_type: parse_column(&row, "env_type")?,
            })
        })
        .transpose()
    }

    async fn list_environments(&self) -> Result<Vec<Environment>, AppError> {
        let client = self.pool.get().await?;
        let rows = client
            .query("SELECT id, name, env_type FROM environments ORDER BY name", &[])
            .await?;
        rows.iter()
            .map(|row| {
                Ok(Environment {
                    id: row.get("id"),
                    name: row.get("name"),
                    env_type: parse_column(row, "env_type")?,
                })
            })
            .collect()
    }

    async fn insert_pipeline(&self, pipeline: &Pipeline) -> Result<(), AppError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO pipelines (id, data) VALUES ($1, $2)",
                &[&pipeline.id, &encode(pipeline)?],
            )
            .await?;
        Ok(())
    }

    async fn get_pipeline(&self, id: Uuid) -> Result<Option<Pipeline>, AppError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT data FROM pipelines WHERE id = $1", &[&id])
            .await?;
        row.map(|row| decode(row.get("data"), "pipeline")).transpose()
    }
}
