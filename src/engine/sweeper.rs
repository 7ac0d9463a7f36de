//! Expiry sweeper
//!
//! Fails pending changes that sat without a decision for longer than the
//! configured TTL.

use crate::audit::{AuditAction, AuditEvent};
use crate::change::{ChangeStatus, FailureReason};
use crate::engine::ApprovalEngine;
use crate::error::AppError;
use crate::store::ChangeCommit;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

impl ApprovalEngine {
    /// Expire every pending change submitted more than one TTL before `now`.
    /// Changes under an active lease are skipped. Returns how many expired.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        let ttl = chrono::Duration::from_std(self.config.change_ttl)
            .map_err(|e| AppError::Config(format!("Change TTL out of range: {}", e)))?;
        let stale = self.store.list_stale_pending(now - ttl).await?;

        let mut expired = 0;
        for candidate in stale {
            let lease = match self.store.acquire_lease(candidate.id, self.config.lease_ttl).await {
                Ok(lease) => lease,
                Err(AppError::Conflict(_)) => {
                    debug!("Change {} is leased, not expiring it", candidate.id);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let result = self.expire_leased(candidate.id).await;
            if let Err(e) = self.store.release_lease(&lease).await {
                warn!("Failed to release sweep lease on change {}: {}", candidate.id, e);
            }

            match result {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(AppError::Conflict(_)) => {
                    debug!("Change {} moved while sweeping, skipped", candidate.id);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(expired)
    }

    async fn expire_leased(&self, change_id: uuid::Uuid) -> Result<bool, AppError> {
        let mut change = self.load(change_id).await?;
        if change.status != ChangeStatus::Pending {
            return Ok(false);
        }

        let expected = change.version;
        change.fail(FailureReason::Expired, None);
        let event = AuditEvent::for_change(&change, None, AuditAction::ChangeExpired).with_details(json!({
            "submittedAt": change.submitted_at,
            "ttlSecs": self.config.change_ttl.as_secs(),
        }));
        self.store
            .commit(ChangeCommit::new(change, expected).with_event(event))
            .await?;

        info!("⌛ Change {} expired without a decision", change_id);
        Ok(true)
    }
}

/// Run `expire_stale` on the configured interval until the runtime shuts down
pub fn spawn_expiry_sweeper(engine: Arc<ApprovalEngine>) -> JoinHandle<()> {
    let period = engine.config().sweep_interval.max(Duration::from_secs(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("⌛ Expiry sweeper running every {:?}", period);

        loop {
            ticker.tick().await;
            match engine.expire_stale(Utc::now()).await {
                Ok(0) => {}
                Ok(n) => info!("⌛ Sweep expired {} stale changes", n),
                Err(e) => error!("Expiry sweep failed: {}", e),
            }
        }
    })
}
