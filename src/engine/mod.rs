//! Approval engine
//!
//! Owns every transition of a change: submission, votes, application through
//! the effector, rollback and expiry. All writes go through the store's
//! compare-and-swap commit; effector calls happen under a per-change lease
//! and never while a store lock is held.

mod applier;
mod approval;
pub mod risk;
mod rollback;
mod sweeper;

pub use approval::NewChange;
pub use risk::RiskClassifier;
pub use rollback::RollbackOutcome;
pub use sweeper::spawn_expiry_sweeper;

use crate::config::EngineConfig;
use crate::change::Change;
use crate::effector::{Effector, EffectorError};
use crate::error::{not_found_error, AppError};
use crate::store::{ChangeStore, Lease};
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

pub struct ApprovalEngine {
    store: Arc<dyn ChangeStore>,
    effector: Arc<dyn Effector>,
    config: EngineConfig,
}

impl ApprovalEngine {
    pub fn new(store: Arc<dyn ChangeStore>, effector: Arc<dyn Effector>, config: EngineConfig) -> Self {
        Self {
            store,
            effector,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ChangeStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn load(&self, change_id: Uuid) -> Result<Change, AppError> {
        self.store
            .get_change(change_id)
            .await?
            .ok_or_else(|| not_found_error(format!("Change {} not found", change_id)))
    }

    /// Run one effector call under `lease`.
    ///
    /// The lease is renewed first (Conflict if another worker took it over)
    /// and the call is cut off well before the renewed lease can expire, so
    /// no two workers ever have an effector call in flight for the same key.
    /// A cut-off call counts as a retryable timeout.
    async fn under_lease<T>(
        &self,
        lease: &mut Lease,
        call: impl Future<Output = Result<T, EffectorError>>,
    ) -> Result<Result<T, EffectorError>, AppError> {
        *lease = self.store.renew_lease(lease, self.config.lease_ttl).await?;

        let budget = lease
            .remaining()
            .mul_f64(0.8)
            .min(self.config.effector_timeout);
        match tokio::time::timeout(budget, call).await {
            Ok(outcome) => Ok(outcome),
            Err(_) => Ok(Err(EffectorError::Retryable(format!(
                "effector call timed out after {:?}",
                budget
            )))),
        }
    }
}
