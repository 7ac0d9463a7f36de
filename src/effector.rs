//! Effector - the seam to the external platform
//!
//! The engine never talks to the platform's schema or deployment APIs
//! itself. It hands an approved change to an effector, which performs the
//! mutation and returns enough state to undo it later.

use crate::change::{Change, ChangeKind};
use crate::pipeline::EnvironmentType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EffectorError {
    /// Timeouts and transient network failures; safe to try again
    #[error("Retryable effector error: {0}")]
    Retryable(String),

    /// The platform refused the mutation; needs a human
    #[error("Fatal effector error: {0}")]
    Fatal(String),
}

impl EffectorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EffectorError::Retryable(_))
    }
}

/// What an effector is told about the change it realizes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDescriptor {
    pub change_id: Uuid,
    pub kind: ChangeKind,
    pub environment_type: Option<EnvironmentType>,
    pub scope_id: Uuid,
    pub payload: Value,
}

impl From<&Change> for ChangeDescriptor {
    fn from(change: &Change) -> Self {
        Self {
            change_id: change.id,
            kind: change.kind,
            environment_type: change.environment_type,
            scope_id: change.scope_id,
            payload: change.payload.clone(),
        }
    }
}

/// Performs and reverts mutations against the external platform
#[async_trait]
pub trait Effector: Send + Sync {
    /// Realize the change; returns the rollback snapshot
    async fn apply(&self, change: &ChangeDescriptor) -> Result<Value, EffectorError>;

    /// Undo a previously applied change from its snapshot
    async fn revert(&self, change: &ChangeDescriptor, snapshot: &Value) -> Result<(), EffectorError>;
}

/// Effector that records mutations in memory instead of calling the platform.
///
/// Used when the service runs without a platform client configured.
pub struct SandboxEffector {
    applied: RwLock<HashMap<Uuid, Value>>,
}

impl SandboxEffector {
    pub fn new() -> Self {
        Self {
            applied: RwLock::new(HashMap::new()),
        }
    }

    pub async fn applied_count(&self) -> usize {
        self.applied.read().await.len()
    }
}

impl Default for SandboxEffector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Effector for SandboxEffector {
    async fn apply(&self, change: &ChangeDescriptor) -> Result<Value, EffectorError> {
        let mut applied = self.applied.write().await;
        if applied.contains_key(&change.change_id) {
            return Err(EffectorError::Fatal(format!(
                "Change {} was already applied in the sandbox",
                change.change_id
            )));
        }
        applied.insert(change.change_id, change.payload.clone());

        info!("🧪 Sandbox applied {} ({})", change.change_id, change.kind.as_str());
        Ok(json!({
            "sandbox": true,
            "changeId": change.change_id,
            "kind": change.kind,
            "applied": change.payload,
        }))
    }

    async fn revert(&self, change: &ChangeDescriptor, _snapshot: &Value) -> Result<(), EffectorError> {
        let mut applied = self.applied.write().await;
        applied.remove(&change.change_id).ok_or_else(|| {
            EffectorError::Fatal(format!("Change {} is not applied in the sandbox", change.change_id))
        })?;

        info!("🧪 Sandbox reverted {}", change.change_id);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ChangeDescriptor {
        ChangeDescriptor {
            change_id: Uuid::new_v4(),
            kind: ChangeKind::FieldCreate,
            environment_type: None,
            scope_id: Uuid::new_v4(),
            payload: json!({"tableId": "t", "field": {"name": "a", "fieldType": "text"}}),
        }
    }

    #[tokio::test]
    async fn test_sandbox_apply_then_revert() {
        let sandbox = SandboxEffector::new();
        let change = descriptor();

        let snapshot = sandbox.apply(&change).await.unwrap();
        assert_eq!(snapshot["applied"], change.payload);
        assert_eq!(sandbox.applied_count().await, 1);

        sandbox.revert(&change, &snapshot).await.unwrap();
        assert_eq!(sandbox.applied_count().await, 0);
    }

    #[tokio::test]
    async fn test_sandbox_refuses_double_apply_and_unknown_revert() {
        let sandbox = SandboxEffector::new();
        let change = descriptor();

        sandbox.apply(&change).await.unwrap();
        let err = sandbox.apply(&change).await.unwrap_err();
        assert!(!err.is_retryable());

        let other = descriptor();
        assert!(sandbox.revert(&other, &Value::Null).await.is_err());
    }
}
