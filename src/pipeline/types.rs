//! Deployment environments, pipelines and pipeline runs

use crate::change::{Change, ChangeStatus, CurrentStep};
use crate::error::{validation_error, AppError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentType {
    Development,
    Staging,
    Production,
}

impl EnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::Development => "development",
            EnvironmentType::Staging => "staging",
            EnvironmentType::Production => "production",
        }
    }
}

impl FromStr for EnvironmentType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(EnvironmentType::Development),
            "staging" => Ok(EnvironmentType::Staging),
            "production" => Ok(EnvironmentType::Production),
            other => Err(validation_error(format!("Unknown environment type '{}'", other))),
        }
    }
}

/// A deployment target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub env_type: EnvironmentType,
}

impl Environment {
    pub fn new(name: impl Into<String>, env_type: EnvironmentType) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            env_type,
        }
    }
}

/// An ordered promotion path through environments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    pub id: Uuid,
    pub name: String,
    pub environments: Vec<Uuid>,
    pub auto_promote: bool,
    pub requires_approval: bool,
    /// Environments whose hops are approval-gated. Empty means every hop is
    /// gated when `requires_approval` is set.
    #[serde(default)]
    pub approval_environments: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Pipeline {
    pub fn new(
        name: impl Into<String>,
        environments: Vec<Uuid>,
        auto_promote: bool,
        requires_approval: bool,
        approval_environments: Vec<Uuid>,
    ) -> Result<Self, AppError> {
        let pipeline = Self {
            id: Uuid::new_v4(),
            name: name.into(),
            environments,
            auto_promote,
            requires_approval,
            approval_environments,
            created_at: Utc::now(),
        };
        pipeline.validate()?;
        Ok(pipeline)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.environments.is_empty() {
            return Err(validation_error("Pipeline needs at least one environment"));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = self.environments.iter().find(|id| !seen.insert(**id)) {
            return Err(validation_error(format!(
                "Environment {} appears more than once in the pipeline",
                dup
            )));
        }

        if let Some(stray) = self
            .approval_environments
            .iter()
            .find(|id| !self.environments.contains(id))
        {
            return Err(validation_error(format!(
                "Approval environment {} is not part of the pipeline",
                stray
            )));
        }

        Ok(())
    }

    /// Whether the hop into `environment_id` waits for an approval plan
    pub fn gates(&self, environment_id: Uuid) -> bool {
        self.requires_approval
            && (self.approval_environments.is_empty()
                || self.approval_environments.contains(&environment_id))
    }
}

/// Where a pipeline run currently stands, derived from its hop changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// The current hop has an unsatisfied approval plan
    AwaitingApproval,
    /// The current hop is approved or applied and needs `promote_next`
    AwaitingPromotion,
    /// A retryable effector failure left the current hop pending
    Retrying,
    Completed,
    Failed,
    /// A hop was rolled back by an operator
    Halted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineHop {
    pub index: usize,
    pub environment_id: Uuid,
    pub change_id: Option<Uuid>,
    pub status: Option<ChangeStatus>,
}

/// One promotion of a payload through a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub state: RunState,
    pub hops: Vec<PipelineHop>,
}

impl PipelineRun {
    /// Derive the run view from the pipeline and the hop changes opened so far
    pub fn derive(run_id: Uuid, pipeline: &Pipeline, changes: &[Change]) -> Self {
        let hops: Vec<PipelineHop> = pipeline
            .environments
            .iter()
            .enumerate()
            .map(|(index, environment_id)| {
                let change = changes
                    .iter()
                    .find(|c| c.pipeline.as_ref().map(|l| l.hop) == Some(index));
                PipelineHop {
                    index,
                    environment_id: *environment_id,
                    change_id: change.map(|c| c.id),
                    status: change.map(|c| c.status),
                }
            })
            .collect();

        let latest = changes
            .iter()
            .filter(|c| c.pipeline.is_some())
            .max_by_key(|c| c.pipeline.as_ref().map(|l| l.hop));

        let state = match latest {
            None => RunState::AwaitingPromotion,
            Some(change) => {
                let hop = change.pipeline.as_ref().map(|l| l.hop).unwrap_or(0);
                match change.status {
                    ChangeStatus::Applied if hop + 1 >= pipeline.environments.len() => {
                        RunState::Completed
                    }
                    ChangeStatus::Applied => RunState::AwaitingPromotion,
                    ChangeStatus::Pending if change.last_error.is_some() => RunState::Retrying,
                    ChangeStatus::Pending => match change.current_step() {
                        CurrentStep::Complete => RunState::AwaitingPromotion,
                        CurrentStep::Step(_) => RunState::AwaitingApproval,
                    },
                    ChangeStatus::Draft => RunState::AwaitingPromotion,
                    ChangeStatus::Failed => RunState::Failed,
                    ChangeStatus::RolledBack => RunState::Halted,
                }
            }
        };

        Self {
            id: run_id,
            pipeline_id: pipeline.id,
            state,
            hops,
        }
    }

    /// Index of the highest hop opened so far
    pub fn current_hop(&self) -> Option<&PipelineHop> {
        self.hops.iter().rev().find(|h| h.change_id.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn test_pipeline_rejects_empty_and_duplicates() {
        assert!(Pipeline::new("empty", vec![], false, false, vec![]).is_err());

        let env = Uuid::new_v4();
        let result = Pipeline::new("dup", vec![env, env], false, false, vec![]);
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_pipeline_rejects_foreign_approval_environment() {
        let envs = ids(2);
        let result = Pipeline::new("p", envs, false, true, vec![Uuid::new_v4()]);
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_gating() {
        let envs = ids(3);
        let all = Pipeline::new("all", envs.clone(), false, true, vec![]).unwrap();
        assert!(envs.iter().all(|e| all.gates(*e)));

        let prod_only = Pipeline::new("prod", envs.clone(), false, true, vec![envs[2]]).unwrap();
        assert!(!prod_only.gates(envs[0]));
        assert!(!prod_only.gates(envs[1]));
        assert!(prod_only.gates(envs[2]));

        let open = Pipeline::new("open", envs.clone(), true, false, vec![]).unwrap();
        assert!(envs.iter().all(|e| !open.gates(*e)));
    }

    #[test]
    fn test_environment_type_roundtrip_names() {
        for t in [
            EnvironmentType::Development,
            EnvironmentType::Staging,
            EnvironmentType::Production,
        ] {
            assert_eq!(t.as_str().parse::<EnvironmentType>().unwrap(), t);
        }
    }
}
