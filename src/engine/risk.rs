//! Risk classification
//!
//! Maps a change kind (and, for deployments, the target environment type) to
//! the approval plan it must clear. The plan is snapshotted onto the change at
//! submission and never recomputed.

use crate::auth::Role;
use crate::change::{ApprovalStepDefinition, ChangeKind};
use crate::pipeline::EnvironmentType;
use serde::{Deserialize, Serialize};

pub const TECHNICAL_REVIEW: &str = "technical_review";
pub const MANAGER_APPROVAL: &str = "manager_approval";
pub const FINAL_APPROVAL: &str = "final_approval";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Standard,
    Elevated,
    Destructive,
}

pub struct RiskClassifier;

impl RiskClassifier {
    pub fn tier(kind: ChangeKind, environment: Option<EnvironmentType>) -> RiskTier {
        match kind {
            ChangeKind::TableDelete | ChangeKind::FieldDelete => RiskTier::Destructive,
            ChangeKind::TableCreate | ChangeKind::RelationshipCreate => RiskTier::Elevated,
            ChangeKind::Deployment if environment == Some(EnvironmentType::Production) => {
                RiskTier::Elevated
            }
            _ => RiskTier::Standard,
        }
    }

    /// Ordered approval plan for a change
    pub fn classify(
        kind: ChangeKind,
        environment: Option<EnvironmentType>,
    ) -> Vec<ApprovalStepDefinition> {
        let technical =
            ApprovalStepDefinition::new(TECHNICAL_REVIEW, &[Role::Developer, Role::Admin], 1);
        let manager = ApprovalStepDefinition::new(MANAGER_APPROVAL, &[Role::Manager, Role::Admin], 1);
        let admin = ApprovalStepDefinition::new(FINAL_APPROVAL, &[Role::Admin], 1);

        match Self::tier(kind, environment) {
            RiskTier::Destructive => vec![technical, manager, admin],
            RiskTier::Elevated => vec![technical, manager],
            RiskTier::Standard => vec![technical],
        }
    }

    /// Whether reverting an applied change needs its own approval
    pub fn is_high_risk(kind: ChangeKind, environment: Option<EnvironmentType>) -> bool {
        match kind {
            ChangeKind::TableDelete | ChangeKind::FieldDelete => true,
            ChangeKind::Deployment => environment == Some(EnvironmentType::Production),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn names(plan: &[ApprovalStepDefinition]) -> Vec<&str> {
        plan.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_destructive_kinds_need_three_steps() {
        for kind in [ChangeKind::TableDelete, ChangeKind::FieldDelete] {
            let plan = RiskClassifier::classify(kind, None);
            assert_eq!(
                names(&plan),
                vec![TECHNICAL_REVIEW, MANAGER_APPROVAL, FINAL_APPROVAL]
            );
            assert!(plan[2].accepts(Role::Admin));
            assert!(!plan[2].accepts(Role::Manager));
        }
    }

    #[test]
    fn test_production_deployment_is_elevated() {
        let prod = RiskClassifier::classify(ChangeKind::Deployment, Some(EnvironmentType::Production));
        assert_eq!(names(&prod), vec![TECHNICAL_REVIEW, MANAGER_APPROVAL]);

        let staging = RiskClassifier::classify(ChangeKind::Deployment, Some(EnvironmentType::Staging));
        assert_eq!(names(&staging), vec![TECHNICAL_REVIEW]);
    }

    #[test]
    fn test_plan_length_follows_risk() {
        let len = |kind| RiskClassifier::classify(kind, None).len();
        assert!(len(ChangeKind::TableDelete) >= len(ChangeKind::TableCreate));
        assert!(len(ChangeKind::TableCreate) >= len(ChangeKind::FieldUpdate));

        // A higher tier never yields a shorter plan
        for a in ChangeKind::ALL {
            for b in ChangeKind::ALL {
                if RiskClassifier::tier(a, None) > RiskClassifier::tier(b, None) {
                    assert!(len(a) > len(b), "{:?} vs {:?}", a, b);
                }
            }
        }
    }

    #[test]
    fn test_every_plan_is_satisfiable_by_an_admin() {
        for kind in ChangeKind::ALL {
            for step in RiskClassifier::classify(kind, Some(EnvironmentType::Production)) {
                assert!(step.accepts(Role::Admin));
                assert_eq!(step.min_approvals, 1);
            }
        }
    }

    #[test]
    fn test_high_risk_rollbacks() {
        assert!(RiskClassifier::is_high_risk(ChangeKind::TableDelete, None));
        assert!(RiskClassifier::is_high_risk(ChangeKind::FieldDelete, None));
        assert!(RiskClassifier::is_high_risk(
            ChangeKind::Deployment,
            Some(EnvironmentType::Production)
        ));
        assert!(!RiskClassifier::is_high_risk(
            ChangeKind::Deployment,
            Some(EnvironmentType::Development)
        ));
        assert!(!RiskClassifier::is_high_risk(ChangeKind::TableCreate, None));
    }
}
