//! Pipeline promoter
//!
//! Moves a deployment through a pipeline's environments one hop at a time.
//! Each hop is a deployment change scoped to its environment; gated hops wait
//! for their approval plan, ungated hops are applied as soon as they open.
//! A failed hop halts the run and earlier hops stay applied.

use crate::audit::{AuditAction, AuditEvent, Page};
use crate::change::{Change, ChangeKind, ChangePayload, ChangeStatus, CurrentStep, PipelineLink};
use crate::engine::{ApprovalEngine, NewChange, RiskClassifier};
use crate::error::{not_found_error, AppError};
use crate::pipeline::{Pipeline, PipelineRun};
use crate::store::ChangeFilter;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a single forward step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Advanced,
    Blocked,
}

impl From<bool> for Step {
    fn from(advanced: bool) -> Self {
        if advanced {
            Step::Advanced
        } else {
            Step::Blocked
        }
    }
}

pub struct PipelinePromoter {
    engine: Arc<ApprovalEngine>,
}

impl PipelinePromoter {
    pub fn new(engine: Arc<ApprovalEngine>) -> Self {
        Self { engine }
    }

    async fn load_pipeline(&self, pipeline_id: Uuid) -> Result<Pipeline, AppError> {
        self.engine
            .store()
            .get_pipeline(pipeline_id)
            .await?
            .ok_or_else(|| not_found_error(format!("Pipeline {} not found", pipeline_id)))
    }

    /// Hop changes of a run, ordered by hop
    async fn hops(&self, run_id: Uuid) -> Result<Vec<Change>, AppError> {
        let filter = ChangeFilter {
            run_id: Some(run_id),
            ..ChangeFilter::default()
        };
        let mut hops = self
            .engine
            .store()
            .list_changes(&filter, Page::new(1, Page::MAX_PER_PAGE))
            .await?
            .items;
        hops.sort_by_key(|c| c.pipeline.map(|l| l.hop));

        if hops.is_empty() {
            return Err(not_found_error(format!("Pipeline run {} not found", run_id)));
        }
        Ok(hops)
    }

    async fn pipeline_of(&self, hops: &[Change]) -> Result<Pipeline, AppError> {
        let pipeline_id = hops
            .first()
            .and_then(|c| c.pipeline)
            .map(|l| l.pipeline_id)
            .ok_or_else(|| AppError::Internal("Pipeline hop without a pipeline link".to_string()))?;
        self.load_pipeline(pipeline_id).await
    }

    /// Start a run: open the first hop and go as far as the pipeline allows
    pub async fn promote(
        &self,
        pipeline_id: Uuid,
        payload: Value,
        author_id: Uuid,
    ) -> Result<PipelineRun, AppError> {
        let pipeline = self.load_pipeline(pipeline_id).await?;
        ChangePayload::parse(ChangeKind::Deployment, &payload)?;

        let run_id = Uuid::new_v4();
        let lease = self
            .engine
            .store()
            .acquire_lease(run_id, self.engine.config().lease_ttl)
            .await?;

        info!("🚚 Promoting through pipeline '{}' (run {})", pipeline.name, run_id);
        let result = async {
            let first = self.open_hop(&pipeline, run_id, 0, payload, author_id).await?;
            // A gated first hop waits for its votes, one that failed to apply
            // waits for the next promotion
            if first.is_ready_to_apply()
                && self.apply_hop(first.id, author_id).await?
                && pipeline.auto_promote
            {
                self.drive(&pipeline, run_id, author_id).await?;
            }
            self.derive(&pipeline, run_id).await
        }
        .await;

        self.release(&lease).await;
        result
    }

    /// One forward action: apply an approved hop or open the next one.
    /// Auto-promoting pipelines keep going until blocked.
    pub async fn promote_next(&self, run_id: Uuid, actor_id: Uuid) -> Result<PipelineRun, AppError> {
        let pipeline = self.pipeline_of(&self.hops(run_id).await?).await?;
        let lease = self
            .engine
            .store()
            .acquire_lease(run_id, self.engine.config().lease_ttl)
            .await?;

        let result = async {
            if self.step(&pipeline, run_id, actor_id).await? == Step::Advanced && pipeline.auto_promote {
                self.drive(&pipeline, run_id, actor_id).await?;
            }
            self.derive(&pipeline, run_id).await
        }
        .await;

        self.release(&lease).await;
        result
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun, AppError> {
        let hops = self.hops(run_id).await?;
        let pipeline = self.pipeline_of(&hops).await?;
        Ok(PipelineRun::derive(run_id, &pipeline, &hops))
    }

    /// Continue an auto-promoting run whose current hop just got its last
    /// approval. Returns `None` when the change is not such a hop or another
    /// caller is already driving the run.
    pub async fn resume_after_vote(
        &self,
        change: &Change,
        actor_id: Uuid,
    ) -> Result<Option<PipelineRun>, AppError> {
        let link = match change.pipeline {
            Some(link) if change.is_ready_to_apply() => link,
            _ => return Ok(None),
        };
        let pipeline = self.load_pipeline(link.pipeline_id).await?;
        if !pipeline.auto_promote {
            return Ok(None);
        }

        let lease = match self
            .engine
            .store()
            .acquire_lease(link.run_id, self.engine.config().lease_ttl)
            .await
        {
            Ok(lease) => lease,
            Err(AppError::Conflict(_)) => {
                debug!("Run {} is already being driven", link.run_id);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        info!("🚚 Hop {} of run {} approved, resuming", link.hop, link.run_id);
        let result = async {
            self.drive(&pipeline, link.run_id, actor_id).await?;
            self.derive(&pipeline, link.run_id).await
        }
        .await;

        self.release(&lease).await;
        result.map(Some)
    }

    async fn drive(&self, pipeline: &Pipeline, run_id: Uuid, actor_id: Uuid) -> Result<(), AppError> {
        // Each hop takes at most two steps (open, apply)
        for _ in 0..pipeline.environments.len() * 2 {
            if self.step(pipeline, run_id, actor_id).await? == Step::Blocked {
                break;
            }
        }
        Ok(())
    }

    async fn step(&self, pipeline: &Pipeline, run_id: Uuid, actor_id: Uuid) -> Result<Step, AppError> {
        let hops = self.hops(run_id).await?;
        let latest = match hops.last() {
            Some(change) => change,
            None => return Ok(Step::Blocked),
        };
        let hop = latest.pipeline.map(|l| l.hop).unwrap_or(0);

        match latest.status {
            ChangeStatus::Pending if latest.current_step() == CurrentStep::Complete => {
                Ok(self.apply_hop(latest.id, actor_id).await?.into())
            }
            ChangeStatus::Applied if hop + 1 < pipeline.environments.len() => {
                let template = &hops[0];
                let next = self
                    .open_hop(pipeline, run_id, hop + 1, template.payload.clone(), template.author_id)
                    .await?;
                if next.is_ready_to_apply() && !self.apply_hop(next.id, actor_id).await? {
                    return Ok(Step::Blocked);
                }
                Ok(Step::Advanced)
            }
            _ => Ok(Step::Blocked),
        }
    }

    async fn open_hop(
        &self,
        pipeline: &Pipeline,
        run_id: Uuid,
        hop: usize,
        payload: Value,
        author_id: Uuid,
    ) -> Result<Change, AppError> {
        let environment_id = pipeline.environments[hop];
        let mut change = self
            .engine
            .prepare(NewChange {
                kind: ChangeKind::Deployment,
                payload,
                scope_id: environment_id,
                author_id,
            })
            .await?;

        let gated = pipeline.gates(environment_id);
        let plan = if gated {
            RiskClassifier::classify(ChangeKind::Deployment, change.environment_type)
        } else {
            Vec::new()
        };
        change.pipeline = Some(PipelineLink {
            run_id,
            pipeline_id: pipeline.id,
            hop,
        });
        change.submit(plan)?;

        let event = AuditEvent::for_change(&change, Some(author_id), AuditAction::PipelineHopOpened)
            .with_details(json!({
                "runId": run_id,
                "pipelineId": pipeline.id,
                "hop": hop,
                "environmentId": environment_id,
                "gated": gated,
            }));
        self.engine.store().insert_change(&change, &[event]).await?;

        info!(
            "🚚 Run {} opened hop {} into environment {} ({})",
            run_id,
            hop,
            environment_id,
            if gated { "awaiting approval" } else { "ungated" }
        );
        Ok(change)
    }

    /// Whether the hop reached `applied`. Effector failures are recorded on
    /// the hop and show in the run state; they do not fail the promotion call.
    async fn apply_hop(&self, change_id: Uuid, actor_id: Uuid) -> Result<bool, AppError> {
        match self.engine.apply(change_id, Some(actor_id)).await {
            Ok(_) => Ok(true),
            Err(AppError::Effector(e)) => {
                warn!("⚠️  Pipeline hop {} did not apply: {}", change_id, e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn derive(&self, pipeline: &Pipeline, run_id: Uuid) -> Result<PipelineRun, AppError> {
        let hops = self.hops(run_id).await?;
        Ok(PipelineRun::derive(run_id, pipeline, &hops))
    }

    async fn release(&self, lease: &crate::store::Lease) {
        if let Err(e) = self.engine.store().release_lease(lease).await {
            warn!("Failed to release run lease {}: {}", lease.key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::effector::testing::ScriptedEffector;
    use crate::effector::EffectorError;
    use crate::engine::testing::*;
    use crate::pipeline::{Environment, EnvironmentType, RunState};
    use pretty_assertions::assert_eq;

    struct Fixture {
        engine: Arc<ApprovalEngine>,
        effector: Arc<ScriptedEffector>,
        promoter: PipelinePromoter,
        pipeline: Pipeline,
    }

    async fn fixture(effector: ScriptedEffector, auto_promote: bool, gate_prod: bool) -> Fixture {
        let (engine, effector) = engine_with(effector);
        let envs = [
            Environment::new("dev", EnvironmentType::Development),
            Environment::new("staging", EnvironmentType::Staging),
            Environment::new("prod", EnvironmentType::Production),
        ];
        for env in &envs {
            engine.store().insert_environment(env).await.unwrap();
        }

        let approval_envs = if gate_prod { vec![envs[2].id] } else { vec![] };
        let pipeline = Pipeline::new(
            "checkout",
            envs.iter().map(|e| e.id).collect(),
            auto_promote,
            gate_prod,
            approval_envs,
        )
        .unwrap();
        engine.store().insert_pipeline(&pipeline).await.unwrap();

        Fixture {
            promoter: PipelinePromoter::new(engine.clone()),
            engine,
            effector,
            pipeline,
        }
    }

    fn statuses(run: &PipelineRun) -> Vec<Option<ChangeStatus>> {
        run.hops.iter().map(|h| h.status).collect()
    }

    #[tokio::test]
    async fn test_manual_pipeline_halts_before_gated_prod() {
        let f = fixture(ScriptedEffector::new(), false, true).await;
        let author = Uuid::new_v4();

        let run = f
            .promoter
            .promote(f.pipeline.id, payload_for(ChangeKind::Deployment), author)
            .await
            .unwrap();
        assert_eq!(run.state, RunState::AwaitingPromotion);
        assert_eq!(statuses(&run), vec![Some(ChangeStatus::Applied), None, None]);

        let run = f.promoter.promote_next(run.id, author).await.unwrap();
        assert_eq!(
            statuses(&run),
            vec![Some(ChangeStatus::Applied), Some(ChangeStatus::Applied), None]
        );

        let run = f.promoter.promote_next(run.id, author).await.unwrap();
        assert_eq!(run.state, RunState::AwaitingApproval);
        assert_eq!(run.hops[2].status, Some(ChangeStatus::Pending));
        assert_eq!(f.effector.applies(), 2);

        // Prod cannot be pushed through without its votes
        let blocked = f.promoter.promote_next(run.id, author).await.unwrap();
        assert_eq!(blocked.state, RunState::AwaitingApproval);
        assert_eq!(f.effector.applies(), 2);

        let prod_change = run.hops[2].change_id.unwrap();
        f.engine.cast_vote(prod_change, approve(Role::Developer)).await.unwrap();
        let voted = f.engine.cast_vote(prod_change, approve(Role::Manager)).await.unwrap();

        // Manual pipelines do not resume on their own
        assert!(f.promoter.resume_after_vote(&voted, author).await.unwrap().is_none());
        assert_eq!(f.promoter.get_run(run.id).await.unwrap().state, RunState::AwaitingPromotion);

        let run = f.promoter.promote_next(run.id, author).await.unwrap();
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(f.effector.applies(), 3);
    }

    #[tokio::test]
    async fn test_auto_promote_resumes_after_final_vote() {
        let f = fixture(ScriptedEffector::new(), true, true).await;
        let author = Uuid::new_v4();

        let run = f
            .promoter
            .promote(f.pipeline.id, payload_for(ChangeKind::Deployment), author)
            .await
            .unwrap();
        assert_eq!(run.state, RunState::AwaitingApproval);
        assert_eq!(f.effector.applies(), 2);

        let prod_change = run.hops[2].change_id.unwrap();
        let first = f.engine.cast_vote(prod_change, approve(Role::Developer)).await.unwrap();
        assert!(f.promoter.resume_after_vote(&first, author).await.unwrap().is_none());

        let last = f.engine.cast_vote(prod_change, approve(Role::Admin)).await.unwrap();
        let resumed = f.promoter.resume_after_vote(&last, author).await.unwrap().unwrap();
        assert_eq!(resumed.state, RunState::Completed);
    }

    #[tokio::test]
    async fn test_failed_hop_halts_run() {
        let f = fixture(
            ScriptedEffector::new()
                .then_apply(Ok(json!({"before": "1.0.0"})))
                .then_apply(Err(EffectorError::Fatal("image missing".into()))),
            true,
            false,
        )
        .await;

        let run = f
            .promoter
            .promote(f.pipeline.id, payload_for(ChangeKind::Deployment), Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(run.state, RunState::Failed);
        assert_eq!(
            statuses(&run),
            vec![Some(ChangeStatus::Applied), Some(ChangeStatus::Failed), None]
        );
        // Earlier hops are not rolled back
        assert_eq!(f.effector.reverts(), 0);
    }

    #[tokio::test]
    async fn test_retrying_hop_stops_the_drive() {
        let effector = (0..6).fold(
            ScriptedEffector::new().then_apply(Ok(json!({"before": "1.0.0"}))),
            |e, _| e.then_apply(Err(EffectorError::Retryable("registry timeout".into()))),
        );
        let f = fixture(effector, true, false).await;
        let author = Uuid::new_v4();
        let max_attempts = f.engine.config().apply_max_attempts as usize;

        let run = f
            .promoter
            .promote(f.pipeline.id, payload_for(ChangeKind::Deployment), author)
            .await
            .unwrap();
        assert_eq!(run.state, RunState::Retrying);
        assert_eq!(
            statuses(&run),
            vec![Some(ChangeStatus::Applied), Some(ChangeStatus::Pending), None]
        );
        // One apply call's worth of attempts on the stuck hop, no more
        assert_eq!(f.effector.applies(), 1 + max_attempts);

        let run = f.promoter.promote_next(run.id, author).await.unwrap();
        assert_eq!(run.state, RunState::Retrying);
        assert_eq!(f.effector.applies(), 1 + 2 * max_attempts);
    }

    #[tokio::test]
    async fn test_promote_validates_payload_and_pipeline() {
        let f = fixture(ScriptedEffector::new(), false, false).await;

        let bad = f
            .promoter
            .promote(f.pipeline.id, json!({"codepageId": ""}), Uuid::new_v4())
            .await;
        assert!(matches!(bad, Err(AppError::Validation(_))));

        let missing = f
            .promoter
            .promote(Uuid::new_v4(), payload_for(ChangeKind::Deployment), Uuid::new_v4())
            .await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));

        assert!(matches!(
            f.promoter.get_run(Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));
    }
}
