//! End-to-end pipeline scenarios.
//!
//! Submit → reserve → execute steps → version → commit → finalize, driven by
//! the scripted generator against the in-memory stores and ledger.
//!
//! Verifies:
//! - Token accounting for success, failure, cancellation and retry
//! - Version history survives retries; exactly one active version per step
//! - Agency scoping and per-agency concurrency limits

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use contentforge_ai::{GenerationError, ScriptedGenerator, ScriptedOutcome};
    use contentforge_auth::{AgencyMembership, Principal, Role};
    use contentforge_core::{AgencyId, CampaignId, ClientId, JobId, StepKind, UserId};
    use contentforge_jobs::{JobRequest, JobStatus, StepStatus};

    use crate::config::{PipelineConfig, RetryPolicy};
    use crate::error::PipelineError;
    use crate::ledger::TokenLedger;
    use crate::pipeline::Pipeline;
    use crate::store::VersionStore;

    struct Harness {
        pipeline: Pipeline,
        generator: Arc<ScriptedGenerator>,
        agency: AgencyId,
        owner: Principal,
    }

    fn config() -> PipelineConfig {
        PipelineConfig::default()
            .with_retry(RetryPolicy::fixed(3, Duration::from_millis(1)))
            .with_step_timeout(Duration::from_millis(50))
    }

    fn generator() -> ScriptedGenerator {
        ScriptedGenerator::new()
            .with_cost(StepKind::IdeaGeneration, 10)
            .with_cost(StepKind::CopyDesign, 20)
            .with_cost(StepKind::BaseImage, 15)
            .with_cost(StepKind::FinalDesign, 5)
    }

    fn harness_with(config: PipelineConfig, generator: ScriptedGenerator, balance: u64) -> Harness {
        let generator = Arc::new(generator);
        let pipeline = Pipeline::in_memory(config, generator.clone());
        let agency = AgencyId::new();
        if balance > 0 {
            pipeline.ledger.credit(agency, balance).unwrap();
        }
        Harness {
            pipeline,
            generator,
            agency,
            owner: Principal::owner(agency),
        }
    }

    fn harness(generator: ScriptedGenerator, balance: u64) -> Harness {
        harness_with(config(), generator, balance)
    }

    fn request() -> JobRequest {
        JobRequest::full_pipeline(ClientId::new(), "Autumn coffee launch")
            .with_parameters(json!({"brand": "Roastery", "tone": "warm"}))
    }

    impl Harness {
        fn balance(&self) -> u64 {
            self.pipeline.ledger.balance_of(self.agency).unwrap()
        }

        async fn run(&self, request: JobRequest) -> contentforge_jobs::Job {
            let job = self.pipeline.orchestrator.submit(&self.owner, request).await.unwrap();
            self.pipeline.orchestrator.wait_for(&self.owner, job.id).await.unwrap()
        }

        async fn wait_until_called(&self, step: StepKind, times: usize) {
            for _ in 0..200 {
                if self.generator.calls_for(step) >= times {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("{step} was never called {times} times");
        }
    }

    #[tokio::test]
    async fn full_pipeline_consumes_actual_costs() {
        let h = harness(generator(), 1000);
        let job = h.run(request()).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.reserved_tokens, 50);
        assert_eq!(job.consumed_tokens, 50);
        assert_eq!(job.refunded_tokens, 0);
        assert_eq!(job.total_tokens_used(), job.consumed_tokens);
        assert!(job.steps.iter().all(|s| s.status == StepStatus::Completed));
        assert_eq!(h.balance(), 950);

        let view = h.pipeline.query.get_job_status(&h.owner, job.id).unwrap();
        assert!(view.steps.iter().all(|s| s.active_version_id.is_some() && s.version_count == 1));
        assert!((view.total_cost - 50.0 * 0.002).abs() < 1e-9);
    }

    #[tokio::test]
    async fn steps_build_on_prior_active_outputs() {
        let h = harness(generator(), 1000);
        h.run(request()).await;

        let calls = h.generator.calls();
        let final_call = calls.iter().find(|c| c.step == StepKind::FinalDesign).unwrap();
        assert_eq!(
            final_call.prior_steps,
            vec![StepKind::IdeaGeneration, StepKind::CopyDesign, StepKind::BaseImage]
        );
    }

    #[tokio::test]
    async fn exhausted_timeouts_fail_the_job_and_refund() {
        let g = generator();
        g.push_repeated(StepKind::BaseImage, ScriptedOutcome::Hang, 3);
        let h = harness(g, 1000);

        let job = h.run(request()).await;

        let JobStatus::Failed { step, tokens_refunded, .. } = &job.status else {
            panic!("expected FAILED, got {}", job.status);
        };
        assert_eq!(*step, StepKind::BaseImage);
        assert_eq!(*tokens_refunded, 20);
        assert_eq!(h.generator.calls_for(StepKind::BaseImage), 3);
        assert_eq!(h.generator.calls_for(StepKind::FinalDesign), 0);

        assert_eq!(job.step(StepKind::IdeaGeneration).unwrap().status, StepStatus::Completed);
        assert_eq!(job.step(StepKind::CopyDesign).unwrap().status, StepStatus::Completed);
        let base = job.step(StepKind::BaseImage).unwrap();
        assert_eq!(base.status, StepStatus::Failed);
        assert_eq!(base.attempts, 3);
        assert_eq!(job.step(StepKind::FinalDesign).unwrap().status, StepStatus::Pending);

        assert_eq!(job.consumed_tokens, 30);
        assert_eq!(job.refunded_tokens, 20);
        assert_eq!(h.balance(), 970);
    }

    #[tokio::test]
    async fn transient_failure_then_success_completes() {
        let g = generator();
        g.push(
            StepKind::CopyDesign,
            ScriptedOutcome::Fail(GenerationError::Unavailable("503".into())),
        );
        let h = harness(g, 1000);

        let job = h.run(request()).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.step(StepKind::CopyDesign).unwrap().attempts, 2);
        assert_eq!(h.balance(), 950);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let g = generator();
        g.push(
            StepKind::IdeaGeneration,
            ScriptedOutcome::Fail(GenerationError::Rejected("unsafe prompt".into())),
        );
        let h = harness(g, 1000);

        let job = h.run(request()).await;
        assert!(job.status.is_failed());
        assert_eq!(h.generator.calls_for(StepKind::IdeaGeneration), 1);
        assert_eq!(job.refunded_tokens, 50);
        assert_eq!(h.balance(), 1000);
    }

    #[tokio::test]
    async fn cancel_mid_step_refunds_unconsumed_reservation() {
        let g = generator();
        g.push(StepKind::CopyDesign, ScriptedOutcome::Hang);
        let h = harness_with(config().with_step_timeout(Duration::from_secs(30)), g, 1000);

        let job = h.pipeline.orchestrator.submit(&h.owner, request()).await.unwrap();
        h.wait_until_called(StepKind::CopyDesign, 1).await;

        let cancelled = h
            .pipeline
            .orchestrator
            .cancel(&h.owner, job.id, Some("brief changed".into()))
            .await
            .unwrap();
        assert_eq!(
            cancelled.status,
            JobStatus::Cancelled {
                reason: Some("brief changed".into())
            }
        );
        assert_eq!(cancelled.step(StepKind::CopyDesign).unwrap().status, StepStatus::Skipped);
        assert_eq!(cancelled.step(StepKind::BaseImage).unwrap().status, StepStatus::Pending);

        let settled = h.pipeline.orchestrator.wait_for(&h.owner, job.id).await.unwrap();
        assert!(settled.status.is_cancelled());
        assert_eq!(settled.consumed_tokens, 10);
        assert_eq!(settled.refunded_tokens, 40);
        assert_eq!(h.balance(), 990);

        let again = h.pipeline.orchestrator.cancel(&h.owner, job.id, None).await;
        assert!(matches!(again, Err(PipelineError::AlreadyTerminal { .. })));
    }

    #[tokio::test]
    async fn retry_resumes_and_preserves_completed_versions() {
        let g = generator();
        g.push(
            StepKind::BaseImage,
            ScriptedOutcome::Fail(GenerationError::InvalidInput("bad aspect ratio".into())),
        );
        let h = harness(g, 1000);

        let failed = h.run(request()).await;
        assert!(failed.status.is_failed());
        assert_eq!(h.balance(), 970);

        let versions = &h.pipeline.versions;
        let before: Vec<_> = [StepKind::IdeaGeneration, StepKind::CopyDesign]
            .iter()
            .map(|s| versions.active_version(failed.id, *s).unwrap().unwrap())
            .collect();

        let resumed = h.pipeline.orchestrator.retry(&h.owner, failed.id).await.unwrap();
        assert_eq!(resumed.run, 2);
        let done = h.pipeline.orchestrator.wait_for(&h.owner, failed.id).await.unwrap();

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(h.generator.calls_for(StepKind::IdeaGeneration), 1);
        assert_eq!(h.generator.calls_for(StepKind::CopyDesign), 1);
        for version in &before {
            let now_active = versions.active_version(done.id, version.step).unwrap().unwrap();
            assert_eq!(&now_active, version);
        }
        assert_eq!(done.consumed_tokens, 50);
        assert!(done.consumed_tokens <= done.reserved_tokens);
        assert_eq!(done.total_tokens_used(), done.consumed_tokens);
        assert_eq!(h.balance(), 950);

        let again = h.pipeline.orchestrator.retry(&h.owner, done.id).await;
        assert!(matches!(again, Err(PipelineError::NotRetryable { .. })));
    }

    #[tokio::test]
    async fn insufficient_balance_creates_no_job() {
        let h = harness(generator(), 40);
        let err = h.pipeline.orchestrator.submit(&h.owner, request()).await.unwrap_err();

        assert_eq!(
            err,
            PipelineError::InsufficientBalance {
                requested: 50,
                available: 40
            }
        );
        assert_eq!(h.pipeline.query.get_agency_stats(&h.owner).unwrap().total, 0);
        assert_eq!(h.balance(), 40);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_before_reserving() {
        let h = harness(generator(), 1000);
        let bad = request().with_steps(vec![StepKind::CopyDesign, StepKind::IdeaGeneration]);
        let err = h.pipeline.orchestrator.submit(&h.owner, bad).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(h.balance(), 1000);
    }

    #[tokio::test]
    async fn overrun_is_charged_from_available_balance() {
        let g = generator();
        g.push(StepKind::IdeaGeneration, ScriptedOutcome::Cost(25));
        let h = harness(g, 1000);

        let job = h.run(request()).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.consumed_tokens, 65);
        assert_eq!(job.reserved_tokens, 65);
        assert_eq!(h.balance(), 935);
    }

    #[tokio::test]
    async fn agency_concurrency_limit_queues_extra_jobs() {
        let g = generator();
        g.push(
            StepKind::IdeaGeneration,
            ScriptedOutcome::Delayed(Duration::from_millis(100), Box::new(ScriptedOutcome::Cost(10))),
        );
        let h = harness_with(config().with_max_concurrent_jobs(1), g, 1000);

        let first = h.pipeline.orchestrator.submit(&h.owner, request()).await.unwrap();
        let second = h.pipeline.orchestrator.submit(&h.owner, request()).await.unwrap();
        assert_eq!(first.status, JobStatus::InProgress);
        assert_eq!(second.status, JobStatus::Pending);

        // Another agency is not affected.
        let other = Principal::owner(AgencyId::new());
        h.pipeline.ledger.credit(other.agency_id(), 100).unwrap();
        let unrelated = h.pipeline.orchestrator.submit(&other, request()).await.unwrap();
        assert_eq!(unrelated.status, JobStatus::InProgress);

        let first = h.pipeline.orchestrator.wait_for(&h.owner, first.id).await.unwrap();
        let second = h.pipeline.orchestrator.wait_for(&h.owner, second.id).await.unwrap();
        assert_eq!(second.status, JobStatus::Completed);
        assert!(second.started_at.unwrap() >= first.completed_at.unwrap());
        assert_eq!(h.balance(), 900);
    }

    #[tokio::test]
    async fn cancel_while_queued_never_runs() {
        let g = generator();
        g.push(StepKind::IdeaGeneration, ScriptedOutcome::Hang);
        let h = harness_with(
            config().with_max_concurrent_jobs(1).with_step_timeout(Duration::from_secs(30)),
            g,
            1000,
        );

        let running = h.pipeline.orchestrator.submit(&h.owner, request()).await.unwrap();
        let queued = h.pipeline.orchestrator.submit(&h.owner, request()).await.unwrap();
        h.pipeline.orchestrator.cancel(&h.owner, queued.id, None).await.unwrap();
        let queued = h.pipeline.orchestrator.wait_for(&h.owner, queued.id).await.unwrap();
        assert!(queued.status.is_cancelled());
        assert!(queued.steps.iter().all(|s| s.status == StepStatus::Pending));

        h.pipeline.orchestrator.cancel(&h.owner, running.id, None).await.unwrap();
        h.pipeline.orchestrator.wait_for(&h.owner, running.id).await.unwrap();
        assert_eq!(h.generator.calls_for(StepKind::IdeaGeneration), 1);
        assert_eq!(h.balance(), 1000);
    }

    #[tokio::test]
    async fn regenerate_activate_compare_and_delete_versions() {
        let h = harness(generator(), 1000);
        let job = h.run(request()).await;
        let query = &h.pipeline.query;

        let original = h
            .pipeline
            .versions
            .active_version(job.id, StepKind::CopyDesign)
            .unwrap()
            .unwrap();
        let regenerated = h
            .pipeline
            .orchestrator
            .regenerate_step(&h.owner, job.id, StepKind::CopyDesign)
            .await
            .unwrap();
        assert_eq!(regenerated.number, 2);
        assert!(!regenerated.is_active);
        assert_eq!(h.balance(), 930);

        let activated = query.activate_version(&h.owner, regenerated.id).unwrap();
        assert!(activated.is_active);
        let listed = query.list_versions(&h.owner, job.id, StepKind::CopyDesign).unwrap();
        assert_eq!(listed.iter().filter(|v| v.is_active).count(), 1);
        assert_eq!(listed.iter().find(|v| v.is_active).unwrap().id, regenerated.id);

        let comparison = query.compare_versions(&h.owner, original.id, regenerated.id).unwrap();
        assert_eq!(comparison.job_id, job.id);
        assert!((0.0..=1.0).contains(&comparison.diff.similarity));

        assert!(matches!(
            query.compare_versions(&h.owner, original.id, original.id),
            Err(PipelineError::SameVersion(_))
        ));
        assert!(matches!(
            query.delete_version(&h.owner, regenerated.id),
            Err(PipelineError::CannotDeleteActiveVersion(_))
        ));
        query.delete_version(&h.owner, original.id).unwrap();
        assert_eq!(query.list_versions(&h.owner, job.id, StepKind::CopyDesign).unwrap().len(), 1);

        let view = query.get_job_status(&h.owner, job.id).unwrap();
        let copy = view.steps.iter().find(|s| s.step == StepKind::CopyDesign).unwrap();
        assert_eq!(copy.active_version_id, Some(regenerated.id));
        assert_eq!(view.consumed_tokens, 70);
        assert_eq!(view.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn regeneration_is_refused_when_a_retry_restarts_the_job() {
        let g = generator();
        g.push(
            StepKind::BaseImage,
            ScriptedOutcome::Fail(GenerationError::InvalidInput("bad aspect ratio".into())),
        );
        let h = harness_with(config().with_step_timeout(Duration::from_secs(5)), g, 1000);
        let failed = h.run(request()).await;
        assert!(failed.status.is_failed());
        assert_eq!(h.balance(), 970);

        h.generator.push(
            StepKind::CopyDesign,
            ScriptedOutcome::Delayed(Duration::from_millis(100), Box::new(ScriptedOutcome::Cost(20))),
        );
        h.generator.push(StepKind::BaseImage, ScriptedOutcome::Hang);

        let job_id = failed.id;
        let orchestrator = h.pipeline.orchestrator.clone();
        let owner = h.owner.clone();
        let regenerate = tokio::spawn(async move {
            orchestrator.regenerate_step(&owner, job_id, StepKind::CopyDesign).await
        });
        h.wait_until_called(StepKind::CopyDesign, 2).await;

        let resumed = h.pipeline.orchestrator.retry(&h.owner, job_id).await.unwrap();
        assert_eq!(resumed.status, JobStatus::InProgress);

        let refused = regenerate.await.unwrap();
        assert!(matches!(refused, Err(PipelineError::Validation(_))));
        assert_eq!(
            h.pipeline.versions.list_for_step(job_id, StepKind::CopyDesign).unwrap().len(),
            1
        );

        h.pipeline.orchestrator.cancel(&h.owner, job_id, None).await.unwrap();
        let cancelled = h.pipeline.orchestrator.wait_for(&h.owner, job_id).await.unwrap();
        assert!(cancelled.status.is_cancelled());
        assert_eq!(cancelled.consumed_tokens, 30);
        assert_eq!(cancelled.total_tokens_used(), cancelled.consumed_tokens);
        assert_eq!(h.balance(), 970);
    }

    #[tokio::test]
    async fn versions_of_different_jobs_do_not_compare() {
        let h = harness(generator(), 1000);
        let a = h.run(request()).await;
        let b = h.run(request()).await;
        let va = h.pipeline.versions.active_version(a.id, StepKind::IdeaGeneration).unwrap().unwrap();
        let vb = h.pipeline.versions.active_version(b.id, StepKind::IdeaGeneration).unwrap().unwrap();

        assert!(matches!(
            h.pipeline.query.compare_versions(&h.owner, va.id, vb.id),
            Err(PipelineError::CrossJob { .. })
        ));
    }

    #[tokio::test]
    async fn other_agencies_and_missing_permissions_are_forbidden() {
        let h = harness(generator(), 1000);
        let job = h.run(request()).await;

        let stranger = Principal::owner(AgencyId::new());
        assert!(matches!(
            h.pipeline.query.get_job_status(&stranger, job.id),
            Err(PipelineError::Forbidden(_))
        ));
        assert!(matches!(
            h.pipeline.orchestrator.cancel(&stranger, job.id, None).await,
            Err(PipelineError::Forbidden(_))
        ));

        let viewer = Principal::new(UserId::new(), AgencyMembership::new(h.agency).with_role(Role::VIEWER));
        assert!(h.pipeline.query.get_job_status(&viewer, job.id).is_ok());
        assert!(matches!(
            h.pipeline.orchestrator.submit(&viewer, request()).await,
            Err(PipelineError::Forbidden(_))
        ));
        assert!(matches!(
            h.pipeline.orchestrator.retry(&viewer, job.id).await,
            Err(PipelineError::Forbidden(_))
        ));

        assert!(matches!(
            h.pipeline.query.get_job_status(&h.owner, JobId::new()),
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn campaign_view_rolls_up_jobs() {
        let g = generator();
        g.push(
            StepKind::IdeaGeneration,
            ScriptedOutcome::Fail(GenerationError::Rejected("no".into())),
        );
        let h = harness(g, 1000);
        let campaign = CampaignId::new();

        let failed = h.run(request().with_campaign(campaign)).await;
        let completed = h.run(request().with_campaign(campaign)).await;
        h.run(request()).await;

        let view = h.pipeline.query.get_campaign_jobs(&h.owner, campaign).unwrap();
        assert_eq!(view.jobs.len(), 2);
        assert_eq!(view.counts.failed, 1);
        assert_eq!(view.counts.completed, 1);
        assert_eq!(view.consumed_tokens, failed.consumed_tokens + completed.consumed_tokens);

        let stats = h.pipeline.query.get_agency_stats(&h.owner).unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn ledger_entries_reconcile_with_balance() {
        let g = generator();
        g.push_repeated(StepKind::FinalDesign, ScriptedOutcome::Hang, 3);
        let h = harness(g, 1000);
        h.run(request()).await;

        let entries = h.pipeline.ledger.entries(h.agency).unwrap();
        let sum: i128 = entries.iter().map(|e| e.balance_delta()).sum();
        assert_eq!(sum, i128::from(h.balance()));
        assert_eq!(h.balance(), 955);
    }
}
