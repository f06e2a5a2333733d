//! End-to-end engine tests over the built-in catalog and filesystem stores.

#[cfg(test)]
mod tests {
    use crate::cancellation::CancellationToken;
    use crate::catalog::{CATALOG_STAGES, GPU_RESOURCE};
    use crate::contracts::{Collaborator, CommandSpec, StageDefinition, StageRegistry};
    use crate::core::{ArtifactType, PipelineRunStatus, SampleId, StageRunStatus};
    use crate::engine::{EngineConfig, FailureMode, PipelineEngine};
    use crate::errors::{FailureClass, ImmunoflowError};
    use crate::events::EventKind;
    use crate::store::{ArtifactStore, CheckpointStore, STAGING_DIR};
    use crate::testing::{catalog_request, Script, ScriptedInvoker, TestWorkspace};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    const PREDICTORS: [&str; 4] = ["ccs", "rt", "orf", "similarity"];

    fn s1() -> SampleId {
        SampleId::new("S1").unwrap()
    }

    async fn workspace_with_run(sample: &SampleId) -> TestWorkspace {
        let workspace = TestWorkspace::new().await.unwrap();
        workspace.import_raw_run(sample, "frames-v1").await.unwrap();
        workspace
    }

    fn sorted(mut ids: Vec<&str>) -> Vec<&str> {
        ids.sort_unstable();
        ids
    }

    #[tokio::test]
    async fn test_ranked_list_runs_every_stage_once_then_fully_cached() {
        let sample = s1();
        let workspace = workspace_with_run(&sample).await;
        let invoker = Arc::new(ScriptedInvoker::new());
        let config = EngineConfig::new()
            .with_worker_slots(4)
            .with_resource_limit(GPU_RESOURCE, 1);
        let (engine, events) = workspace.engine(invoker.clone(), config).unwrap();
        let cancel = CancellationToken::new();

        let first = engine
            .run(catalog_request(&sample, ArtifactType::RankedList), &cancel)
            .await
            .unwrap();
        assert_eq!(first.status, PipelineRunStatus::Completed);
        for stage in CATALOG_STAGES {
            assert_eq!(invoker.invocations(stage), 1, "{stage}");
        }

        let calls = invoker.calls();
        let position = |id: &str| calls.iter().position(|c| c == id).unwrap();
        let plan = engine.plan(ArtifactType::RankedList, &sample).unwrap();
        for node in &plan.nodes {
            for upstream in &node.upstream {
                assert!(position(upstream) < position(node.id()), "{upstream} before {}", node.id());
            }
        }

        let ranked: Vec<_> = engine
            .artifacts()
            .list(&sample)
            .await
            .into_iter()
            .filter(|a| a.artifact_type == ArtifactType::RankedList)
            .collect();
        assert_eq!(ranked.len(), 1);
        assert_eq!(first.target_artifact.as_ref(), Some(&ranked[0].id));

        invoker.reset();
        let second = engine
            .run(catalog_request(&sample, ArtifactType::RankedList), &cancel)
            .await
            .unwrap();
        assert_eq!(second.status, PipelineRunStatus::Completed);
        assert_eq!(second.target_artifact, first.target_artifact);
        assert_eq!(invoker.total_invocations(), 0);
        assert_eq!(second.cached_stages().len(), CATALOG_STAGES.len());
        assert!(second
            .stage_runs
            .iter()
            .all(|r| r.status == StageRunStatus::SkippedCached));
        assert_eq!(events.of_kind(EventKind::StageCached).len(), CATALOG_STAGES.len());
    }

    #[tokio::test]
    async fn test_same_inputs_give_same_artifact_ids_across_stores() {
        let sample = s1();
        let mut targets = Vec::new();
        for _ in 0..2 {
            let workspace = workspace_with_run(&sample).await;
            let (engine, _) = workspace
                .engine(Arc::new(ScriptedInvoker::new()), EngineConfig::default())
                .unwrap();
            let run = engine
                .run(
                    catalog_request(&sample, ArtifactType::RankedList),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            targets.push((run.target_artifact, engine.plan(ArtifactType::RankedList, &sample).unwrap()));
        }
        assert!(targets[0].0.is_some());
        assert_eq!(targets[0].0, targets[1].0);
        assert_eq!(targets[0].1.stage_ids(), targets[1].1.stage_ids());
    }

    #[tokio::test]
    async fn test_binding_failure_keeps_sibling_predictions_and_resumes() {
        let sample = s1();
        let mut workspace = workspace_with_run(&sample).await;
        let invoker = Arc::new(ScriptedInvoker::new().with_script(
            "binding",
            Script::FailPermanent("allele HLA-Z*99:99 not supported".into()),
        ));
        let (engine, events) = workspace.engine(invoker.clone(), EngineConfig::default()).unwrap();

        let failed = engine
            .run(
                catalog_request(&sample, ArtifactType::RankedList),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(failed.status, PipelineRunStatus::Failed);
        let error = failed.execution_error().unwrap();
        assert_eq!(error.stage_id, "binding");
        assert_eq!(error.class, FailureClass::Permanent);
        assert_eq!(error.attempts, 1);
        assert!(error.diagnostic.stderr.contains("HLA-Z*99:99"));
        assert_eq!(invoker.invocations("rank"), 0);
        assert_eq!(
            failed.resume_command,
            "immunoflow run --sample S1 --target ranked_list"
        );
        assert!(failed.summary().contains("first failing stage: binding"));
        assert_eq!(events.stages(EventKind::StageFailed), vec!["binding"]);

        for stage in PREDICTORS {
            assert_eq!(
                failed.stage_run(stage).unwrap().status,
                StageRunStatus::Succeeded,
                "{stage}"
            );
        }
        for artifact_type in [
            ArtifactType::CcsPredictions,
            ArtifactType::RtPredictions,
            ArtifactType::OrfCalls,
            ArtifactType::SimilarityScores,
        ] {
            let artifact = engine.artifacts().latest(&sample, artifact_type).await.unwrap();
            assert!(engine.artifacts().contains(&artifact.id).await);
        }
        let history = engine.checkpoints().history("binding").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, StageRunStatus::Failed);

        // A fresh process over the same store, with the collaborator fixed.
        drop(engine);
        workspace.reopen().await.unwrap();
        invoker.clear_script("binding");
        invoker.reset();
        let (engine, _) = workspace.engine(invoker.clone(), EngineConfig::default()).unwrap();
        let resumed = engine
            .run(
                catalog_request(&sample, ArtifactType::RankedList),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(resumed.status, PipelineRunStatus::Completed);
        assert_eq!(sorted(resumed.invoked_stages()), vec!["binding", "rank"]);
        for stage in PREDICTORS {
            assert_eq!(
                resumed.stage_run(stage).unwrap().status,
                StageRunStatus::SkippedCached,
                "{stage}"
            );
        }
    }

    #[tokio::test]
    async fn test_changes_invalidate_exactly_their_dependents() {
        let sample = s1();
        let workspace = workspace_with_run(&sample).await;
        let invoker = Arc::new(ScriptedInvoker::new());
        let (engine, _) = workspace.engine(invoker.clone(), EngineConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        let baseline = engine
            .run(catalog_request(&sample, ArtifactType::RankedList), &cancel)
            .await
            .unwrap();

        invoker.reset();
        let rehaplotyped = engine
            .run(
                catalog_request(&sample, ArtifactType::RankedList)
                    .with_option("binding", "haplotype", "HLA-C*07:01"),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(sorted(rehaplotyped.invoked_stages()), vec!["binding", "rank"]);
        assert_ne!(rehaplotyped.target_artifact, baseline.target_artifact);

        invoker.reset();
        let profile = engine
            .run(
                catalog_request(&sample, ArtifactType::RankedList).with_option("convert", "mode", "profile"),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(invoker.invocations("qc"), 0);
        assert_eq!(profile.invoked_stages().len(), CATALOG_STAGES.len() - 1);

        invoker.reset();
        workspace.import_raw_run(&sample, "frames-v2").await.unwrap();
        let reacquired = engine
            .run(catalog_request(&sample, ArtifactType::RankedList), &cancel)
            .await
            .unwrap();
        assert_eq!(reacquired.invoked_stages().len(), CATALOG_STAGES.len());
        assert_ne!(reacquired.target_artifact, baseline.target_artifact);
    }

    #[tokio::test]
    async fn test_failure_midway_resumes_from_failed_stage() {
        let sample = s1();
        let workspace = workspace_with_run(&sample).await;
        let invoker = Arc::new(
            ScriptedInvoker::new().with_script("search", Script::FailPermanent("database not found".into())),
        );
        let (engine, _) = workspace.engine(invoker.clone(), EngineConfig::default()).unwrap();
        let cancel = CancellationToken::new();

        let failed = engine
            .run(catalog_request(&sample, ArtifactType::RescoredPsms), &cancel)
            .await
            .unwrap();
        assert_eq!(failed.status, PipelineRunStatus::Failed);
        assert_eq!(invoker.calls(), vec!["qc", "convert", "search"]);

        invoker.clear_script("search");
        invoker.reset();
        let resumed = engine
            .run(catalog_request(&sample, ArtifactType::RescoredPsms), &cancel)
            .await
            .unwrap();
        assert_eq!(resumed.status, PipelineRunStatus::Completed);
        assert_eq!(invoker.calls(), vec!["search", "rescore"]);
        assert_eq!(resumed.cached_stages(), vec!["qc", "convert"]);
    }

    #[tokio::test]
    async fn test_transient_failures_are_bounded() {
        let sample = s1();
        let workspace = workspace_with_run(&sample).await;
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .with_script("orf", Script::FailTransient { times: 2 })
                .with_script("rt", Script::AlwaysTransient),
        );
        let (engine, events) = workspace.engine(invoker.clone(), EngineConfig::default()).unwrap();

        let run = engine
            .run(
                catalog_request(&sample, ArtifactType::RankedList),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(run.status, PipelineRunStatus::Failed);
        assert_eq!(invoker.invocations("orf"), 3);
        assert_eq!(run.stage_run("orf").unwrap().status, StageRunStatus::Succeeded);
        assert_eq!(invoker.invocations("rt"), 3);
        let error = run.execution_error().unwrap();
        assert_eq!(error.stage_id, "rt");
        assert_eq!(error.class, FailureClass::Transient);
        assert_eq!(error.attempts, 3);
        let retried_rt = events
            .of_kind(EventKind::StageRetrying)
            .iter()
            .filter(|e| e.stage_id.as_deref() == Some("rt"))
            .count();
        assert_eq!(retried_rt, 2);
    }

    #[tokio::test]
    async fn test_rank_is_not_retried() {
        let sample = s1();
        let workspace = workspace_with_run(&sample).await;
        let invoker = Arc::new(ScriptedInvoker::new().with_script("rank", Script::AlwaysTransient));
        let (engine, _) = workspace.engine(invoker.clone(), EngineConfig::default()).unwrap();

        let run = engine
            .run(
                catalog_request(&sample, ArtifactType::RankedList),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(run.status, PipelineRunStatus::Failed);
        assert_eq!(invoker.invocations("rank"), 1);
    }

    #[tokio::test]
    async fn test_reported_success_without_output_fails_permanently() {
        let sample = s1();
        let workspace = workspace_with_run(&sample).await;
        let invoker = Arc::new(ScriptedInvoker::new().with_script("qc", Script::NoOutput));
        let (engine, _) = workspace.engine(invoker.clone(), EngineConfig::default()).unwrap();

        let run = engine
            .run(
                catalog_request(&sample, ArtifactType::CleanedRun),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let error = run.execution_error().unwrap();
        assert_eq!(error.class, FailureClass::Permanent);
        assert!(error.diagnostic.message.contains("no output payload"));
        assert_eq!(invoker.invocations("qc"), 1);
        assert!(engine
            .artifacts()
            .latest(&sample, ArtifactType::CleanedRun)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_cancellation_leaves_no_partial_output() {
        let sample = s1();
        let workspace = workspace_with_run(&sample).await;
        let invoker = Arc::new(ScriptedInvoker::new().with_script("ccs", Script::Hang));
        let (engine, events) = workspace.engine(invoker.clone(), EngineConfig::default()).unwrap();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let engine = engine.clone();
            let cancel = cancel.clone();
            async move {
                engine
                    .run(catalog_request(&sample, ArtifactType::RankedList), &cancel)
                    .await
            }
        });
        tokio::time::timeout(Duration::from_secs(10), async {
            while invoker.invocations("ccs") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        cancel.cancel("operator interrupt");

        let run = handle.await.unwrap().unwrap();
        assert_eq!(run.status, PipelineRunStatus::Cancelled);
        assert_eq!(invoker.invocations("rank"), 0);
        assert!(engine
            .artifacts()
            .latest(&s1(), ArtifactType::CcsPredictions)
            .await
            .is_none());
        assert!(engine.checkpoints().history("ccs").await.is_empty());
        assert_eq!(events.stages(EventKind::StageCancelled), vec!["ccs"]);

        let staging = workspace.store_root().join(STAGING_DIR);
        let leftovers = std::fs::read_dir(staging).map(Iterator::count).unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_invokes_nothing() {
        let sample = s1();
        let workspace = workspace_with_run(&sample).await;
        let invoker = Arc::new(ScriptedInvoker::new());
        let (engine, _) = workspace.engine(invoker.clone(), EngineConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel("shutdown");

        let run = engine
            .run(catalog_request(&sample, ArtifactType::RankedList), &cancel)
            .await
            .unwrap();
        assert_eq!(run.status, PipelineRunStatus::Cancelled);
        assert_eq!(invoker.total_invocations(), 0);
    }

    #[tokio::test]
    async fn test_fail_fast_starts_nothing_after_failure() {
        let sample = s1();
        let workspace = workspace_with_run(&sample).await;
        let invoker = Arc::new(
            ScriptedInvoker::new().with_script("ccs", Script::FailPermanent("model crashed".into())),
        );
        let config = EngineConfig::new()
            .with_worker_slots(1)
            .with_failure_mode(FailureMode::FailFast);
        let (engine, events) = workspace.engine(invoker.clone(), config).unwrap();

        let run = engine
            .run(
                catalog_request(&sample, ArtifactType::RankedList),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(run.status, PipelineRunStatus::Failed);
        assert_eq!(run.execution_error().unwrap().stage_id, "ccs");
        assert_eq!(invoker.invocations("rank"), 0);

        let all = events.events();
        let failed_at = all
            .iter()
            .position(|e| e.kind == EventKind::StageFailed)
            .unwrap();
        assert!(all[failed_at..]
            .iter()
            .all(|e| e.kind != EventKind::StageStarted));
    }

    #[tokio::test]
    async fn test_continue_on_failure_finishes_siblings() {
        let sample = s1();
        let workspace = workspace_with_run(&sample).await;
        let invoker = Arc::new(
            ScriptedInvoker::new().with_script("ccs", Script::FailPermanent("model crashed".into())),
        );
        let config = EngineConfig::new().with_worker_slots(1);
        let (engine, _) = workspace.engine(invoker.clone(), config).unwrap();

        engine
            .run(
                catalog_request(&sample, ArtifactType::RankedList),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        for stage in ["rt", "binding", "orf", "similarity"] {
            assert_eq!(invoker.invocations(stage), 1, "{stage}");
        }
    }

    #[tokio::test]
    async fn test_worker_slots_bound_concurrency() {
        let sample = s1();
        let workspace = workspace_with_run(&sample).await;
        let mut invoker = ScriptedInvoker::new();
        for stage in ["ccs", "rt", "binding", "orf", "similarity"] {
            invoker = invoker.with_script(stage, Script::Delay(Duration::from_millis(30)));
        }
        let invoker = Arc::new(invoker);
        let (engine, _) = workspace
            .engine(invoker.clone(), EngineConfig::new().with_worker_slots(2))
            .unwrap();

        let run = engine
            .run(
                catalog_request(&sample, ArtifactType::RankedList),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(run.is_completed());
        assert_eq!(invoker.peak_concurrency(), 2);
    }

    async fn gpu_peak(gpu_limit: usize) -> (usize, usize) {
        let sample = s1();
        let workspace = workspace_with_run(&sample).await;
        let mut invoker = ScriptedInvoker::new();
        for stage in ["ccs", "rt", "binding", "orf", "similarity"] {
            invoker = invoker.with_script(stage, Script::Delay(Duration::from_millis(60)));
        }
        let invoker = Arc::new(invoker);
        let config = EngineConfig::new()
            .with_worker_slots(8)
            .with_resource_limit(GPU_RESOURCE, gpu_limit);
        let (engine, _) = workspace.engine(invoker.clone(), config).unwrap();

        let run = engine
            .run(
                catalog_request(&sample, ArtifactType::RankedList),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(run.is_completed());
        (invoker.peak_concurrency_in(GPU_RESOURCE), invoker.peak_concurrency())
    }

    #[tokio::test]
    async fn test_resource_class_limit_caps_gpu_stages() {
        let (gpu, overall) = gpu_peak(1).await;
        assert_eq!(gpu, 1);
        // Non-GPU predictors still overlap with the GPU stage.
        assert!(overall >= 2, "overall peak {overall}");

        let (gpu, _) = gpu_peak(2).await;
        assert_eq!(gpu, 2);
    }

    #[tokio::test]
    async fn test_samples_run_independently() {
        let workspace = TestWorkspace::new().await.unwrap();
        let samples = [SampleId::new("S1").unwrap(), SampleId::new("S2").unwrap()];
        for sample in &samples {
            workspace.import_raw_run(sample, "frames").await.unwrap();
        }
        let invoker = Arc::new(ScriptedInvoker::new());
        let (engine, _) = workspace.engine(invoker.clone(), EngineConfig::default()).unwrap();

        let requests = samples
            .iter()
            .map(|s| catalog_request(s, ArtifactType::SearchResults))
            .collect();
        let runs = engine.run_samples(requests, &CancellationToken::new()).await;

        assert_eq!(runs.len(), 2);
        let targets: Vec<_> = runs
            .into_iter()
            .map(|r| r.unwrap().target_artifact.unwrap())
            .collect();
        assert_ne!(targets[0], targets[1]);
        assert_eq!(invoker.invocations("search"), 2);
    }

    #[tokio::test]
    async fn test_missing_raw_run_fails_before_invocation() {
        let workspace = TestWorkspace::new().await.unwrap();
        let invoker = Arc::new(ScriptedInvoker::new());
        let (engine, events) = workspace.engine(invoker.clone(), EngineConfig::default()).unwrap();

        let err = engine
            .run(
                catalog_request(&SampleId::new("S9").unwrap(), ArtifactType::RankedList),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            ImmunoflowError::MissingInputArtifact(e) => {
                assert_eq!(e.stage_id, "qc");
                assert_eq!(e.artifact_type, ArtifactType::RawRun);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(invoker.total_invocations(), 0);
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_missing_required_option_fails_before_invocation() {
        let sample = s1();
        let workspace = workspace_with_run(&sample).await;
        let invoker = Arc::new(ScriptedInvoker::new());
        let (engine, _) = workspace.engine(invoker.clone(), EngineConfig::default()).unwrap();

        let err = engine
            .run(
                crate::engine::RunRequest::new(sample, ArtifactType::BindingAffinities)
                    .with_option("search", "database", "proteome.fasta"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ImmunoflowError::InvalidInput(ref e) if e.stage_id == "binding"));
        assert_eq!(invoker.total_invocations(), 0);
    }

    #[tokio::test]
    async fn test_cycle_is_rejected_before_execution() {
        let workspace = TestWorkspace::new().await.unwrap();
        let tool = || Collaborator::Command(CommandSpec::new("tool", ["{input}", "{output}"]));
        let registry = StageRegistry::new();
        registry
            .register(StageDefinition::new(
                "search",
                [ArtifactType::RescoredPsms],
                ArtifactType::SearchResults,
                tool(),
            ))
            .unwrap();
        registry
            .register(StageDefinition::new(
                "rescore",
                [ArtifactType::SearchResults],
                ArtifactType::RescoredPsms,
                tool(),
            ))
            .unwrap();
        let invoker = Arc::new(ScriptedInvoker::new());
        let engine = PipelineEngine::new(
            Arc::new(registry),
            workspace.artifacts.clone(),
            workspace.checkpoints.clone(),
            invoker.clone(),
            EngineConfig::default(),
        );

        let err = engine
            .run(
                crate::engine::RunRequest::new(s1(), ArtifactType::RescoredPsms),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ImmunoflowError::CyclicDependency(_)));
        assert!(err.is_configuration_error());
        assert_eq!(invoker.total_invocations(), 0);
    }
}
