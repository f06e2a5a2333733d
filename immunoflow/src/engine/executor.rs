//! DAG scheduling and per-stage execution.

use super::{EngineConfig, FailureMode, RetryDecision, RetryState, RunRequest};
use crate::cancellation::CancellationToken;
use crate::contracts::{ResolvedConfig, StageDefinition, StageRegistry};
use crate::core::{
    Artifact, ArtifactId, ArtifactType, PipelineRun, PipelineRunStatus, RunFailure, SampleId,
    StageRun, StageRunStatus, IMPORT_PRODUCER,
};
use crate::errors::{
    Diagnostic, FailureClass, ImmunoflowError, InvalidInputError, MissingInputArtifactError,
    StoreError,
};
use crate::events::{Event, EventKind, EventSink, NoOpEventSink};
use crate::graph::{DependencyGraph, ExecutionPlan, PlanNode};
use crate::hashing;
use crate::invoke::{InvocationError, InvocationInput, InvocationRequest, StageInvoker};
use crate::observability::{PipelineSpanAttributes, SpanTimer, StageSpanAttributes};
use crate::store::{ArtifactStore, CheckpointStore, IngestRequest, StagingArea};
use crate::utils::{generate_uuid, now_utc};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Runs execution plans against injected stores and collaborators.
///
/// Cloning is cheap; clones share the worker pool, so concurrent runs
/// (see [`PipelineEngine::run_samples`]) respect one global slot limit.
#[derive(Clone)]
pub struct PipelineEngine {
    shared: Arc<Shared>,
}

#[derive(Clone)]
struct Shared {
    registry: Arc<StageRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    invoker: Arc<dyn StageInvoker>,
    events: Arc<dyn EventSink>,
    config: EngineConfig,
    workers: Arc<Semaphore>,
    resources: HashMap<String, Arc<Semaphore>>,
}

impl fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("stages", &self.shared.registry.len())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

/// Everything checked before the first invocation.
struct Preflight {
    plan: ExecutionPlan,
    configs: HashMap<String, ResolvedConfig>,
    source_target: Option<ArtifactId>,
}

/// One stage handed to a worker task.
struct NodeJob {
    index: usize,
    run_id: Uuid,
    sample: SampleId,
    node: PlanNode,
    config: ResolvedConfig,
    inputs: Vec<(ArtifactType, Option<ArtifactId>)>,
    cancel: CancellationToken,
    /// Set once the run stops scheduling under [`FailureMode::FailFast`].
    halt: Arc<AtomicBool>,
}

impl NodeJob {
    fn halted(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }
}

enum NodeOutcome {
    Produced(ArtifactId),
    Failed(RunFailure),
    Cancelled,
    /// Not started because the run halted.
    Halted,
    Aborted(ImmunoflowError),
}

struct NodeReport {
    index: usize,
    stage_run: Option<StageRun>,
    outcome: NodeOutcome,
}

/// In-degree bookkeeping over plan indexes.
struct Scheduler {
    remaining: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    ready: BTreeSet<usize>,
}

impl Scheduler {
    fn new(plan: &ExecutionPlan) -> Self {
        let index_of: HashMap<&str, usize> = plan
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id(), i))
            .collect();
        let mut dependents = vec![Vec::new(); plan.nodes.len()];
        let mut remaining = Vec::with_capacity(plan.nodes.len());
        for (i, node) in plan.nodes.iter().enumerate() {
            for upstream in &node.upstream {
                if let Some(&u) = index_of.get(upstream.as_str()) {
                    dependents[u].push(i);
                }
            }
            remaining.push(node.upstream.len());
        }
        let ready = remaining
            .iter()
            .enumerate()
            .filter(|(_, &count)| count == 0)
            .map(|(i, _)| i)
            .collect();
        Self {
            remaining,
            dependents,
            ready,
        }
    }

    fn next_ready(&mut self) -> Option<usize> {
        self.ready.pop_first()
    }

    /// Marks `index` as produced. Dependents of a node that never completes
    /// stay blocked.
    fn complete(&mut self, index: usize) {
        for &d in &self.dependents[index] {
            self.remaining[d] = self.remaining[d].saturating_sub(1);
            if self.remaining[d] == 0 {
                self.ready.insert(d);
            }
        }
    }
}

impl PipelineEngine {
    /// Creates an engine. Events are discarded until a sink is set with
    /// [`PipelineEngine::with_events`].
    #[must_use]
    pub fn new(
        registry: Arc<StageRegistry>,
        artifacts: Arc<dyn ArtifactStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        invoker: Arc<dyn StageInvoker>,
        config: EngineConfig,
    ) -> Self {
        let resources = config
            .resource_limits
            .iter()
            .map(|(class, &limit)| (class.clone(), Arc::new(Semaphore::new(limit.max(1)))))
            .collect();
        Self {
            shared: Arc::new(Shared {
                registry,
                artifacts,
                checkpoints,
                invoker,
                events: Arc::new(NoOpEventSink),
                workers: Arc::new(Semaphore::new(config.worker_slots.max(1))),
                resources,
                config,
            }),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(self, events: Arc<dyn EventSink>) -> Self {
        let mut shared = Arc::try_unwrap(self.shared).unwrap_or_else(|shared| (*shared).clone());
        shared.events = events;
        Self {
            shared: Arc::new(shared),
        }
    }

    /// The stage registry.
    #[must_use]
    pub fn registry(&self) -> &StageRegistry {
        &self.shared.registry
    }

    /// The artifact store.
    #[must_use]
    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.shared.artifacts
    }

    /// The checkpoint store.
    #[must_use]
    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.shared.checkpoints
    }

    /// Engine limits and policies.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Resolves the execution plan for `target` without running anything.
    ///
    /// # Errors
    ///
    /// Returns configuration-time errors from the graph builder.
    pub fn plan(&self, target: ArtifactType, sample: &SampleId) -> Result<ExecutionPlan, ImmunoflowError> {
        DependencyGraph::new(&self.shared.registry).build(target, sample)
    }

    /// Runs `request` to completion, failure or cancellation.
    ///
    /// A stage failure is reported in the returned [`PipelineRun`] (see
    /// [`PipelineRun::execution_error`]), not as an `Err`.
    ///
    /// # Errors
    ///
    /// Returns an error, before any collaborator is invoked, if the plan
    /// cannot be built, a stage configuration is invalid, or a source input
    /// is missing from the store.
    pub async fn run(
        &self,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> Result<PipelineRun, ImmunoflowError> {
        let preflight = self.preflight(&request).await?;
        let run_id = generate_uuid();
        let span = PipelineSpanAttributes::new(
            run_id,
            request.sample.clone(),
            request.target,
            preflight.plan.len(),
        )
        .span();
        self.execute(run_id, &request, preflight, cancel)
            .instrument(span)
            .await
    }

    /// Runs several requests concurrently. No ordering is guaranteed across
    /// samples; all runs share the worker pool and `cancel`. Results come
    /// back in request order.
    pub async fn run_samples(
        &self,
        requests: Vec<RunRequest>,
        cancel: &CancellationToken,
    ) -> Vec<Result<PipelineRun, ImmunoflowError>> {
        futures::future::join_all(requests.into_iter().map(|r| self.run(r, cancel))).await
    }

    async fn preflight(&self, request: &RunRequest) -> Result<Preflight, ImmunoflowError> {
        let plan = self.plan(request.target, &request.sample)?;

        if let Some(stage_id) = request
            .stage_config
            .keys()
            .find(|id| self.shared.registry.get(id).is_none())
        {
            return Err(InvalidInputError::new(
                stage_id.as_str(),
                "configuration given for a stage that is not registered",
            )
            .into());
        }

        let empty = serde_json::Map::new();
        let mut configs = HashMap::with_capacity(plan.len());
        for node in &plan.nodes {
            let values = request.stage_config.get(node.id()).unwrap_or(&empty);
            let resolved = node.stage.config.resolve(node.id(), values)?;
            configs.insert(node.id().to_string(), resolved);
        }

        for node in &plan.nodes {
            for &source in &node.source_inputs {
                self.source_artifact(node.id(), &request.sample, source).await?;
            }
        }

        let source_target = if plan.is_empty() {
            Some(
                self.source_artifact(IMPORT_PRODUCER, &request.sample, request.target)
                    .await?,
            )
        } else {
            None
        };

        Ok(Preflight {
            plan,
            configs,
            source_target,
        })
    }

    async fn source_artifact(
        &self,
        stage_id: &str,
        sample: &SampleId,
        artifact_type: ArtifactType,
    ) -> Result<ArtifactId, MissingInputArtifactError> {
        let missing = || MissingInputArtifactError::new(stage_id, sample.clone(), artifact_type);
        let artifact = self
            .shared
            .artifacts
            .latest(sample, artifact_type)
            .await
            .ok_or_else(missing)?;
        if self.shared.artifacts.contains(&artifact.id).await {
            Ok(artifact.id)
        } else {
            Err(missing())
        }
    }

    async fn execute(
        &self,
        run_id: Uuid,
        request: &RunRequest,
        preflight: Preflight,
        cancel: &CancellationToken,
    ) -> Result<PipelineRun, ImmunoflowError> {
        let Preflight {
            plan,
            mut configs,
            source_target,
        } = preflight;
        let mut run = PipelineRun::new(
            run_id,
            request.target,
            request.sample.clone(),
            plan.stage_ids().into_iter().map(str::to_string).collect(),
            request.resume_command(),
        );
        info!(stages = ?run.plan, "Pipeline run started");
        self.shared.events.emit(
            &Event::new(EventKind::PipelineStarted, run_id, request.sample.clone())
                .with_data(json!({ "target": request.target, "plan": &run.plan })),
        );

        let timer = SpanTimer::start("pipeline");
        let mut scheduler = Scheduler::new(&plan);
        let mut produced: HashMap<ArtifactType, ArtifactId> = HashMap::new();
        let mut first_failure: Option<RunFailure> = None;
        let halt = Arc::new(AtomicBool::new(false));
        let mut active = FuturesUnordered::new();

        loop {
            while !halt.load(Ordering::SeqCst) && !cancel.is_cancelled() {
                let Some(index) = scheduler.next_ready() else {
                    break;
                };
                let node = plan.nodes[index].clone();
                let job = NodeJob {
                    index,
                    run_id,
                    sample: request.sample.clone(),
                    config: configs.remove(node.id()).unwrap_or_default(),
                    inputs: node
                        .stage
                        .inputs
                        .iter()
                        .map(|t| (*t, produced.get(t).cloned()))
                        .collect(),
                    node,
                    cancel: cancel.clone(),
                    halt: Arc::clone(&halt),
                };
                let handle = tokio::spawn(Arc::clone(&self.shared).run_node(job));
                active.push(handle.map(move |joined| {
                    joined.unwrap_or_else(|e| NodeReport {
                        index,
                        stage_run: None,
                        outcome: NodeOutcome::Aborted(ImmunoflowError::Internal(format!(
                            "stage task ended abnormally: {e}"
                        ))),
                    })
                }));
            }

            let Some(report) = active.next().await else {
                break;
            };
            let node = &plan.nodes[report.index];
            let attempts = report.stage_run.as_ref().map_or(0, |r| r.attempts);
            if let Some(stage_run) = report.stage_run {
                run.stage_runs.push(stage_run);
            }
            match report.outcome {
                NodeOutcome::Produced(id) => {
                    produced.insert(node.stage.output, id);
                    scheduler.complete(report.index);
                }
                NodeOutcome::Failed(failure) => {
                    let blocked = plan.dependents_of(node.id());
                    if !blocked.is_empty() {
                        warn!(stage = %node.id(), ?blocked, "Downstream stages blocked by failure");
                    }
                    first_failure.get_or_insert(failure);
                    if self.shared.config.failure_mode == FailureMode::FailFast {
                        halt.store(true, Ordering::SeqCst);
                    }
                }
                NodeOutcome::Cancelled | NodeOutcome::Halted => {}
                NodeOutcome::Aborted(err) => {
                    error!(stage = %node.id(), error = %err, "Stage aborted the run");
                    first_failure.get_or_insert_with(|| RunFailure {
                        stage_id: node.id().to_string(),
                        class: FailureClass::Permanent,
                        diagnostic: Diagnostic::new(err.to_string()),
                        attempts,
                    });
                    halt.store(true, Ordering::SeqCst);
                }
            }
        }

        run.finished_at = Some(now_utc());
        run.failure = first_failure;
        let target = source_target.or_else(|| produced.remove(&request.target));
        run.status = if let Some(id) = target {
            run.target_artifact = Some(id);
            PipelineRunStatus::Completed
        } else if cancel.is_cancelled() {
            PipelineRunStatus::Cancelled
        } else if run.failure.is_some() {
            PipelineRunStatus::Failed
        } else {
            return Err(ImmunoflowError::Internal(format!(
                "scheduler stalled before producing '{}'",
                request.target
            )));
        };

        let duration_ms = timer.finish();
        info!(
            status = %run.status,
            invoked = run.invoked_stages().len(),
            cached = run.cached_stages().len(),
            duration_ms,
            "Pipeline run finished"
        );
        self.shared.events.emit(
            &Event::new(EventKind::PipelineFinished, run_id, request.sample.clone()).with_data(
                json!({
                    "status": run.status.to_string(),
                    "target_artifact": run.target_artifact,
                    "failed_stage": run.failure.as_ref().map(|f| f.stage_id.as_str()),
                    "duration_ms": duration_ms,
                }),
            ),
        );
        Ok(run)
    }
}

impl Shared {
    async fn run_node(self: Arc<Self>, job: NodeJob) -> NodeReport {
        let span = info_span!("stage", stage = %job.node.id(), sample = %job.sample);
        let mut stage_run = None;
        let outcome = self
            .execute_node(&job, &mut stage_run)
            .instrument(span)
            .await
            .unwrap_or_else(NodeOutcome::Aborted);
        NodeReport {
            index: job.index,
            stage_run: stage_run.filter(|r: &StageRun| r.status != StageRunStatus::Pending),
            outcome,
        }
    }

    async fn execute_node(
        &self,
        job: &NodeJob,
        slot: &mut Option<StageRun>,
    ) -> Result<NodeOutcome, ImmunoflowError> {
        let stage = &job.node.stage;
        let inputs = self.resolve_inputs(job).await?;
        let input_ids: Vec<ArtifactId> = inputs.iter().map(|a| a.id.clone()).collect();
        let config_hash = hashing::hash_config(&job.config);
        let cache_key = hashing::cache_key(&stage.id, &input_ids, &config_hash);
        let stage_run = slot.insert(StageRun::new(
            job.run_id,
            &stage.id,
            job.sample.clone(),
            input_ids.clone(),
            config_hash.as_str(),
            cache_key,
        ));

        if let Some(output) = self
            .checkpoints
            .is_cached(&stage.id, &input_ids, &config_hash)
            .await
        {
            if self.artifacts.contains(&output).await {
                stage_run.skip_cached(output.clone())?;
                info!(artifact = %output.short(), "Reusing checkpointed output");
                self.emit_stage(
                    job,
                    EventKind::StageCached,
                    StageSpanAttributes::new(&stage.id)
                        .with_status(StageRunStatus::SkippedCached.to_string())
                        .with_artifact(output.as_str()),
                );
                return Ok(NodeOutcome::Produced(output));
            }
            debug!(artifact = %output.short(), "Checkpointed output is gone; running again");
        }

        let invocation_inputs: Vec<InvocationInput> = inputs
            .iter()
            .map(|a| InvocationInput {
                artifact_type: a.artifact_type,
                id: a.id.clone(),
                path: a.location.clone(),
            })
            .collect();

        let mut retry = RetryState::new();
        loop {
            if job.cancel.is_cancelled() {
                return Ok(self.cancelled(job, stage_run));
            }
            if job.halted() {
                return Ok(NodeOutcome::Halted);
            }
            let Some(permits) = self.acquire_slots(stage, &job.cancel).await else {
                return Ok(self.cancelled(job, stage_run));
            };
            let staging = self.artifacts.create_staging().await?;
            // No await between this check and the start event.
            if job.halted() {
                self.discard(&staging).await;
                return Ok(NodeOutcome::Halted);
            }
            stage_run.begin_attempt()?;
            retry.record_attempt();
            let attempt = retry.attempts;

            let request = InvocationRequest {
                stage: Arc::clone(stage),
                sample: job.sample.clone(),
                inputs: invocation_inputs.clone(),
                config: job.config.clone(),
                output_path: staging.output_path(),
                work_dir: staging.work_dir(),
                attempt,
            };
            debug!(attempt, collaborator = %stage.collaborator.label(), "Invoking collaborator");
            self.emit_stage(
                job,
                EventKind::StageStarted,
                StageSpanAttributes::new(&stage.id).with_attempt(attempt),
            );

            let timer = SpanTimer::start(stage.id.as_str());
            let result = self.invoker.invoke(&request, &job.cancel).await;
            drop(permits);
            let result = match result {
                Ok(outcome) => match self.ingest(job, &staging, &input_ids).await {
                    Ok(artifact) => Ok(artifact),
                    Err(StoreError::EmptyPayload { .. }) => Err(InvocationError::permanent(
                        Diagnostic::new(format!(
                            "{} reported success but wrote no output payload",
                            stage.collaborator.label()
                        ))
                        .with_exit_code(outcome.exit_code)
                        .with_output(outcome.stdout, outcome.stderr),
                    )),
                    Err(other) => {
                        self.discard(&staging).await;
                        return Err(other.into());
                    }
                },
                Err(e) => Err(e),
            };
            self.discard(&staging).await;
            let duration_ms = timer.finish();

            let (class, diagnostic) = match result {
                Ok(artifact) => {
                    stage_run.succeed(artifact.id.clone())?;
                    self.checkpoints.record(stage_run).await?;
                    info!(attempt, artifact = %artifact.id.short(), duration_ms, "Stage succeeded");
                    self.emit_stage(
                        job,
                        EventKind::StageSucceeded,
                        StageSpanAttributes::new(&stage.id)
                            .with_attempt(attempt)
                            .with_status(StageRunStatus::Succeeded.to_string())
                            .with_duration_ms(duration_ms)
                            .with_artifact(artifact.id.as_str()),
                    );
                    return Ok(NodeOutcome::Produced(artifact.id));
                }
                Err(InvocationError::Cancelled) => {
                    stage_run.fail(
                        FailureClass::Transient,
                        Diagnostic::new(format!(
                            "cancelled: {}",
                            job.cancel.reason().unwrap_or_default()
                        )),
                    )?;
                    return Ok(self.cancelled(job, stage_run));
                }
                Err(InvocationError::Failed { class, diagnostic }) => (class, diagnostic),
            };

            stage_run.fail(class, diagnostic.clone())?;
            match retry.decide(&stage.retry, class) {
                RetryDecision::Retry(delay) => {
                    warn!(
                        attempt,
                        max_attempts = stage.retry.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %diagnostic.message,
                        "Transient failure; retrying"
                    );
                    self.emit_stage(
                        job,
                        EventKind::StageRetrying,
                        StageSpanAttributes::new(&stage.id)
                            .with_attempt(attempt)
                            .with_error(diagnostic.message.as_str())
                            .with_retry_in(delay),
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = job.cancel.cancelled() => return Ok(self.cancelled(job, stage_run)),
                    }
                }
                RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                    if self.config.failure_mode == FailureMode::FailFast {
                        job.halt.store(true, Ordering::SeqCst);
                    }
                    self.checkpoints.record(stage_run).await?;
                    error!(
                        attempts = retry.attempts,
                        class = %class,
                        error = %diagnostic,
                        "Stage failed"
                    );
                    self.emit_stage(
                        job,
                        EventKind::StageFailed,
                        StageSpanAttributes::new(&stage.id)
                            .with_attempt(attempt)
                            .with_status(class.to_string())
                            .with_duration_ms(duration_ms)
                            .with_error(diagnostic.message.as_str()),
                    );
                    return Ok(NodeOutcome::Failed(RunFailure {
                        stage_id: stage.id.clone(),
                        class,
                        diagnostic,
                        attempts: retry.attempts,
                    }));
                }
            }
        }
    }

    /// Resolves each declared input to a stored artifact: the one produced
    /// earlier in this run, else the latest for the sample.
    async fn resolve_inputs(&self, job: &NodeJob) -> Result<Vec<Artifact>, ImmunoflowError> {
        let stage_id = job.node.id();
        let mut resolved = Vec::with_capacity(job.inputs.len());
        for (declared, known) in &job.inputs {
            let missing = || MissingInputArtifactError::new(stage_id, job.sample.clone(), *declared);
            let id = match known {
                Some(id) => id.clone(),
                None => {
                    self.artifacts
                        .latest(&job.sample, *declared)
                        .await
                        .ok_or_else(missing)?
                        .id
                }
            };
            let artifact = self.artifacts.get(&id).await.ok_or_else(missing)?;
            if !self.artifacts.contains(&id).await {
                return Err(missing().into());
            }
            if artifact.artifact_type != *declared {
                return Err(InvalidInputError::new(
                    stage_id,
                    format!(
                        "input {} has type '{}' but '{}' is declared",
                        id.short(),
                        artifact.artifact_type,
                        declared
                    ),
                )
                .into());
            }
            if artifact.sample != job.sample {
                return Err(InvalidInputError::new(
                    stage_id,
                    format!(
                        "input {} belongs to sample '{}', not '{}'",
                        id.short(),
                        artifact.sample,
                        job.sample
                    ),
                )
                .into());
            }
            resolved.push(artifact);
        }
        Ok(resolved)
    }

    /// Takes a resource-class slot (if the class is limited), then a worker
    /// slot. Returns `None` if cancelled while waiting.
    async fn acquire_slots(
        &self,
        stage: &StageDefinition,
        cancel: &CancellationToken,
    ) -> Option<Vec<OwnedSemaphorePermit>> {
        let mut permits = Vec::with_capacity(2);
        if let Some(limit) = stage
            .resource_class
            .as_ref()
            .and_then(|class| self.resources.get(class))
        {
            permits.push(acquire(limit, cancel).await?);
        }
        permits.push(acquire(&self.workers, cancel).await?);
        Some(permits)
    }

    async fn ingest(
        &self,
        job: &NodeJob,
        staging: &StagingArea,
        input_ids: &[ArtifactId],
    ) -> Result<Artifact, StoreError> {
        self.artifacts
            .ingest(IngestRequest {
                payload: staging.output_path(),
                sample: job.sample.clone(),
                artifact_type: job.node.stage.output,
                produced_by: job.node.stage.id.clone(),
                inputs: input_ids.to_vec(),
            })
            .await
    }

    async fn discard(&self, staging: &StagingArea) {
        if let Err(e) = self.artifacts.discard_staging(staging).await {
            warn!(staging = %staging.path().display(), error = %e, "Failed to discard staging area");
        }
    }

    fn cancelled(&self, job: &NodeJob, stage_run: &StageRun) -> NodeOutcome {
        if stage_run.was_invoked() {
            info!(attempts = stage_run.attempts, "Stage cancelled");
            self.emit_stage(
                job,
                EventKind::StageCancelled,
                StageSpanAttributes::new(job.node.id())
                    .with_attempt(stage_run.attempts)
                    .with_error(job.cancel.reason().unwrap_or_default()),
            );
        }
        NodeOutcome::Cancelled
    }

    fn emit_stage(&self, job: &NodeJob, kind: EventKind, attrs: StageSpanAttributes) {
        self.events.emit(
            &Event::new(kind, job.run_id, job.sample.clone())
                .with_stage(Some(job.node.id().to_string()))
                .with_data(attrs.to_json()),
        );
    }
}

async fn acquire(semaphore: &Arc<Semaphore>, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
    tokio::select! {
        permit = Arc::clone(semaphore).acquire_owned() => permit.ok(),
        () = cancel.cancelled() => None,
    }
}
