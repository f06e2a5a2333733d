//! Scripted stage invoker.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::cancellation::CancellationToken;
use crate::errors::Diagnostic;
use crate::invoke::{InvocationError, InvocationOutcome, InvocationRequest, StageInvoker};

/// How a stage behaves when invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    /// Write the deterministic payload.
    Succeed,
    /// Fail transiently for the first `times` attempts, then succeed.
    FailTransient {
        /// Number of failing attempts.
        times: u32,
    },
    /// Fail transiently on every attempt.
    AlwaysTransient,
    /// Fail permanently.
    FailPermanent(String),
    /// Report success without writing anything.
    NoOutput,
    /// Write a partial payload, then block until cancelled.
    Hang,
    /// Sleep, then succeed.
    Delay(Duration),
}

/// A [`StageInvoker`] driven by per-stage [`Script`]s.
///
/// Successful invocations write a payload derived only from the stage id,
/// the input artifact ids and the resolved configuration, so identical
/// inputs always produce identical content.
#[derive(Debug, Default)]
pub struct ScriptedInvoker {
    scripts: Mutex<HashMap<String, Script>>,
    counts: DashMap<String, u32>,
    calls: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    class_active: DashMap<String, usize>,
    class_peak: DashMap<String, usize>,
}

impl ScriptedInvoker {
    /// Creates an invoker where every stage succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the script for `stage_id`.
    #[must_use]
    pub fn with_script(self, stage_id: impl Into<String>, script: Script) -> Self {
        self.set_script(stage_id, script);
        self
    }

    /// Replaces the script for `stage_id`.
    pub fn set_script(&self, stage_id: impl Into<String>, script: Script) {
        self.scripts.lock().insert(stage_id.into(), script);
    }

    /// Restores the default (succeed) script for `stage_id`.
    pub fn clear_script(&self, stage_id: &str) {
        self.scripts.lock().remove(stage_id);
    }

    /// Number of attempts made for `stage_id`.
    #[must_use]
    pub fn invocations(&self, stage_id: &str) -> u32 {
        self.counts.get(stage_id).map_or(0, |c| *c)
    }

    /// Number of attempts across all stages.
    #[must_use]
    pub fn total_invocations(&self) -> u32 {
        self.counts.iter().map(|c| *c.value()).sum()
    }

    /// Stage ids in the order their attempts started.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Highest number of attempts that were running at the same time.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Highest number of attempts of stages in `resource_class` that were
    /// running at the same time.
    #[must_use]
    pub fn peak_concurrency_in(&self, resource_class: &str) -> usize {
        self.class_peak.get(resource_class).map_or(0, |p| *p)
    }

    /// Forgets recorded calls and counts. Scripts are kept.
    pub fn reset(&self) {
        self.counts.clear();
        self.calls.lock().clear();
        self.peak.store(0, Ordering::SeqCst);
        self.class_peak.clear();
    }

    fn enter_class(&self, resource_class: &str) {
        let active = {
            let mut active = self.class_active.entry(resource_class.to_string()).or_insert(0);
            *active += 1;
            *active
        };
        let mut peak = self.class_peak.entry(resource_class.to_string()).or_insert(0);
        *peak = (*peak).max(active);
    }

    fn leave_class(&self, resource_class: &str) {
        if let Some(mut active) = self.class_active.get_mut(resource_class) {
            *active = active.saturating_sub(1);
        }
    }

    fn payload(request: &InvocationRequest) -> String {
        let inputs: Vec<&str> = request.inputs.iter().map(|i| i.id.as_str()).collect();
        let config = serde_json::to_string(&request.config).unwrap_or_default();
        format!(
            "stage={}\nsample={}\ninputs={}\nconfig={config}\n",
            request.stage.id,
            request.sample,
            inputs.join(",")
        )
    }

    async fn perform(
        &self,
        script: Script,
        attempt_index: u32,
        request: &InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<(), InvocationError> {
        match script {
            Script::Succeed => {}
            Script::FailTransient { times } if attempt_index <= times => {
                return Err(InvocationError::transient(Diagnostic::new(format!(
                    "{} unavailable (attempt {attempt_index})",
                    request.stage.id
                ))));
            }
            Script::FailTransient { .. } => {}
            Script::AlwaysTransient => {
                return Err(InvocationError::transient(Diagnostic::new("collaborator busy")));
            }
            Script::FailPermanent(message) => {
                return Err(InvocationError::permanent(
                    Diagnostic::new(message.clone()).with_output("", message),
                ));
            }
            Script::NoOutput => return Ok(()),
            Script::Hang => {
                let _ = tokio::fs::write(&request.output_path, b"partial").await;
                cancel.cancelled().await;
                return Err(InvocationError::Cancelled);
            }
            Script::Delay(delay) => {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return Err(InvocationError::Cancelled),
                }
            }
        }
        tokio::fs::write(&request.output_path, Self::payload(request))
            .await
            .map_err(|e| InvocationError::permanent(Diagnostic::new(format!("write failed: {e}"))))
    }
}

#[async_trait]
impl StageInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        request: &InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<InvocationOutcome, InvocationError> {
        let started = Instant::now();
        let attempt_index = {
            let mut count = self.counts.entry(request.stage.id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.calls.lock().push(request.stage.id.clone());
        let script = self
            .scripts
            .lock()
            .get(&request.stage.id)
            .cloned()
            .unwrap_or(Script::Succeed);

        let class = request.stage.resource_class.as_deref();
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        if let Some(class) = class {
            self.enter_class(class);
        }
        let result = self.perform(script, attempt_index, request, cancel).await;
        if let Some(class) = class {
            self.leave_class(class);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        result.map(|()| InvocationOutcome {
            exit_code: Some(0),
            duration: started.elapsed(),
            ..InvocationOutcome::default()
        })
    }
}
