//! Subprocess collaborators.

use super::search_manifest::write_search_manifest;
use super::{
    CommandTemplate, InvocationError, InvocationOutcome, InvocationRequest, DIAGNOSTIC_TAIL_CHARS,
};
use crate::cancellation::CancellationToken;
use crate::contracts::CommandSpec;
use crate::errors::Diagnostic;
use crate::utils::tail;
use std::io::ErrorKind;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Sample id exported to the child process.
pub const ENV_SAMPLE: &str = "IMMUNOFLOW_SAMPLE";
/// Output path exported to the child process.
pub const ENV_OUTPUT: &str = "IMMUNOFLOW_OUTPUT";
/// Resolved configuration (JSON) exported to the child process.
pub const ENV_CONFIG: &str = "IMMUNOFLOW_CONFIG";

/// How long to wait for pipe readers once the child is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

enum Exit {
    Status(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut(Duration),
}

/// Runs [`CommandSpec`] collaborators as child processes.
///
/// The child runs in the staging work directory with stdin closed and
/// stdout/stderr captured. It is killed on timeout, on cancellation, and if
/// the invocation future is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandInvoker;

impl CommandInvoker {
    /// Runs one attempt of `spec`.
    ///
    /// # Errors
    ///
    /// See [`classify_exit`] and [`classify_spawn_error`] for how failures
    /// are classified.
    pub async fn run(
        &self,
        spec: &CommandSpec,
        request: &InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<InvocationOutcome, InvocationError> {
        let template = CommandTemplate::new(spec);
        let rendered = template.render(request)?;
        let config_json = serde_json::to_string(&request.config).map_err(|e| {
            InvocationError::permanent(Diagnostic::new(format!("cannot encode configuration: {e}")))
        })?;
        tokio::fs::create_dir_all(&request.work_dir).await.map_err(|e| {
            InvocationError::transient(Diagnostic::new(format!(
                "cannot create work dir {}: {e}",
                request.work_dir.display()
            )))
        })?;
        if template.uses_manifest() {
            write_search_manifest(request).await?;
        }

        let mut command = Command::new(&rendered.program);
        command
            .args(&rendered.args)
            .envs(&rendered.env)
            .env(ENV_SAMPLE, request.sample.as_str())
            .env(ENV_OUTPUT, &request.output_path)
            .env(ENV_CONFIG, config_json)
            .current_dir(&request.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            stage = %request.stage.id,
            sample = %request.sample,
            attempt = request.attempt,
            program = %rendered.program,
            args = ?rendered.args,
            "Spawning collaborator"
        );

        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| classify_spawn_error(&rendered.program, &e))?;
        let stdout = child.stdout.take().map(|pipe| tokio::spawn(read_all(pipe)));
        let stderr = child.stderr.take().map(|pipe| tokio::spawn(read_all(pipe)));

        let limit = spec.timeout_secs.map(Duration::from_secs);
        let deadline = async {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let exit = tokio::select! {
            status = child.wait() => Exit::Status(status),
            () = cancel.cancelled() => Exit::Cancelled,
            () = deadline => Exit::TimedOut(limit.unwrap_or_default()),
        };

        if !matches!(exit, Exit::Status(_)) {
            if let Err(e) = child.kill().await {
                tracing::warn!(stage = %request.stage.id, error = %e, "Failed to kill collaborator");
            }
        }
        let stdout = drain(stdout).await;
        let stderr = drain(stderr).await;

        match exit {
            Exit::Cancelled => Err(InvocationError::Cancelled),
            Exit::TimedOut(limit) => Err(InvocationError::transient(
                Diagnostic::new(format!(
                    "{} timed out after {}s",
                    rendered.program,
                    limit.as_secs()
                ))
                .with_output(stdout, stderr),
            )),
            Exit::Status(Err(e)) => Err(InvocationError::transient(
                Diagnostic::new(format!("failed waiting for {}: {e}", rendered.program))
                    .with_output(stdout, stderr),
            )),
            Exit::Status(Ok(status)) if status.success() => Ok(InvocationOutcome {
                exit_code: status.code(),
                stdout,
                stderr,
                duration: started.elapsed(),
            }),
            Exit::Status(Ok(status)) => Err(classify_exit(
                &rendered.program,
                status.code(),
                &spec.transient_exit_codes,
                stdout,
                stderr,
            )),
        }
    }
}

/// Classifies a non-zero exit.
///
/// Codes listed in `transient_codes` are transient; other codes are
/// permanent. Termination by signal (no code) is transient.
#[must_use]
pub fn classify_exit(
    program: &str,
    code: Option<i32>,
    transient_codes: &[i32],
    stdout: String,
    stderr: String,
) -> InvocationError {
    let message = code.map_or_else(
        || format!("{program} was terminated by a signal"),
        |c| format!("{program} exited with status {c}"),
    );
    let diagnostic = Diagnostic::new(message)
        .with_exit_code(code)
        .with_output(stdout, stderr);
    match code {
        Some(c) if !transient_codes.contains(&c) => InvocationError::permanent(diagnostic),
        _ => InvocationError::transient(diagnostic),
    }
}

/// Classifies a spawn failure: a missing or non-executable program is
/// permanent, anything else (e.g. resource exhaustion) transient.
#[must_use]
pub fn classify_spawn_error(program: &str, error: &std::io::Error) -> InvocationError {
    let diagnostic = Diagnostic::new(format!("failed to start {program}: {error}"));
    match error.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => InvocationError::permanent(diagnostic),
        _ => InvocationError::transient(diagnostic),
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut pipe: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = pipe.read_to_end(&mut buf).await {
        tracing::debug!(error = %e, "Collaborator pipe closed with error");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn drain(reader: Option<JoinHandle<String>>) -> String {
    let Some(handle) = reader else {
        return String::new();
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
        Ok(Ok(text)) => tail(&text, DIAGNOSTIC_TAIL_CHARS),
        _ => String::new(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::contracts::{Collaborator, StageDefinition};
    use crate::core::{ArtifactType, SampleId};
    use crate::errors::FailureClass;
    use std::sync::Arc;

    fn request(spec: &CommandSpec, dir: &std::path::Path) -> InvocationRequest {
        let stage = StageDefinition::new(
            "qc",
            [],
            ArtifactType::CleanedRun,
            Collaborator::Command(spec.clone()),
        );
        InvocationRequest {
            stage: Arc::new(stage),
            sample: SampleId::new("S1").unwrap(),
            inputs: vec![],
            config: serde_json::Map::new(),
            output_path: dir.join("payload"),
            work_dir: dir.join("work"),
            attempt: 1,
        }
    }

    async fn run(spec: CommandSpec) -> (tempfile::TempDir, Result<InvocationOutcome, InvocationError>) {
        let dir = tempfile::tempdir().unwrap();
        let req = request(&spec, dir.path());
        let result = CommandInvoker.run(&spec, &req, &CancellationToken::new()).await;
        (dir, result)
    }

    #[tokio::test]
    async fn test_successful_command_writes_output() {
        let spec = CommandSpec::new("sh", ["-c", "echo \"$IMMUNOFLOW_SAMPLE\" > {output}; echo done"]);
        let (dir, result) = run(spec).await;

        let outcome = result.unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout.trim(), "done");
        let written = tokio::fs::read_to_string(dir.path().join("payload")).await.unwrap();
        assert_eq!(written.trim(), "S1");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_permanent_with_stderr() {
        let spec = CommandSpec::new("sh", ["-c", "echo 'bad haplotype' >&2; exit 3"]);
        let (_dir, result) = run(spec).await;

        match result.unwrap_err() {
            InvocationError::Failed { class, diagnostic } => {
                assert_eq!(class, FailureClass::Permanent);
                assert_eq!(diagnostic.exit_code, Some(3));
                assert!(diagnostic.stderr.contains("bad haplotype"));
            }
            InvocationError::Cancelled => panic!("unexpected cancellation"),
        }
    }

    #[tokio::test]
    async fn test_configured_exit_code_is_transient() {
        let spec = CommandSpec::new("sh", ["-c", "exit 75"]).with_transient_exit_codes([75]);
        let (_dir, result) = run(spec).await;
        assert!(matches!(
            result.unwrap_err(),
            InvocationError::Failed { class: FailureClass::Transient, .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_permanent() {
        let spec = CommandSpec::new("immunoflow-definitely-missing-tool", Vec::<String>::new());
        let (_dir, result) = run(spec).await;
        assert!(matches!(
            result.unwrap_err(),
            InvocationError::Failed { class: FailureClass::Permanent, .. }
        ));
    }

    #[tokio::test]
    async fn test_timeout_kills_and_is_transient() {
        let spec = CommandSpec::new("sleep", ["30"]).with_timeout_secs(1);
        let started = Instant::now();
        let (_dir, result) = run(spec).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        match result.unwrap_err() {
            InvocationError::Failed { class, diagnostic } => {
                assert_eq!(class, FailureClass::Transient);
                assert!(diagnostic.message.contains("timed out"));
            }
            InvocationError::Cancelled => panic!("unexpected cancellation"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::new("sleep", ["30"]);
        let req = request(&spec, dir.path());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel("test");
        });

        let started = Instant::now();
        let result = CommandInvoker.run(&spec, &req, &cancel).await;
        assert_eq!(result.unwrap_err(), InvocationError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_config_exported_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::new("sh", ["-c", "printf '%s' \"$IMMUNOFLOW_CONFIG\" > {output}"]);
        let mut req = request(&spec, dir.path());
        req.config.insert("mode".into(), serde_json::json!("centroid"));

        CommandInvoker.run(&spec, &req, &CancellationToken::new()).await.unwrap();
        let written = tokio::fs::read_to_string(dir.path().join("payload")).await.unwrap();
        assert_eq!(written, r#"{"mode":"centroid"}"#);
    }
}
