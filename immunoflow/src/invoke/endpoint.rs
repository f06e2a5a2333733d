//! Model-serving endpoint collaborators.

use super::{InvocationError, InvocationInput, InvocationOutcome, InvocationRequest, DIAGNOSTIC_TAIL_CHARS};
use crate::cancellation::CancellationToken;
use crate::contracts::{EndpointSpec, ResolvedConfig};
use crate::errors::Diagnostic;
use crate::utils::tail;
use reqwest::StatusCode;
use serde::Serialize;
use std::path::Path;
use std::time::{Duration, Instant};

#[derive(Debug, Serialize)]
struct EndpointRequest<'a> {
    stage: &'a str,
    sample: &'a str,
    attempt: u32,
    inputs: &'a [InvocationInput],
    config: &'a ResolvedConfig,
    output: &'a Path,
}

/// Calls [`EndpointSpec`] collaborators over HTTP.
///
/// The request body is a JSON description of the invocation; a 2xx
/// response body becomes the output payload.
#[derive(Debug, Clone, Default)]
pub struct EndpointInvoker {
    client: reqwest::Client,
}

impl EndpointInvoker {
    /// Creates an invoker with its own connection pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs one attempt of `spec`.
    ///
    /// # Errors
    ///
    /// Timeouts, connection failures, 429 and 5xx responses are transient;
    /// other non-2xx responses are permanent.
    pub async fn run(
        &self,
        spec: &EndpointSpec,
        request: &InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<InvocationOutcome, InvocationError> {
        let body = EndpointRequest {
            stage: &request.stage.id,
            sample: request.sample.as_str(),
            attempt: request.attempt,
            inputs: &request.inputs,
            config: &request.config,
            output: &request.output_path,
        };
        let mut builder = self
            .client
            .post(&spec.url)
            .timeout(Duration::from_secs(spec.timeout_secs))
            .json(&body);
        for (name, value) in &spec.headers {
            builder = builder.header(name, value);
        }

        tracing::debug!(
            stage = %request.stage.id,
            sample = %request.sample,
            attempt = request.attempt,
            url = %spec.url,
            "Calling model endpoint"
        );
        let started = Instant::now();

        let call = async {
            let response = builder.send().await.map_err(|e| classify_transport(&spec.url, &e))?;
            let status = response.status();
            let bytes = response
                .bytes()
                .await
                .map_err(|e| classify_transport(&spec.url, &e))?;
            Ok::<_, InvocationError>((status, bytes))
        };
        let (status, bytes) = tokio::select! {
            result = call => result?,
            () = cancel.cancelled() => return Err(InvocationError::Cancelled),
        };

        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes);
            return Err(classify_status(&spec.url, status, tail(&text, DIAGNOSTIC_TAIL_CHARS)));
        }

        tokio::fs::write(&request.output_path, &bytes).await.map_err(|e| {
            InvocationError::transient(Diagnostic::new(format!(
                "cannot write endpoint response to {}: {e}",
                request.output_path.display()
            )))
        })?;

        Ok(InvocationOutcome {
            exit_code: None,
            stdout: format!("HTTP {status}, {} bytes", bytes.len()),
            stderr: String::new(),
            duration: started.elapsed(),
        })
    }
}

/// Classifies a non-2xx response: 429 and every 5xx are transient.
#[must_use]
pub fn classify_status(url: &str, status: StatusCode, body: String) -> InvocationError {
    let diagnostic = Diagnostic::new(format!("{url} responded {status}")).with_output(String::new(), body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        InvocationError::transient(diagnostic)
    } else {
        InvocationError::permanent(diagnostic)
    }
}

fn classify_transport(url: &str, error: &reqwest::Error) -> InvocationError {
    let diagnostic = Diagnostic::new(format!("request to {url} failed: {error}"));
    if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() {
        InvocationError::transient(diagnostic)
    } else {
        InvocationError::permanent(diagnostic)
    }
}
