//! Outbound model interface
//!
//! Every model call goes through the [`ModelClient`] trait so the pipeline can
//! run against a hosted endpoint or against [`scripted::ScriptedModel`] in tests.

pub mod openai;
pub mod scripted;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};

use crate::config::ModelConfig;
use crate::error::PipelineError;
use crate::normalize::{parse_model_output, ParsedOutput};

/// Which pipeline step issued a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPurpose {
    Extract,
    Consolidate,
    Convert,
    /// Page to Markdown, answered in plain text
    Transcribe,
}

impl CallPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Consolidate => "consolidate",
            Self::Convert => "convert",
            Self::Transcribe => "transcribe",
        }
    }

    /// Whether the answer must be a JSON document
    pub fn expects_json(&self) -> bool {
        !matches!(self, Self::Transcribe)
    }
}

/// One chat-style request: system prompt, user text, optional PNG images
#[derive(Debug, Clone)]
pub struct ModelRequest<'a> {
    pub purpose: CallPurpose,
    pub system: &'a str,
    pub user: String,
    pub images: Vec<&'a [u8]>,
}

#[derive(Error, Debug, Clone)]
pub enum ModelCallError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("model endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed API response: {0}")]
    MalformedResponse(String),

    #[error("model returned no content")]
    EmptyResponse,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Model identifier, for logging and `/info`
    fn name(&self) -> &str;

    /// Send one request and return the raw text the model produced
    async fn complete(&self, request: &ModelRequest<'_>) -> Result<String, ModelCallError>;
}

/// Attempt budget applied to every model call
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub timeout: Duration,
}

impl From<&ModelConfig> for RetryPolicy {
    fn from(config: &ModelConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_ms: config.retry_backoff_ms,
            timeout: config.timeout,
        }
    }
}

/// Wait before attempt `attempt` (1-based): none before the first, then
/// `backoff_ms * 2^(attempt-2)`
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    if attempt < 2 {
        return Duration::ZERO;
    }
    let factor = 1u64 << (attempt - 2).min(16);
    Duration::from_millis(policy.backoff_ms.saturating_mul(factor))
}

/// Call the model and parse its answer into JSON, retrying transient failures.
///
/// Transport errors, timeouts and unparsable text each consume one attempt.
/// The same request is re-sent unchanged, waiting [`backoff_delay`] between
/// attempts. When the budget runs out the last failure is returned.
pub async fn request_json(
    client: &dyn ModelClient,
    request: &ModelRequest<'_>,
    policy: &RetryPolicy,
) -> Result<Value, PipelineError> {
    with_retries(client, request, policy, |text| match parse_model_output(&text) {
        ParsedOutput::Structured(value) => Ok(value),
        ParsedOutput::Unparsable { reason } => Err(PipelineError::UnparsableOutput(reason)),
    })
    .await
}

/// Call the model for free text under the same attempt budget.
///
/// Only transport failures, timeouts and blank answers are retried.
pub async fn request_text(
    client: &dyn ModelClient,
    request: &ModelRequest<'_>,
    policy: &RetryPolicy,
) -> Result<String, PipelineError> {
    with_retries(client, request, policy, |text| {
        if text.trim().is_empty() {
            Err(PipelineError::UnparsableOutput(
                "model returned blank text".to_string(),
            ))
        } else {
            Ok(text)
        }
    })
    .await
}

async fn with_retries<T>(
    client: &dyn ModelClient,
    request: &ModelRequest<'_>,
    policy: &RetryPolicy,
    accept: impl Fn(String) -> Result<T, PipelineError>,
) -> Result<T, PipelineError> {
    let mut last_err = PipelineError::ExternalModel("no attempts were made".to_string());

    for attempt in 1..=policy.max_attempts {
        let backoff = backoff_delay(policy, attempt);
        if !backoff.is_zero() {
            tracing::warn!(
                "{} call: retry {}/{} after {}ms",
                request.purpose.as_str(),
                attempt,
                policy.max_attempts,
                backoff.as_millis()
            );
            sleep(backoff).await;
        }

        let err = match timeout(policy.timeout, client.complete(request)).await {
            Err(_) => PipelineError::ExternalModel(format!(
                "model call timed out after {}ms",
                policy.timeout.as_millis()
            )),
            Ok(Err(e)) => PipelineError::ExternalModel(e.to_string()),
            Ok(Ok(text)) => match accept(text) {
                Ok(answer) => {
                    tracing::debug!(
                        "{} call succeeded on attempt {}",
                        request.purpose.as_str(),
                        attempt
                    );
                    return Ok(answer);
                }
                Err(e) => e,
            },
        };

        tracing::warn!(
            "{} call: attempt {}/{} failed: {}",
            request.purpose.as_str(),
            attempt,
            policy.max_attempts,
            err
        );
        last_err = err;
    }

    Err(last_err)
}
