//! Retrying wrapper around the generation capability.
//!
//! [`GenerationClient::invoke`] is the only place in the crate that retries.
//! Transient failures (rate limiting, unavailability, gateway errors,
//! per-attempt timeouts) are retried with exponential backoff; everything
//! else, including schema validation failures, is reported on first
//! occurrence.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::capability::{GenerationCall, GenerationCapability};
use crate::artifacts::Artifact;
use crate::metrics::PipelineMetrics;
use crate::pipeline::error::{PipelineError, PipelineResult};

/// Backoff schedule and per-attempt deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Delay multiplier per further retry.
    pub backoff_base: f64,
    /// Cap applied to every delay.
    pub max_delay: Duration,
    /// Deadline for a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            backoff_base: 7.0,
            max_delay: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): `initial * base^retry`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_base.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Why a single attempt did not produce a value.
enum AttemptFailure {
    Retryable(PipelineError),
    Fatal(PipelineError),
}

/// Calls the generation capability with retry, timeout and cancellation.
#[derive(Clone)]
pub struct GenerationClient {
    capability: Arc<dyn GenerationCapability>,
    policy: RetryPolicy,
    metrics: Option<PipelineMetrics>,
}

impl GenerationClient {
    pub fn new(capability: Arc<dyn GenerationCapability>, policy: RetryPolicy) -> Self {
        Self {
            capability,
            policy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn record(&self, task: &str, outcome: &str, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_generation_attempt(task, outcome, started.elapsed().as_secs_f64());
        }
    }

    async fn attempt(&self, call: &GenerationCall) -> Result<Artifact, AttemptFailure> {
        let task = call.task_name.as_str();
        let started = Instant::now();

        let outcome =
            tokio::time::timeout(self.policy.attempt_timeout, self.capability.generate(call))
                .await;

        match outcome {
            Err(_elapsed) => {
                self.record(task, "timeout", started);
                Err(AttemptFailure::Retryable(PipelineError::Timeout {
                    task: task.to_string(),
                    timeout: self.policy.attempt_timeout,
                }))
            }
            Ok(Err(err)) if err.is_transient() => {
                self.record(task, "transient", started);
                Err(AttemptFailure::Retryable(PipelineError::Terminal {
                    task: task.to_string(),
                    source: err,
                }))
            }
            Ok(Err(err)) => {
                self.record(task, "terminal", started);
                Err(AttemptFailure::Fatal(PipelineError::Terminal {
                    task: task.to_string(),
                    source: err,
                }))
            }
            Ok(Ok(value)) => match Artifact::parse(call.output, value) {
                Ok(artifact) => {
                    self.record(task, "success", started);
                    Ok(artifact)
                }
                Err(source) => {
                    self.record(task, "invalid", started);
                    Err(AttemptFailure::Fatal(PipelineError::validation(task, source)))
                }
            },
        }
    }

    /// Invokes the capability and validates its output as `call.output`.
    ///
    /// # Errors
    ///
    /// - `Validation` if the value does not match the schema (never retried)
    /// - `Terminal` for non-transient capability errors (never retried)
    /// - `GenerationUnavailable` once every attempt failed transiently
    /// - `Cancelled` if `cancel` fires during an attempt or a backoff sleep
    pub async fn invoke(
        &self,
        call: &GenerationCall,
        cancel: &CancellationToken,
    ) -> PipelineResult<Artifact> {
        let task = call.task_name.as_str();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::cancelled(task)),
                result = self.attempt(call) => result,
            };

            let err = match result {
                Ok(artifact) => {
                    if attempt > 1 {
                        tracing::info!(task = task, attempt = attempt, "Generation succeeded after retry");
                    }
                    return Ok(artifact);
                }
                Err(AttemptFailure::Fatal(err)) => {
                    tracing::warn!(task = task, attempt = attempt, error = %err, "Non-transient generation failure");
                    return Err(err);
                }
                Err(AttemptFailure::Retryable(err)) => err,
            };

            last_error = err.to_string();
            if attempt == max_attempts {
                break;
            }

            let delay = self.policy.delay_for(attempt - 1);
            tracing::warn!(
                task = task,
                attempt = attempt,
                max_attempts = max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient error, will retry"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::cancelled(task)),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::error!(task = task, attempts = max_attempts, error = %last_error, "Retries exhausted");
        Err(PipelineError::GenerationUnavailable {
            task: task.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }
}
