//! Moderation gate for raw user text.
//!
//! The gate makes no generation call. It asks a [`ModerationCapability`] for a
//! toxicity score and compares it to the configured threshold. When the
//! moderation service is unavailable or unconfigured the `fail_open` policy
//! decides: allow with a warning, or block.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::error::{PipelineError, PipelineResult};
use crate::error::ModerationError;
use crate::metrics::PipelineMetrics;

/// Default Perspective endpoint.
pub const PERSPECTIVE_API_URL: &str =
    "https://commentanalyzer.googleapis.com/v1alpha1/comments:analyze";

const MODERATION_HTTP_TIMEOUT_SECS: u64 = 30;

/// External toxicity scoring service.
#[async_trait]
pub trait ModerationCapability: Send + Sync {
    /// Returns a toxicity score in `[0, 1]`.
    async fn score(&self, text: &str) -> Result<f64, ModerationError>;
}

/// Outcome of a safety check.
#[derive(Debug, Clone, PartialEq)]
pub enum SafetyDecision {
    Allow,
    Block { reason: String, score: Option<f64> },
}

impl SafetyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SafetyDecision::Allow)
    }
}

/// User text that has passed the gate.
///
/// Only [`SafetyGate::screen`] constructs it, and tasks that consume user
/// text only accept it in this form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenedText(String);

impl ScreenedText {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[cfg(test)]
    pub(crate) fn assume_screened(text: impl Into<String>) -> Self {
        Self(text.into())
    }
}

/// Threshold comparison plus the unavailable-service policy.
#[derive(Clone)]
pub struct SafetyGate {
    moderation: Arc<dyn ModerationCapability>,
    threshold: f64,
    fail_open: bool,
    metrics: Option<PipelineMetrics>,
}

impl SafetyGate {
    pub fn new(moderation: Arc<dyn ModerationCapability>, threshold: f64, fail_open: bool) -> Self {
        Self {
            moderation,
            threshold,
            fail_open,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn fail_open(&self) -> bool {
        self.fail_open
    }

    /// Scores `text` and decides whether it may reach a generation task.
    ///
    /// Text scoring strictly above the threshold is blocked.
    pub async fn check(&self, text: &str) -> SafetyDecision {
        let decision = match self.moderation.score(text).await {
            Ok(score) if !(0.0..=1.0).contains(&score) => {
                self.unavailable(ModerationError::ScoreOutOfRange(score))
            }
            Ok(score) if score > self.threshold => {
                tracing::info!(score = score, threshold = self.threshold, "Input blocked by moderation");
                SafetyDecision::Block {
                    reason: format!(
                        "toxicity score {:.2} exceeds threshold {:.2}",
                        score, self.threshold
                    ),
                    score: Some(score),
                }
            }
            Ok(score) => {
                tracing::debug!(score = score, threshold = self.threshold, "Input passed moderation");
                SafetyDecision::Allow
            }
            Err(err) => self.unavailable(err),
        };

        if let Some(metrics) = &self.metrics {
            let label = match &decision {
                SafetyDecision::Allow => "allow",
                SafetyDecision::Block { .. } => "block",
            };
            metrics.record_safety_decision(label);
        }
        decision
    }

    /// Checks `text` and wraps it for consumption by generation tasks.
    ///
    /// # Errors
    ///
    /// Returns `SafetyViolation` when the gate blocks the text.
    pub async fn screen(&self, text: &str) -> PipelineResult<ScreenedText> {
        match self.check(text).await {
            SafetyDecision::Allow => Ok(ScreenedText(text.to_string())),
            SafetyDecision::Block { reason, score } => {
                Err(PipelineError::SafetyViolation { reason, score })
            }
        }
    }

    fn unavailable(&self, err: ModerationError) -> SafetyDecision {
        if self.fail_open {
            tracing::warn!(error = %err, "Moderation unavailable, failing open");
            SafetyDecision::Allow
        } else {
            tracing::error!(error = %err, "Moderation unavailable, failing closed");
            SafetyDecision::Block {
                reason: format!("moderation unavailable: {}", err),
                score: None,
            }
        }
    }
}

/// Perspective API client requesting the `TOXICITY` attribute.
#[derive(Debug, Clone)]
pub struct PerspectiveModeration {
    api_url: String,
    api_key: Option<String>,
    http_client: Client,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    #[serde(rename = "attributeScores", default)]
    attribute_scores: Option<AttributeScores>,
}

#[derive(Debug, Deserialize)]
struct AttributeScores {
    #[serde(rename = "TOXICITY")]
    toxicity: Option<AttributeScore>,
}

#[derive(Debug, Deserialize)]
struct AttributeScore {
    #[serde(rename = "summaryScore")]
    summary_score: SummaryScore,
}

#[derive(Debug, Deserialize)]
struct SummaryScore {
    value: f64,
}

impl PerspectiveModeration {
    /// # Errors
    ///
    /// Returns `ModerationError::Unreachable` if the HTTP client cannot be built.
    pub fn new(api_url: impl Into<String>, api_key: Option<String>) -> Result<Self, ModerationError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(MODERATION_HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| ModerationError::Unreachable(e.to_string()))?;
        Ok(Self {
            api_url: api_url.into(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            http_client,
        })
    }

    /// Reads `PERSPECTIVE_API_KEY`. A missing key is not an error here; every
    /// call then reports `NotConfigured` so the gate's policy applies.
    pub fn from_env() -> Result<Self, ModerationError> {
        Self::new(PERSPECTIVE_API_URL, env::var("PERSPECTIVE_API_KEY").ok())
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

#[async_trait]
impl ModerationCapability for PerspectiveModeration {
    async fn score(&self, text: &str) -> Result<f64, ModerationError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ModerationError::NotConfigured("PERSPECTIVE_API_KEY not set".to_string()))?;

        let body = json!({
            "comment": { "text": text },
            "languages": ["en"],
            "requestedAttributes": { "TOXICITY": {} }
        });

        let url = format!("{}?key={}", self.api_url, api_key);
        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ModerationError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(ModerationError::ApiError {
                code: status.as_u16(),
                message,
            });
        }

        let parsed: AnalyzeResponse = response
            .json()
            .await
            .map_err(|e| ModerationError::ParseError(e.to_string()))?;

        parsed
            .attribute_scores
            .and_then(|scores| scores.toxicity)
            .map(|toxicity| toxicity.summary_score.value)
            .ok_or_else(|| ModerationError::ParseError("missing TOXICITY summary score".to_string()))
    }
}
