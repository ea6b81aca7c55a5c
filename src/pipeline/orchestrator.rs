//! Pipeline orchestrator for story requests.
//!
//! This module provides the `PipelineOrchestrator` that coordinates one run:
//! - Loading the session from a `SessionStore`
//! - Screening the request through the `SafetyGate`
//! - Classifying it with the `Router` (falling back to QUESTION)
//! - Running the stage chain for the selected mode
//! - Saving the session back on success
//! - Streaming progress events in execution order

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::config::{ConfigError, PipelineConfig};
use super::error::{PipelineError, PipelineResult};
use super::events::{EventSink, PipelineEvent};
use super::fan_out::FanOutStage;
use super::refinement::RefinementLoop;
use super::router::{Mode, Router, RoutingDecision};
use super::safety::{ModerationCapability, SafetyGate, ScreenedText};
use super::sequential::SequentialStage;
use crate::agents::{GenerationTask, TaskCatalogue, TaskContext};
use crate::artifacts::Artifact;
use crate::llm::{GenerationCapability, GenerationClient};
use crate::metrics::PipelineMetrics;
use crate::session::{SessionKey, SessionState, SessionStore};

/// Buffer size of the channel returned by [`PipelineOrchestrator::stream`].
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

// Stage positions used to stamp session writes within one run.
const SEQ_INTENT: u32 = 0;
const SEQ_PLANNING: u32 = 1;
const SEQ_WRITER: u32 = 2;
const SEQ_REFINEMENT: u32 = 3;
const SEQ_SINGLE: u32 = 0;

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The run ended with a `complete` event.
    Completed,
    /// The run ended with an `error` event.
    Failed,
    /// The run was cancelled by its caller.
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One pipeline execution.
#[derive(Debug)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub session: SessionKey,
    /// Mode selected by the router, if routing happened.
    pub mode: Option<Mode>,
    /// Every event emitted, in order.
    pub events: Vec<PipelineEvent>,
    /// Final artifact or the error that ended the run.
    pub outcome: PipelineResult<Artifact>,
    pub duration: Duration,
}

impl PipelineRun {
    pub fn status(&self) -> RunStatus {
        match &self.outcome {
            Ok(_) => RunStatus::Completed,
            Err(err) if err.is_cancelled() => RunStatus::Cancelled,
            Err(_) => RunStatus::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&PipelineError> {
        self.outcome.as_ref().err()
    }
}

/// Statistics about runs handled by one orchestrator.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    /// Total number of runs.
    pub total_runs: u64,
    pub successful: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Average run duration.
    pub average_duration: Duration,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, status: RunStatus, duration: Duration) {
        self.total_runs += 1;
        match status {
            RunStatus::Completed => self.successful += 1,
            RunStatus::Failed => self.failed += 1,
            RunStatus::Cancelled => self.cancelled += 1,
        }
        self.update_average_duration(duration);
    }

    /// Updates the running average duration.
    fn update_average_duration(&mut self, duration: Duration) {
        if self.total_runs == 1 {
            self.average_duration = duration;
        } else {
            // Incremental average: avg = avg + (new - avg) / n
            let n = self.total_runs as f64;
            let old_avg = self.average_duration.as_secs_f64();
            let new_avg = old_avg + (duration.as_secs_f64() - old_avg) / n;
            self.average_duration = Duration::from_secs_f64(new_avg.max(0.0));
        }
    }
}

/// What a mode chain hands back to `run`.
struct ChainResult {
    artifact: Artifact,
    /// Session to save; `None` leaves the stored session untouched.
    save: Option<SessionState>,
}

/// Top-level controller for story requests.
///
/// Holds no per-run state, so one orchestrator can serve many sessions
/// concurrently. Each run owns the `SessionState` it loaded.
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    client: GenerationClient,
    safety: SafetyGate,
    router: Router,
    catalogue: TaskCatalogue,
    planning: FanOutStage,
    refinement: RefinementLoop,
    metrics: PipelineMetrics,
    stats: Mutex<PipelineStats>,
}

impl PipelineOrchestrator {
    pub fn builder() -> PipelineOrchestratorBuilder {
        PipelineOrchestratorBuilder::new()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Snapshot of the run statistics.
    pub fn stats(&self) -> PipelineStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    /// Handles one request against the session stored under `key`.
    ///
    /// Events are recorded in the returned [`PipelineRun`] and, when `tx` is
    /// set, forwarded as they happen. The last event is `complete` on success
    /// and `error` otherwise. The session is written back only on success.
    pub async fn run(
        &self,
        user_text: &str,
        store: &dyn SessionStore,
        key: &SessionKey,
        tx: Option<mpsc::Sender<PipelineEvent>>,
        cancel: CancellationToken,
    ) -> PipelineRun {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let mut events = EventSink::new(tx);
        let mut mode = None;

        tracing::info!(run_id = %run_id, session = %key, "Pipeline run started");

        let ctx = TaskContext::new(run_id, self.client.clone(), cancel);
        let result = self
            .execute(&ctx, user_text, store, key, &mut events, &mut mode)
            .await;

        let outcome = match result {
            Ok((final_mode, chain)) => {
                events
                    .emit(PipelineEvent::complete(final_mode, chain.artifact.clone()))
                    .await;
                Ok(chain.artifact)
            }
            Err(err) => {
                events.emit(PipelineEvent::error(&err)).await;
                Err(err)
            }
        };

        let duration = started.elapsed();
        let run = PipelineRun {
            run_id,
            session: key.clone(),
            mode,
            events: events.into_events(),
            outcome,
            duration,
        };
        self.finish(&run);
        run
    }

    /// Spawns a run and returns its event stream plus a handle to the result.
    ///
    /// Dropping the stream cancels the run; nothing is saved in that case.
    pub fn stream(
        self: &Arc<Self>,
        user_text: impl Into<String>,
        store: Arc<dyn SessionStore>,
        key: SessionKey,
        cancel: CancellationToken,
    ) -> (ReceiverStream<PipelineEvent>, JoinHandle<PipelineRun>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let orchestrator = Arc::clone(self);
        let user_text = user_text.into();
        let run_cancel = cancel.child_token();
        let handle = tokio::spawn(async move {
            let run = orchestrator.run(
                &user_text,
                store.as_ref(),
                &key,
                Some(tx.clone()),
                run_cancel.clone(),
            );
            tokio::pin!(run);
            tokio::select! {
                biased;
                _ = tx.closed() => {
                    tracing::info!(session = %key, "Event listener disconnected, cancelling run");
                    run_cancel.cancel();
                }
                run = &mut run => return run,
            }
            run.await
        });
        (ReceiverStream::new(rx), handle)
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        user_text: &str,
        store: &dyn SessionStore,
        key: &SessionKey,
        events: &mut EventSink,
        mode_slot: &mut Option<Mode>,
    ) -> PipelineResult<(Mode, ChainResult)> {
        let state = store.get(key).await?.unwrap_or_default();

        events
            .emit(PipelineEvent::status("safety", "Running safety pre-check..."))
            .await;
        let screened = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(PipelineError::cancelled("safety")),
            screened = self.safety.screen(user_text) => screened?,
        };
        events
            .emit(PipelineEvent::status("safety", "Safety pre-check passed"))
            .await;

        events
            .emit(PipelineEvent::status("router", "Analyzing request..."))
            .await;
        let decision = self.route(ctx, &screened, &state, events).await?;
        let mode = match decision.mode {
            Mode::Edit if !state.has_draft() => {
                tracing::warn!(run_id = %ctx.run_id, "Edit requested without a story, creating one instead");
                Mode::Create
            }
            mode => mode,
        };
        *mode_slot = Some(mode);
        events
            .emit(PipelineEvent::status("router", format!("Mode determined: {}", mode)))
            .await;
        tracing::info!(run_id = %ctx.run_id, mode = %mode, "Mode determined");

        let chain = match mode {
            Mode::Create => self.create(ctx, state, &screened, events).await?,
            Mode::Edit => self.edit(ctx, state, &screened, events).await?,
            Mode::Question => self.question(ctx, state, &screened, events).await?,
        };

        if ctx.cancel.is_cancelled() {
            return Err(PipelineError::cancelled("save"));
        }
        if let Some(state) = &chain.save {
            store.put(key, state.clone()).await?;
        }
        Ok((mode, chain))
    }

    /// Classifies the request, falling back to QUESTION when the router
    /// output cannot be mapped to a mode.
    async fn route(
        &self,
        ctx: &TaskContext,
        screened: &ScreenedText,
        state: &SessionState,
        events: &mut EventSink,
    ) -> PipelineResult<RoutingDecision> {
        match self.router.classify(screened, &state.summary(), ctx).await {
            Ok(decision) => Ok(decision),
            Err(PipelineError::Classification { reason }) => {
                tracing::warn!(run_id = %ctx.run_id, reason = %reason, "Classification failed, falling back to QUESTION");
                events
                    .emit(PipelineEvent::status(
                        "router",
                        "Could not classify request, treating it as a question",
                    ))
                    .await;
                Ok(RoutingDecision {
                    mode: Mode::Question,
                    confidence: None,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// intent → {world, character, plot} → draft → refinement.
    async fn create(
        &self,
        ctx: &TaskContext,
        state: SessionState,
        screened: &ScreenedText,
        events: &mut EventSink,
    ) -> PipelineResult<ChainResult> {
        let intent = SequentialStage::single(self.catalogue.intent_extraction.clone());
        let output = intent.run(ctx, state, Some(screened), SEQ_INTENT).await?;
        events
            .emit(PipelineEvent::status(intent.name(), "Request analyzed"))
            .await;
        let mut state = output.state;

        let results = self.planning.run(ctx, &state).await?;
        self.planning
            .commit(results, &mut state, ctx.run_id, SEQ_PLANNING)?;
        events
            .emit(PipelineEvent::status(
                self.planning.name(),
                "World, characters and plot designed",
            ))
            .await;

        let writer = SequentialStage::single(self.catalogue.story_writer.clone());
        let output = writer.run(ctx, state, None, SEQ_WRITER).await?;
        let draft = output
            .last()
            .cloned()
            .ok_or_else(|| PipelineError::InvalidStage("story writer produced nothing".to_string()))?;
        let story = draft.as_story().cloned().ok_or_else(|| {
            PipelineError::InvalidStage(format!(
                "task '{}' returned {} instead of a story",
                self.catalogue.story_writer.name(),
                draft.kind()
            ))
        })?;
        events.emit(PipelineEvent::draft(story)).await;
        let state = output.state;

        if !self.config.enable_refinement {
            return Ok(ChainResult {
                artifact: draft,
                save: Some(state),
            });
        }

        let outcome = self
            .refinement
            .run(ctx, state, SEQ_REFINEMENT, events)
            .await?;
        events
            .emit(PipelineEvent::status(
                "refinement",
                format!(
                    "Refinement finished: {} after {} revision(s)",
                    outcome.final_state, outcome.revisions
                ),
            ))
            .await;

        Ok(ChainResult {
            artifact: outcome.artifact,
            save: Some(outcome.state),
        })
    }

    async fn edit(
        &self,
        ctx: &TaskContext,
        state: SessionState,
        screened: &ScreenedText,
        events: &mut EventSink,
    ) -> PipelineResult<ChainResult> {
        let stage = SequentialStage::single(self.catalogue.story_editor.clone());
        let output = stage.run(ctx, state, Some(screened), SEQ_SINGLE).await?;
        let artifact = output
            .last()
            .cloned()
            .ok_or_else(|| PipelineError::InvalidStage("story editor produced nothing".to_string()))?;
        if let Some(story) = artifact.as_story() {
            events.emit(PipelineEvent::edited(story.clone())).await;
        }
        Ok(ChainResult {
            artifact,
            save: Some(output.state),
        })
    }

    /// Answers never touch the stored session.
    async fn question(
        &self,
        ctx: &TaskContext,
        state: SessionState,
        screened: &ScreenedText,
        events: &mut EventSink,
    ) -> PipelineResult<ChainResult> {
        let stage = SequentialStage::single(self.catalogue.story_guide.clone());
        let output = stage.run(ctx, state, Some(screened), SEQ_SINGLE).await?;
        let artifact = output
            .into_last()
            .ok_or_else(|| PipelineError::InvalidStage("story guide produced nothing".to_string()))?;
        if let Some(answer) = artifact.as_answer() {
            events.emit(PipelineEvent::answer(answer.clone())).await;
        }
        Ok(ChainResult {
            artifact,
            save: None,
        })
    }

    fn finish(&self, run: &PipelineRun) {
        let status = run.status();
        let mode_label = run.mode.map(|mode| mode.as_str()).unwrap_or("UNROUTED");
        self.metrics
            .record_run(mode_label, &status.to_string(), run.duration.as_secs_f64());
        if let Ok(mut stats) = self.stats.lock() {
            stats.record(status, run.duration);
        }

        match &run.outcome {
            Ok(_) => tracing::info!(
                run_id = %run.run_id,
                mode = mode_label,
                duration_ms = run.duration.as_millis() as u64,
                "Pipeline run completed"
            ),
            Err(err) => tracing::warn!(
                run_id = %run.run_id,
                mode = mode_label,
                kind = %err.kind(),
                error = %err,
                "Pipeline run failed"
            ),
        }
    }
}

// ============================================================================
// Builder Pattern
// ============================================================================

/// Builder for creating a PipelineOrchestrator with fluent API.
pub struct PipelineOrchestratorBuilder {
    capability: Option<Arc<dyn GenerationCapability>>,
    moderation: Option<Arc<dyn ModerationCapability>>,
    config: PipelineConfig,
    catalogue: TaskCatalogue,
    metrics: Option<PipelineMetrics>,
}

impl PipelineOrchestratorBuilder {
    /// Creates a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            capability: None,
            moderation: None,
            config: PipelineConfig::default(),
            catalogue: TaskCatalogue::default(),
            metrics: None,
        }
    }

    /// Sets the generation capability.
    pub fn capability(mut self, capability: Arc<dyn GenerationCapability>) -> Self {
        self.capability = Some(capability);
        self
    }

    /// Sets the moderation capability.
    pub fn moderation(mut self, moderation: Arc<dyn ModerationCapability>) -> Self {
        self.moderation = Some(moderation);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the task set.
    pub fn catalogue(mut self, catalogue: TaskCatalogue) -> Self {
        self.catalogue = catalogue;
        self
    }

    /// Shares an existing metric set instead of creating one.
    pub fn metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds the PipelineOrchestrator.
    ///
    /// # Errors
    ///
    /// - `Config` if a capability is missing or the configuration is invalid
    /// - `InvalidStage` if the catalogue's planning tasks are not independent
    pub fn build(self) -> PipelineResult<PipelineOrchestrator> {
        let capability = self.capability.ok_or_else(|| {
            ConfigError::ValidationFailed("generation capability is required".to_string())
        })?;
        let moderation = self.moderation.ok_or_else(|| {
            ConfigError::ValidationFailed("moderation capability is required".to_string())
        })?;
        self.config.validate()?;

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => PipelineMetrics::new().map_err(ConfigError::from)?,
        };

        let client = GenerationClient::new(capability, self.config.retry_policy())
            .with_metrics(metrics.clone());
        let safety = SafetyGate::new(
            moderation,
            self.config.toxicity_threshold,
            self.config.fail_open_on_moderation_unavailable,
        )
        .with_metrics(metrics.clone());
        let router = Router::new(self.catalogue.router.clone())
            .with_new_session_shortcut(self.config.route_new_sessions_to_create);
        let planning = FanOutStage::new(
            "planning",
            vec![
                self.catalogue.worldbuilder.clone(),
                self.catalogue.character_forge.clone(),
                self.catalogue.plot_architect.clone(),
            ],
        )?;
        let refinement = RefinementLoop::new(
            self.catalogue.quality_critic.clone(),
            self.catalogue.story_refiner.clone(),
            self.config.max_refinement_iterations,
        )?
        .with_metrics(metrics.clone());

        Ok(PipelineOrchestrator {
            config: self.config,
            client,
            safety,
            router,
            catalogue: self.catalogue,
            planning,
            refinement,
            metrics,
            stats: Mutex::new(PipelineStats::new()),
        })
    }
}

impl Default for PipelineOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LlmError, ModerationError};
    use crate::llm::GenerationCall;
    use crate::pipeline::error::ErrorKind;
    use crate::session::InMemorySessionStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct NoGeneration;

    #[async_trait]
    impl GenerationCapability for NoGeneration {
        async fn generate(&self, call: &GenerationCall) -> Result<Value, LlmError> {
            match call.task_name.as_str() {
                "story_guide" => Ok(json!({"text": "There is no story yet."})),
                other => Err(LlmError::ApiError {
                    code: 400,
                    message: format!("unexpected task {}", other),
                }),
            }
        }
    }

    struct Score(f64);

    #[async_trait]
    impl ModerationCapability for Score {
        async fn score(&self, _text: &str) -> Result<f64, ModerationError> {
            Ok(self.0)
        }
    }

    fn orchestrator(score: f64, config: PipelineConfig) -> PipelineOrchestrator {
        PipelineOrchestrator::builder()
            .capability(Arc::new(NoGeneration))
            .moderation(Arc::new(Score(score)))
            .config(config)
            .build()
            .expect("orchestrator")
    }

    #[test]
    fn test_builder_requires_capabilities() {
        let err = PipelineOrchestrator::builder()
            .moderation(Arc::new(Score(0.0)))
            .build()
            .err()
            .expect("missing capability");
        assert_eq!(err.kind(), ErrorKind::Config);

        let err = PipelineOrchestrator::builder()
            .capability(Arc::new(NoGeneration))
            .moderation(Arc::new(Score(0.0)))
            .config(PipelineConfig::default().with_toxicity_threshold(1.5))
            .build()
            .err()
            .expect("invalid threshold");
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_router_transport_failure_is_not_masked() {
        let config = PipelineConfig::default().with_route_new_sessions_to_create(false);
        let orchestrator = orchestrator(0.0, config);
        let store = InMemorySessionStore::new();
        let key = SessionKey::new("u1", "s1");

        // A terminal router error is not a classification error, so no fallback.
        let run = orchestrator
            .run("hello?", &store, &key, None, CancellationToken::new())
            .await;
        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.error().map(|e| e.kind()), Some(ErrorKind::Terminal));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let orchestrator = orchestrator(0.0, PipelineConfig::default());
        let store = InMemorySessionStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let run = orchestrator
            .run("a story", &store, &SessionKey::new("u", "s"), None, cancel)
            .await;
        assert_eq!(run.status(), RunStatus::Cancelled);
        assert_eq!(run.events.last().map(|e| e.event_type()), Some("error"));
        assert_eq!(orchestrator.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn test_blocked_run_records_metrics() {
        let orchestrator = orchestrator(0.95, PipelineConfig::default());
        let store = InMemorySessionStore::new();
        let run = orchestrator
            .run("nasty", &store, &SessionKey::new("u", "s"), None, CancellationToken::new())
            .await;
        assert_eq!(run.error().map(|e| e.kind()), Some(ErrorKind::SafetyViolation));
        assert_eq!(run.mode, None);
        assert_eq!(orchestrator.metrics().runs("UNROUTED", "failed"), 1);
        assert_eq!(orchestrator.stats().failed, 1);
    }

    #[test]
    fn test_stats_average() {
        let mut stats = PipelineStats::new();
        stats.record(RunStatus::Completed, Duration::from_secs(2));
        stats.record(RunStatus::Failed, Duration::from_secs(4));
        assert_eq!(stats.total_runs, 2);
        assert_eq!(stats.average_duration, Duration::from_secs(3));
    }
}
