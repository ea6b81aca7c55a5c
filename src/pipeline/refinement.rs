//! Bounded critique and revision loop.
//!
//! ```text
//!              critique == APPROVED
//! ITERATING ──────────────────────────▶ APPROVED
//!    │  ▲
//!    │  │ REVISE, revisions < max: revise, revisions += 1
//!    └──┘
//!    │ REVISE, revisions == max
//!    ├────────────────────────────────▶ EXHAUSTED
//!    │ any task error
//!    └────────────────────────────────▶ FAILED
//! ```
//!
//! Approval is read from the critique's structured verdict only. Feedback
//! text that quotes the approval marker never ends the loop.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{PipelineError, PipelineResult};
use super::events::{EventSink, PipelineEvent};
use crate::agents::{project_for, GenerationTask, TaskContext, TaskInput};
use crate::artifacts::{Artifact, Critique, Verdict};
use crate::metrics::PipelineMetrics;
use crate::session::{keys, SessionState, StageStamp};

/// States of the refinement loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopState {
    Iterating,
    Approved,
    Exhausted,
    Failed,
}

impl LoopState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LoopState::Iterating)
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Iterating => "ITERATING",
            LoopState::Approved => "APPROVED",
            LoopState::Exhausted => "EXHAUSTED",
            LoopState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// A loop that ended in `APPROVED` or `EXHAUSTED`.
#[derive(Debug, Clone)]
pub struct RefinementOutcome {
    pub final_state: LoopState,
    /// The current artifact when the loop stopped.
    pub artifact: Artifact,
    /// Number of revisions performed.
    pub revisions: u32,
    /// Session with the last revision committed.
    pub state: SessionState,
}

/// Alternates a critic and a reviser over one session artifact.
#[derive(Clone)]
pub struct RefinementLoop {
    critic: Arc<dyn GenerationTask>,
    reviser: Arc<dyn GenerationTask>,
    max_iterations: u32,
    artifact_key: &'static str,
    metrics: Option<PipelineMetrics>,
}

impl RefinementLoop {
    /// # Errors
    ///
    /// Returns `InvalidStage` if the reviser does not write the refined key
    /// or the critic does not read it.
    pub fn new(
        critic: Arc<dyn GenerationTask>,
        reviser: Arc<dyn GenerationTask>,
        max_iterations: u32,
    ) -> PipelineResult<Self> {
        let artifact_key = keys::DRAFT;
        if reviser.writes() != Some(artifact_key) {
            return Err(PipelineError::InvalidStage(format!(
                "reviser '{}' must write '{}'",
                reviser.name(),
                artifact_key
            )));
        }
        if !critic.reads().contains(&artifact_key) {
            return Err(PipelineError::InvalidStage(format!(
                "critic '{}' must read '{}'",
                critic.name(),
                artifact_key
            )));
        }
        Ok(Self {
            critic,
            reviser,
            max_iterations,
            artifact_key,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Runs the loop on the artifact currently stored under the draft key.
    ///
    /// Emits one `critique` event per critique and one `refined` event per
    /// revision. Revisions are committed with `seq`.
    ///
    /// # Errors
    ///
    /// Any task error moves the loop to `FAILED` and is returned as is. No
    /// artifact is returned in that case.
    pub async fn run(
        &self,
        ctx: &TaskContext,
        mut state: SessionState,
        seq: u32,
        events: &mut EventSink,
    ) -> PipelineResult<RefinementOutcome> {
        let mut current = state.read(self.artifact_key)?.clone();
        let mut revisions: u32 = 0;
        let mut loop_state = LoopState::Iterating;

        while !loop_state.is_terminal() {
            let iteration = revisions + 1;
            let critique = match self.critique(ctx, &state).await {
                Ok(critique) => critique,
                Err(err) => return Err(self.fail(ctx, revisions, err)),
            };
            events
                .emit(PipelineEvent::critique(iteration, critique.clone()))
                .await;

            let feedback = match (critique.verdict, critique.feedback) {
                (Verdict::Approved, _) => {
                    loop_state = LoopState::Approved;
                    continue;
                }
                (Verdict::Revise, _) if revisions >= self.max_iterations => {
                    loop_state = LoopState::Exhausted;
                    continue;
                }
                (Verdict::Revise, feedback) => feedback.unwrap_or_default(),
            };

            tracing::info!(
                run_id = %ctx.run_id,
                iteration = iteration,
                max_iterations = self.max_iterations,
                "Critique requested revision"
            );

            let revised = match self.revise(ctx, &state, feedback).await {
                Ok(revised) => revised,
                Err(err) => return Err(self.fail(ctx, revisions, err)),
            };
            let stamp = StageStamp::new(ctx.run_id, seq, self.reviser.name());
            state.commit(self.artifact_key, revised.clone(), stamp)?;
            revisions += 1;

            if let Some(story) = revised.as_story() {
                events
                    .emit(PipelineEvent::refined(revisions, story.clone()))
                    .await;
            }
            current = revised;
        }

        tracing::info!(
            run_id = %ctx.run_id,
            final_state = %loop_state,
            revisions = revisions,
            "Refinement finished"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_refinement_iterations(revisions);
        }

        Ok(RefinementOutcome {
            final_state: loop_state,
            artifact: current,
            revisions,
            state,
        })
    }

    async fn critique(&self, ctx: &TaskContext, state: &SessionState) -> PipelineResult<Critique> {
        let input = TaskInput::new(project_for(self.critic.as_ref(), state)?);
        let artifact = self.critic.invoke(ctx, input).await?;
        artifact.as_critique().cloned().ok_or_else(|| {
            PipelineError::InvalidStage(format!(
                "critic '{}' produced a {} artifact",
                self.critic.name(),
                artifact.kind()
            ))
        })
    }

    async fn revise(
        &self,
        ctx: &TaskContext,
        state: &SessionState,
        feedback: String,
    ) -> PipelineResult<Artifact> {
        let input = TaskInput::new(project_for(self.reviser.as_ref(), state)?)
            .with_extra("feedback", Value::String(feedback));
        self.reviser.invoke(ctx, input).await
    }

    fn fail(&self, ctx: &TaskContext, revisions: u32, err: PipelineError) -> PipelineError {
        tracing::warn!(
            run_id = %ctx.run_id,
            final_state = %LoopState::Failed,
            revisions = revisions,
            error = %err,
            "Refinement failed"
        );
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::catalogue;
    use crate::artifacts::Story;
    use crate::error::LlmError;
    use crate::llm::{GenerationCall, GenerationCapability, GenerationClient, RetryPolicy};
    use crate::pipeline::error::ErrorKind;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    /// Critic replies are scripted; the refiner numbers its revisions.
    struct LoopCapability {
        critiques: Mutex<Vec<Value>>,
        revisions: AtomicUsize,
        refiner_fails: bool,
    }

    impl LoopCapability {
        fn new(mut critiques: Vec<Value>) -> Self {
            critiques.reverse();
            Self {
                critiques: Mutex::new(critiques),
                revisions: AtomicUsize::new(0),
                refiner_fails: false,
            }
        }
    }

    fn story_value(title: &str) -> Value {
        json!({
            "title": title,
            "text": "Once upon a time a small robot learned to dream. ".repeat(4),
            "word_count": 60,
            "estimated_reading_time_minutes": 1,
            "tone": "gentle",
            "reading_level": "Early reader"
        })
    }

    #[async_trait]
    impl GenerationCapability for LoopCapability {
        async fn generate(&self, call: &GenerationCall) -> Result<Value, LlmError> {
            match call.task_name.as_str() {
                "quality_critic" => {
                    let mut critiques = self.critiques.lock().expect("lock poisoned");
                    Ok(critiques
                        .pop()
                        .unwrap_or_else(|| json!({"verdict": "REVISE", "feedback": "More"})))
                }
                "story_refiner" if self.refiner_fails => {
                    Err(LlmError::ParseError("no JSON object".to_string()))
                }
                "story_refiner" => {
                    assert!(call.input["feedback"].is_string());
                    let n = self.revisions.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(story_value(&format!("Revision {}", n)))
                }
                other => Err(LlmError::ApiError {
                    code: 404,
                    message: other.to_string(),
                }),
            }
        }
    }

    fn setup(capability: LoopCapability) -> (TaskContext, Arc<LoopCapability>, SessionState) {
        let capability = Arc::new(capability);
        let client = GenerationClient::new(capability.clone(), RetryPolicy::default());
        let ctx = TaskContext::new(Uuid::new_v4(), client, CancellationToken::new());

        let mut state = SessionState::new();
        let draft: Story = serde_json::from_value(story_value("First Draft")).expect("story");
        state
            .commit(keys::DRAFT, Artifact::Story(draft), StageStamp::new(ctx.run_id, 2, "story_writer"))
            .expect("commit draft");
        (ctx, capability, state)
    }

    fn refinement(max: u32) -> RefinementLoop {
        RefinementLoop::new(catalogue::quality_critic(), catalogue::story_refiner(), max)
            .expect("valid loop")
    }

    fn title(artifact: &Artifact) -> &str {
        artifact.as_story().map(|s| s.title.as_str()).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_approved_returns_current_artifact() {
        let (ctx, capability, state) = setup(LoopCapability::new(vec![
            json!({"verdict": "REVISE", "feedback": "Add dialogue"}),
            json!({"verdict": "APPROVED"}),
        ]));
        let mut events = EventSink::default();

        let outcome = refinement(3).run(&ctx, state, 3, &mut events).await.expect("approved");
        assert_eq!(outcome.final_state, LoopState::Approved);
        assert_eq!(outcome.revisions, 1);
        assert_eq!(title(&outcome.artifact), "Revision 1");
        assert_eq!(capability.revisions.load(Ordering::SeqCst), 1);

        let kinds: Vec<&str> = events.events().iter().map(|e| e.event_type()).collect();
        assert_eq!(kinds, vec!["critique", "refined", "critique"]);
    }

    #[tokio::test]
    async fn test_exhausted_returns_last_revision() {
        let (ctx, capability, state) = setup(LoopCapability::new(Vec::new()));
        let mut events = EventSink::default();

        let outcome = refinement(3).run(&ctx, state, 3, &mut events).await.expect("exhausted");
        assert_eq!(outcome.final_state, LoopState::Exhausted);
        assert_eq!(outcome.revisions, 3);
        assert_eq!(title(&outcome.artifact), "Revision 3");
        assert_eq!(
            outcome.state.draft().map(|s| s.title.as_str()),
            Some("Revision 3")
        );
        assert_eq!(capability.revisions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_quoted_marker_does_not_approve() {
        let (ctx, _, state) = setup(LoopCapability::new(vec![
            json!({"verdict": "REVISE", "feedback": "This is not APPROVED yet: the ending is rushed"}),
            json!({"verdict": "APPROVED"}),
        ]));
        let mut events = EventSink::default();

        let outcome = refinement(3).run(&ctx, state, 3, &mut events).await.expect("approved");
        assert_eq!(outcome.revisions, 1, "quoted marker must not end the loop");
    }

    #[tokio::test]
    async fn test_zero_iterations_critiques_once() {
        let (ctx, capability, state) = setup(LoopCapability::new(Vec::new()));
        let mut events = EventSink::default();

        let outcome = refinement(0).run(&ctx, state, 3, &mut events).await.expect("exhausted");
        assert_eq!(outcome.final_state, LoopState::Exhausted);
        assert_eq!(outcome.revisions, 0);
        assert_eq!(title(&outcome.artifact), "First Draft");
        assert_eq!(capability.revisions.load(Ordering::SeqCst), 0);
        assert_eq!(events.events().len(), 1);
    }

    #[tokio::test]
    async fn test_task_error_fails_loop() {
        let mut capability = LoopCapability::new(vec![json!({"verdict": "REVISE", "feedback": "x"})]);
        capability.refiner_fails = true;
        let (ctx, _, state) = setup(capability);
        let mut events = EventSink::default();

        let err = refinement(3)
            .run(&ctx, state, 3, &mut events)
            .await
            .expect_err("refiner fails");
        assert_eq!(err.kind(), ErrorKind::Terminal);
    }

    #[test]
    fn test_rejects_reviser_that_does_not_write_draft() {
        let result = RefinementLoop::new(catalogue::quality_critic(), catalogue::story_guide(), 3);
        assert!(result.is_err());
    }
}
