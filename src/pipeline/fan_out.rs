//! Concurrent execution of independent generation tasks.
//!
//! All tasks start together against projections of the same session
//! snapshot. The join is fail-fast and all-or-nothing: the first failure
//! cancels the remaining tasks and the stage reports one aggregate error.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::{JoinError, JoinSet};
use uuid::Uuid;

use super::error::{PipelineError, PipelineResult};
use crate::agents::{project_for, GenerationTask, TaskContext, TaskInput};
use crate::artifacts::Artifact;
use crate::session::{SessionState, StageStamp};

/// Artifacts produced by a fan-out, keyed by task name.
pub type FanOutResults = BTreeMap<String, Artifact>;

/// A set of tasks that do not depend on each other.
#[derive(Clone)]
pub struct FanOutStage {
    name: String,
    tasks: Vec<Arc<dyn GenerationTask>>,
}

impl std::fmt::Debug for FanOutStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutStage")
            .field("name", &self.name)
            .field("tasks", &self.task_names())
            .finish()
    }
}

impl FanOutStage {
    /// Builds the stage, checking that the tasks are independent.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStage` if the set is empty, if two tasks share a name
    /// or an output key, or if any task reads a key another task writes.
    pub fn new(name: impl Into<String>, tasks: Vec<Arc<dyn GenerationTask>>) -> PipelineResult<Self> {
        let name = name.into();
        if tasks.is_empty() {
            return Err(PipelineError::InvalidStage(format!(
                "fan-out '{}' has no tasks",
                name
            )));
        }

        let mut names = HashSet::new();
        let mut writers: BTreeMap<&'static str, &str> = BTreeMap::new();
        for task in &tasks {
            if !names.insert(task.name()) {
                return Err(PipelineError::InvalidStage(format!(
                    "fan-out '{}' contains task '{}' twice",
                    name,
                    task.name()
                )));
            }
            if let Some(key) = task.writes() {
                if let Some(previous) = writers.insert(key, task.name()) {
                    return Err(PipelineError::InvalidStage(format!(
                        "tasks '{}' and '{}' both write '{}'",
                        previous,
                        task.name(),
                        key
                    )));
                }
            }
        }

        for task in &tasks {
            for key in task.reads().iter().chain(task.optional_reads()) {
                if let Some(writer) = writers.get(key) {
                    if *writer != task.name() {
                        return Err(PipelineError::InvalidStage(format!(
                            "task '{}' reads '{}' written by '{}' in the same fan-out",
                            task.name(),
                            key,
                            writer
                        )));
                    }
                }
            }
        }

        Ok(Self { name, tasks })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|task| task.name()).collect()
    }

    pub fn tasks(&self) -> &[Arc<dyn GenerationTask>] {
        &self.tasks
    }

    /// Runs every task concurrently against `state`.
    ///
    /// Each task gets a child cancellation token of `ctx`, so cancelling the
    /// run reaches every in-flight task. On the first failure the remaining
    /// tasks are cancelled and aborted and no partial results are returned.
    pub async fn run(&self, ctx: &TaskContext, state: &SessionState) -> PipelineResult<FanOutResults> {
        let mut inputs = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let projection = project_for(task.as_ref(), state)?;
            inputs.push((task.clone(), TaskInput::new(projection)));
        }

        let stage_ctx = ctx.child();
        let mut pending: BTreeSet<String> =
            self.tasks.iter().map(|task| task.name().to_string()).collect();
        let mut join_set = JoinSet::new();

        tracing::debug!(run_id = %ctx.run_id, stage = %self.name, tasks = self.tasks.len(), "Starting fan-out");

        for (task, input) in inputs {
            let task_ctx = stage_ctx.child();
            join_set.spawn(async move {
                let name = task.name().to_string();
                let outcome = AssertUnwindSafe(task.invoke(&task_ctx, input))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(PipelineError::InvalidStage(format!("task '{}' panicked", name)))
                    });
                (name, outcome)
            });
        }

        let mut results = FanOutResults::new();
        while let Some(joined) = join_set.join_next().await {
            let (name, outcome) = match self.joined(joined) {
                Ok(pair) => pair,
                Err(err) => {
                    stage_ctx.cancel.cancel();
                    join_set.abort_all();
                    return Err(err);
                }
            };
            pending.remove(&name);

            match outcome {
                Ok(artifact) => {
                    tracing::debug!(run_id = %ctx.run_id, stage = %self.name, task = %name, "Fan-out task completed");
                    results.insert(name, artifact);
                }
                // The run itself was cancelled: siblings stop for the same reason.
                Err(_) if ctx.cancel.is_cancelled() => {
                    join_set.abort_all();
                    tracing::info!(run_id = %ctx.run_id, stage = %self.name, "Fan-out cancelled");
                    return Err(PipelineError::cancelled(self.name.as_str()));
                }
                Err(source) => {
                    stage_ctx.cancel.cancel();
                    join_set.abort_all();
                    let cancelled: Vec<String> = pending.into_iter().collect();
                    tracing::warn!(
                        run_id = %ctx.run_id,
                        stage = %self.name,
                        task = %name,
                        cancelled = ?cancelled,
                        error = %source,
                        "Fan-out task failed, cancelling siblings"
                    );
                    return Err(PipelineError::FanOutAggregate {
                        failed_task: name,
                        source: Box::new(source),
                        cancelled,
                    });
                }
            }
        }

        Ok(results)
    }

    /// Unwraps one joined task. Panics are caught inside the task, so a
    /// join error means the task was aborted and its artifact is lost.
    fn joined(
        &self,
        joined: Result<(String, PipelineResult<Artifact>), JoinError>,
    ) -> PipelineResult<(String, PipelineResult<Artifact>)> {
        joined.map_err(|join_err| {
            tracing::error!(stage = %self.name, error = %join_err, "Fan-out task failed to join");
            PipelineError::InvalidStage(format!(
                "fan-out '{}' lost a task: {}",
                self.name, join_err
            ))
        })
    }

    /// Commits every result under its task's output key.
    pub fn commit(
        &self,
        results: FanOutResults,
        state: &mut SessionState,
        run_id: Uuid,
        seq: u32,
    ) -> PipelineResult<()> {
        for task in &self.tasks {
            let (Some(key), Some(artifact)) = (task.writes(), results.get(task.name())) else {
                continue;
            };
            state.commit(key, artifact.clone(), StageStamp::new(run_id, seq, task.name()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{catalogue, PromptTask};
    use crate::artifacts::{ArtifactKind, UserIntent};
    use crate::error::LlmError;
    use crate::llm::{GenerationCall, GenerationCapability, GenerationClient, RetryPolicy};
    use crate::pipeline::error::ErrorKind;
    use crate::session::keys;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Answers per task name; `plot_architect` can be made to fail and
    /// `character_forge` to hang until cancelled.
    struct PlanningCapability {
        fail_plot: bool,
        hang_characters: bool,
        cancelled_observed: Arc<AtomicUsize>,
    }

    struct DropFlag(Arc<AtomicUsize>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl GenerationCapability for PlanningCapability {
        async fn generate(&self, call: &GenerationCall) -> Result<Value, LlmError> {
            match call.task_name.as_str() {
                "worldbuilder" => Ok(json!({
                    "name": "Nebula Reach",
                    "description": "A drifting station at the edge of a gas cloud.",
                    "rules": ["Gravity is gentle"],
                    "locations": ["Hydroponics deck"],
                    "aesthetic": "Soft violet light and brushed steel"
                })),
                "character_forge" if self.hang_characters => {
                    let _flag = DropFlag(self.cancelled_observed.clone());
                    std::future::pending::<Result<Value, LlmError>>().await
                }
                "character_forge" => Ok(json!({"characters": [{
                    "name": "Mira", "species": "human", "role": "protagonist",
                    "physical_traits": [], "personality_traits": ["curious"],
                    "strengths": [], "weaknesses": [],
                    "motivations": "find the signal", "goals": "get home"
                }]})),
                "plot_architect" if self.fail_plot => Err(LlmError::PolicyViolation("refused".to_string())),
                "plot_architect" => Ok(json!({
                    "setup": "Mira hears a strange signal.",
                    "conflict": "The station drifts off course.",
                    "rising_action": ["She follows the signal"],
                    "climax": "She reroutes the engines.",
                    "resolution": "The station finds home.",
                    "themes": ["courage"]
                })),
                other => Err(LlmError::ApiError { code: 404, message: other.to_string() }),
            }
        }
    }

    fn context(capability: PlanningCapability) -> TaskContext {
        let client = GenerationClient::new(Arc::new(capability), RetryPolicy::default());
        TaskContext::new(Uuid::new_v4(), client, CancellationToken::new())
    }

    fn state_with_intent() -> SessionState {
        let mut state = SessionState::new();
        let intent = Artifact::Intent(UserIntent {
            age: 10,
            themes: vec!["space".to_string()],
            tone: "exciting".to_string(),
            genre: "sci-fi".to_string(),
            length_minutes: 10,
            safety_constraints: None,
        });
        state
            .commit(keys::INTENT, intent, StageStamp::new(Uuid::new_v4(), 0, "intent_extraction"))
            .expect("commit intent");
        state
    }

    fn planning_stage() -> FanOutStage {
        FanOutStage::new(
            "planning",
            vec![
                catalogue::worldbuilder(),
                catalogue::character_forge(),
                catalogue::plot_architect(),
            ],
        )
        .expect("independent tasks")
    }

    #[tokio::test]
    async fn test_fan_out_joins_all() {
        let ctx = context(PlanningCapability {
            fail_plot: false,
            hang_characters: false,
            cancelled_observed: Arc::new(AtomicUsize::new(0)),
        });
        let stage = planning_stage();
        let mut state = state_with_intent();

        let results = stage.run(&ctx, &state).await.expect("all succeed");
        assert_eq!(results.len(), 3);

        stage.commit(results, &mut state, ctx.run_id, 1).expect("commit");
        assert!(state.contains(keys::WORLD));
        assert!(state.contains(keys::CHARACTER));
        assert!(state.contains(keys::PLOT));
    }

    #[tokio::test]
    async fn test_single_failure_is_aggregate_without_partial_results() {
        let observed = Arc::new(AtomicUsize::new(0));
        let ctx = context(PlanningCapability {
            fail_plot: true,
            hang_characters: true,
            cancelled_observed: observed.clone(),
        });
        let state = state_with_intent();

        let err = tokio::time::timeout(Duration::from_secs(5), planning_stage().run(&ctx, &state))
            .await
            .expect("fan-out must not wait for the hung sibling")
            .expect_err("plot fails");

        match &err {
            PipelineError::FanOutAggregate {
                failed_task,
                source,
                cancelled,
            } => {
                assert_eq!(failed_task, "plot_architect");
                assert_eq!(source.kind(), ErrorKind::Terminal);
                assert!(cancelled.contains(&"character_forge".to_string()));
            }
            other => panic!("unexpected error {:?}", other),
        }

        for _ in 0..100 {
            if observed.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(observed.load(Ordering::SeqCst), 1, "hung task must be dropped");
    }

    #[tokio::test]
    async fn test_run_cancellation_is_not_reported_as_task_failure() {
        let ctx = context(PlanningCapability {
            fail_plot: false,
            hang_characters: true,
            cancelled_observed: Arc::new(AtomicUsize::new(0)),
        });
        let state = state_with_intent();
        let trigger = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(5), planning_stage().run(&ctx, &state))
            .await
            .expect("cancellation reaches the hung task")
            .expect_err("cancelled");

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(matches!(err, PipelineError::Cancelled { ref stage } if stage == "planning"));
    }

    #[tokio::test]
    async fn test_lost_task_fails_the_stage() {
        let handle = tokio::spawn(std::future::pending::<(String, PipelineResult<Artifact>)>());
        handle.abort();
        let join_err = handle.await.expect_err("aborted");

        let err = planning_stage()
            .joined(Err(join_err))
            .expect_err("lost task is an error");
        assert_eq!(err.kind(), ErrorKind::InvalidStage);
    }

    #[tokio::test]
    async fn test_rejects_dependent_tasks() {
        let writer = PromptTask::new("writer", "", ArtifactKind::Story)
            .writing(keys::DRAFT)
            .into_arc();
        let critic = PromptTask::new("critic", "", ArtifactKind::Critique)
            .reading(&[keys::DRAFT])
            .into_arc();
        let err = FanOutStage::new("bad", vec![writer, critic]).expect_err("dependent");
        assert_eq!(err.kind(), ErrorKind::InvalidStage);
    }

    #[tokio::test]
    async fn test_rejects_duplicate_writes() {
        let a = PromptTask::new("a", "", ArtifactKind::World).writing(keys::WORLD).into_arc();
        let b = PromptTask::new("b", "", ArtifactKind::World).writing(keys::WORLD).into_arc();
        assert!(FanOutStage::new("dup", vec![a, b]).is_err());
        assert!(FanOutStage::new("empty", Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_missing_input_fails_before_start() {
        let ctx = context(PlanningCapability {
            fail_plot: false,
            hang_characters: false,
            cancelled_observed: Arc::new(AtomicUsize::new(0)),
        });
        let err = planning_stage()
            .run(&ctx, &SessionState::new())
            .await
            .expect_err("intent missing");
        assert_eq!(err.kind(), ErrorKind::Session);
    }
}
