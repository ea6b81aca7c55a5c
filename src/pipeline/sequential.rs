//! Ordered execution of generation tasks over an accumulating session.

use std::fmt;
use std::sync::Arc;

use super::error::PipelineError;
use super::safety::ScreenedText;
use crate::agents::{project_for, GenerationTask, TaskContext, TaskInput};
use crate::artifacts::Artifact;
use crate::session::{SessionState, StageStamp};

/// Result of a completed sequential stage.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub state: SessionState,
    /// Every task's artifact in execution order, stored or not.
    pub outputs: Vec<(String, Artifact)>,
}

impl StageOutput {
    pub fn last(&self) -> Option<&Artifact> {
        self.outputs.last().map(|(_, artifact)| artifact)
    }

    pub fn into_last(self) -> Option<Artifact> {
        self.outputs.into_iter().last().map(|(_, artifact)| artifact)
    }
}

/// A failed stage with the state accumulated before the failure.
///
/// `partial` is for diagnostics only. The run that produced it has failed.
#[derive(Debug)]
pub struct SequentialFailure {
    pub error: PipelineError,
    pub partial: SessionState,
    pub completed: Vec<String>,
}

impl fmt::Display for SequentialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (after {} completed task(s))",
            self.error,
            self.completed.len()
        )
    }
}

impl From<SequentialFailure> for PipelineError {
    fn from(failure: SequentialFailure) -> Self {
        failure.error
    }
}

/// An ordered chain of tasks. Task `i + 1` may read anything tasks `1..=i` wrote.
#[derive(Clone)]
pub struct SequentialStage {
    name: String,
    tasks: Vec<Arc<dyn GenerationTask>>,
}

impl fmt::Debug for SequentialStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.tasks.iter().map(|task| task.name()).collect();
        f.debug_struct("SequentialStage")
            .field("name", &self.name)
            .field("tasks", &names)
            .finish()
    }
}

impl SequentialStage {
    pub fn new(name: impl Into<String>, tasks: Vec<Arc<dyn GenerationTask>>) -> Self {
        Self {
            name: name.into(),
            tasks,
        }
    }

    /// Single-task stage named after its task.
    pub fn single(task: Arc<dyn GenerationTask>) -> Self {
        Self::new(task.name().to_string(), vec![task])
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Runs the tasks in order, committing each output before the next task
    /// builds its projection. Writes are stamped with `seq`.
    ///
    /// Stops at the first failure and hands back the partial state.
    pub async fn run(
        &self,
        ctx: &TaskContext,
        mut state: SessionState,
        user_text: Option<&ScreenedText>,
        seq: u32,
    ) -> Result<StageOutput, SequentialFailure> {
        let mut outputs: Vec<(String, Artifact)> = Vec::with_capacity(self.tasks.len());

        for task in &self.tasks {
            if ctx.cancel.is_cancelled() {
                return Err(self.failure(PipelineError::cancelled(task.name()), state, &outputs));
            }

            let projection = match project_for(task.as_ref(), &state) {
                Ok(projection) => projection,
                Err(err) => return Err(self.failure(err.into(), state, &outputs)),
            };

            let mut input = TaskInput::new(projection);
            if task.consumes_user_text() {
                match user_text {
                    Some(text) => input = input.with_user_text(text.as_str()),
                    None => {
                        let err = PipelineError::InvalidStage(format!(
                            "task '{}' needs screened user text",
                            task.name()
                        ));
                        return Err(self.failure(err, state, &outputs));
                    }
                }
            }

            let artifact = match task.invoke(ctx, input).await {
                Ok(artifact) => artifact,
                Err(err) => {
                    tracing::warn!(run_id = %ctx.run_id, stage = %self.name, task = task.name(), error = %err, "Sequential task failed");
                    return Err(self.failure(err, state, &outputs));
                }
            };

            if let Some(key) = task.writes() {
                let stamp = StageStamp::new(ctx.run_id, seq, task.name());
                if let Err(err) = state.commit(key, artifact.clone(), stamp) {
                    return Err(self.failure(err.into(), state, &outputs));
                }
            }
            tracing::debug!(run_id = %ctx.run_id, stage = %self.name, task = task.name(), "Sequential task completed");
            outputs.push((task.name().to_string(), artifact));
        }

        Ok(StageOutput { state, outputs })
    }

    fn failure(
        &self,
        error: PipelineError,
        partial: SessionState,
        outputs: &[(String, Artifact)],
    ) -> SequentialFailure {
        SequentialFailure {
            error,
            partial,
            completed: outputs.iter().map(|(name, _)| name.clone()).collect(),
        }
    }
}
