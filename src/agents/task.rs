//! The generation task abstraction shared by every pipeline stage.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::artifacts::{Artifact, ArtifactKind};
use crate::llm::{GenerationCall, GenerationClient};
use crate::pipeline::error::PipelineResult;
use crate::session::{keys, Projection, SessionState};

/// Per-run context handed to every task invocation.
#[derive(Clone)]
pub struct TaskContext {
    pub run_id: Uuid,
    pub client: GenerationClient,
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(run_id: Uuid, client: GenerationClient, cancel: CancellationToken) -> Self {
        Self {
            run_id,
            client,
            cancel,
        }
    }

    /// Same run and client with a child cancellation token.
    pub fn child(&self) -> Self {
        Self {
            run_id: self.run_id,
            client: self.client.clone(),
            cancel: self.cancel.child_token(),
        }
    }
}

/// Read-only input of one task invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskInput {
    /// Projection of the session keys the task declared.
    pub artifacts: Projection,
    /// Raw user text. Only set after the safety gate has passed it.
    pub user_text: Option<String>,
    /// Additional named inputs such as critique feedback.
    pub extra: Map<String, Value>,
}

impl TaskInput {
    pub fn new(artifacts: Projection) -> Self {
        Self {
            artifacts,
            ..Self::default()
        }
    }

    pub fn with_user_text(mut self, text: impl Into<String>) -> Self {
        self.user_text = Some(text.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Replaces one projected artifact.
    pub fn with_artifact(mut self, key: impl Into<String>, artifact: Artifact) -> Self {
        self.artifacts.insert(key.into(), artifact);
        self
    }

    pub fn artifact(&self, key: &str) -> Option<&Artifact> {
        self.artifacts.get(key)
    }
}

/// A named, schema-tagged unit of work.
///
/// Tasks never touch session state. They receive a projection and return a
/// new artifact; the enclosing stage commits it under [`GenerationTask::writes`].
#[async_trait]
pub trait GenerationTask: Send + Sync {
    fn name(&self) -> &str;

    /// Session keys that must exist before the task runs.
    fn reads(&self) -> &[&'static str];

    /// Session keys included in the projection when present.
    fn optional_reads(&self) -> &[&'static str] {
        &[]
    }

    /// Session key the output is committed to, if it is stored at all.
    fn writes(&self) -> Option<&'static str>;

    /// Schema of the produced artifact.
    fn output(&self) -> ArtifactKind;

    /// Whether the task sees raw user text and therefore needs a safety check first.
    fn consumes_user_text(&self) -> bool;

    async fn invoke(&self, ctx: &TaskContext, input: TaskInput) -> PipelineResult<Artifact>;
}

/// Builds the projection a task declared from the session.
pub fn project_for(
    task: &dyn GenerationTask,
    state: &SessionState,
) -> Result<Projection, crate::error::SessionError> {
    let mut projection = state.project(task.reads())?;
    for key in task.optional_reads() {
        if let Some(artifact) = state.artifact(key) {
            projection.insert((*key).to_string(), artifact.clone());
        }
    }
    Ok(projection)
}

/// How a [`PromptTask`] presents its input to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// JSON object of projected artifacts, `request` and extra inputs.
    Structured,
    /// `CURRENT STORY` followed by `EDIT REQUEST`.
    EditRequest,
    /// `STORY CONTEXT` followed by `QUESTION`.
    Question,
}

/// A task driven entirely by static instructions and a framing.
#[derive(Debug, Clone)]
pub struct PromptTask {
    pub name: &'static str,
    pub instructions: &'static str,
    pub reads: Vec<&'static str>,
    pub optional_reads: Vec<&'static str>,
    pub writes: Option<&'static str>,
    pub output: ArtifactKind,
    pub consumes_user_text: bool,
    pub framing: Framing,
}

impl PromptTask {
    pub fn new(name: &'static str, instructions: &'static str, output: ArtifactKind) -> Self {
        Self {
            name,
            instructions,
            reads: Vec::new(),
            optional_reads: Vec::new(),
            writes: None,
            output,
            consumes_user_text: false,
            framing: Framing::Structured,
        }
    }

    pub fn reading(mut self, keys: &[&'static str]) -> Self {
        self.reads = keys.to_vec();
        self
    }

    pub fn optionally_reading(mut self, keys: &[&'static str]) -> Self {
        self.optional_reads = keys.to_vec();
        self
    }

    pub fn writing(mut self, key: &'static str) -> Self {
        self.writes = Some(key);
        self
    }

    pub fn with_user_text(mut self) -> Self {
        self.consumes_user_text = true;
        self
    }

    pub fn framed(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn into_arc(self) -> Arc<dyn GenerationTask> {
        Arc::new(self)
    }

    /// Renders the model input for `input`.
    pub fn render(&self, input: &TaskInput) -> Value {
        let request = input.user_text.clone().unwrap_or_default();
        match self.framing {
            Framing::Structured => {
                let mut object = Map::new();
                for (key, artifact) in &input.artifacts {
                    object.insert(key.clone(), artifact.to_value());
                }
                if let Some(text) = &input.user_text {
                    object.insert("request".to_string(), Value::String(text.clone()));
                }
                for (key, value) in &input.extra {
                    object.insert(key.clone(), value.clone());
                }
                Value::Object(object)
            }
            Framing::EditRequest => Value::String(format!(
                "CURRENT STORY:\n{}\n\nEDIT REQUEST:\n{}",
                story_text(input),
                request
            )),
            Framing::Question => Value::String(format!(
                "STORY CONTEXT:\n{}\n\nQUESTION:\n{}",
                story_text(input),
                request
            )),
        }
    }
}

fn story_text(input: &TaskInput) -> String {
    match input.artifact(keys::DRAFT).and_then(Artifact::as_story) {
        Some(story) => format!("{}\n\n{}", story.title, story.text),
        None => "(no story has been written yet)".to_string(),
    }
}

#[async_trait]
impl GenerationTask for PromptTask {
    fn name(&self) -> &str {
        self.name
    }

    fn reads(&self) -> &[&'static str] {
        &self.reads
    }

    fn optional_reads(&self) -> &[&'static str] {
        &self.optional_reads
    }

    fn writes(&self) -> Option<&'static str> {
        self.writes
    }

    fn output(&self) -> ArtifactKind {
        self.output
    }

    fn consumes_user_text(&self) -> bool {
        self.consumes_user_text
    }

    async fn invoke(&self, ctx: &TaskContext, input: TaskInput) -> PipelineResult<Artifact> {
        let call = GenerationCall::new(self.name, self.instructions, self.render(&input), self.output);
        tracing::debug!(run_id = %ctx.run_id, task = self.name, output = %self.output, "Invoking generation task");
        ctx.client.invoke(&call, &ctx.cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::Story;
    use crate::session::StageStamp;

    fn draft() -> Artifact {
        Artifact::Story(Story {
            title: "The Brave Little Robot".to_string(),
            text: "Beep lived on a quiet moon. ".repeat(6),
            word_count: 60,
            estimated_reading_time_minutes: 1,
            tone: "warm".to_string(),
            reading_level: "Early reader".to_string(),
        })
    }

    #[test]
    fn test_edit_framing() {
        let task = PromptTask::new("story_editor", "", ArtifactKind::Story)
            .reading(&[keys::DRAFT])
            .framed(Framing::EditRequest);
        let input = TaskInput::default()
            .with_artifact(keys::DRAFT, draft())
            .with_user_text("make it funnier");

        let rendered = task.render(&input);
        let text = rendered.as_str().expect("string framing");
        assert!(text.starts_with("CURRENT STORY:\nThe Brave Little Robot"));
        assert!(text.ends_with("EDIT REQUEST:\nmake it funnier"));
    }

    #[test]
    fn test_question_framing_without_draft() {
        let task = PromptTask::new("story_guide", "", ArtifactKind::Answer).framed(Framing::Question);
        let input = TaskInput::default().with_user_text("who is the hero?");
        let rendered = task.render(&input);
        let text = rendered.as_str().expect("string framing");
        assert!(text.contains("STORY CONTEXT:\n(no story"));
        assert!(text.ends_with("QUESTION:\nwho is the hero?"));
    }

    #[test]
    fn test_structured_framing() {
        let task = PromptTask::new("story_refiner", "", ArtifactKind::Story);
        let input = TaskInput::default()
            .with_artifact(keys::DRAFT, draft())
            .with_extra("feedback", Value::String("More dialogue".to_string()));
        let rendered = task.render(&input);
        assert_eq!(rendered["draft"]["title"], "The Brave Little Robot");
        assert_eq!(rendered["feedback"], "More dialogue");
        assert!(rendered.get("request").is_none());
    }

    #[test]
    fn test_project_for_optional_reads() {
        let task = PromptTask::new("story_guide", "", ArtifactKind::Answer)
            .optionally_reading(&[keys::DRAFT]);
        let mut state = SessionState::new();
        assert!(project_for(&task, &state).expect("no required keys").is_empty());

        state
            .commit(keys::DRAFT, draft(), StageStamp::new(Uuid::new_v4(), 0, "writer"))
            .expect("commit");
        let projection = project_for(&task, &state).expect("projection");
        assert!(projection.contains_key(keys::DRAFT));

        let strict = PromptTask::new("x", "", ArtifactKind::Answer).reading(&[keys::PLOT]);
        assert!(project_for(&strict, &state).is_err());
    }
}
