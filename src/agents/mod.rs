//! Generation tasks for the story pipeline.

pub mod catalogue;
pub mod prompts;
pub mod task;

pub use catalogue::TaskCatalogue;
pub use task::{
    project_for, Framing, GenerationTask, PromptTask, TaskContext, TaskInput,
};
