//! The fixed set of story tasks.

use std::sync::Arc;

use super::prompts::*;
use super::task::{Framing, GenerationTask, PromptTask};
use crate::artifacts::ArtifactKind;
use crate::session::keys;

pub const INTENT_EXTRACTION: &str = "intent_extraction";
pub const WORLDBUILDER: &str = "worldbuilder";
pub const CHARACTER_FORGE: &str = "character_forge";
pub const PLOT_ARCHITECT: &str = "plot_architect";
pub const STORY_WRITER: &str = "story_writer";
pub const QUALITY_CRITIC: &str = "quality_critic";
pub const STORY_REFINER: &str = "story_refiner";
pub const STORY_EDITOR: &str = "story_editor";
pub const STORY_GUIDE: &str = "story_guide";
pub const ROUTER: &str = "router";

pub fn intent_extraction() -> Arc<dyn GenerationTask> {
    PromptTask::new(INTENT_EXTRACTION, INTENT_EXTRACTION_PROMPT, ArtifactKind::Intent)
        .writing(keys::INTENT)
        .with_user_text()
        .into_arc()
}

pub fn worldbuilder() -> Arc<dyn GenerationTask> {
    PromptTask::new(WORLDBUILDER, WORLDBUILDER_PROMPT, ArtifactKind::World)
        .reading(&[keys::INTENT])
        .writing(keys::WORLD)
        .into_arc()
}

pub fn character_forge() -> Arc<dyn GenerationTask> {
    PromptTask::new(CHARACTER_FORGE, CHARACTER_FORGE_PROMPT, ArtifactKind::Characters)
        .reading(&[keys::INTENT])
        .writing(keys::CHARACTER)
        .into_arc()
}

pub fn plot_architect() -> Arc<dyn GenerationTask> {
    PromptTask::new(PLOT_ARCHITECT, PLOT_ARCHITECT_PROMPT, ArtifactKind::Plot)
        .reading(&[keys::INTENT])
        .writing(keys::PLOT)
        .into_arc()
}

pub fn story_writer() -> Arc<dyn GenerationTask> {
    PromptTask::new(STORY_WRITER, STORY_WRITER_PROMPT, ArtifactKind::Story)
        .reading(&[keys::INTENT, keys::WORLD, keys::CHARACTER, keys::PLOT])
        .writing(keys::DRAFT)
        .into_arc()
}

pub fn quality_critic() -> Arc<dyn GenerationTask> {
    PromptTask::new(QUALITY_CRITIC, QUALITY_CRITIC_PROMPT, ArtifactKind::Critique)
        .reading(&[keys::DRAFT])
        .optionally_reading(&[keys::INTENT])
        .into_arc()
}

pub fn story_refiner() -> Arc<dyn GenerationTask> {
    PromptTask::new(STORY_REFINER, STORY_REFINER_PROMPT, ArtifactKind::Story)
        .reading(&[keys::DRAFT])
        .optionally_reading(&[keys::INTENT])
        .writing(keys::DRAFT)
        .into_arc()
}

pub fn story_editor() -> Arc<dyn GenerationTask> {
    PromptTask::new(STORY_EDITOR, STORY_EDITOR_PROMPT, ArtifactKind::Story)
        .reading(&[keys::DRAFT])
        .writing(keys::DRAFT)
        .with_user_text()
        .framed(Framing::EditRequest)
        .into_arc()
}

/// Answers are returned to the caller, never stored.
pub fn story_guide() -> Arc<dyn GenerationTask> {
    PromptTask::new(STORY_GUIDE, STORY_GUIDE_PROMPT, ArtifactKind::Answer)
        .optionally_reading(&[keys::DRAFT])
        .with_user_text()
        .framed(Framing::Question)
        .into_arc()
}

pub fn router() -> Arc<dyn GenerationTask> {
    PromptTask::new(ROUTER, ROUTER_PROMPT, ArtifactKind::Routing)
        .with_user_text()
        .into_arc()
}

/// All tasks used by the story pipeline.
#[derive(Clone)]
pub struct TaskCatalogue {
    pub intent_extraction: Arc<dyn GenerationTask>,
    pub worldbuilder: Arc<dyn GenerationTask>,
    pub character_forge: Arc<dyn GenerationTask>,
    pub plot_architect: Arc<dyn GenerationTask>,
    pub story_writer: Arc<dyn GenerationTask>,
    pub quality_critic: Arc<dyn GenerationTask>,
    pub story_refiner: Arc<dyn GenerationTask>,
    pub story_editor: Arc<dyn GenerationTask>,
    pub story_guide: Arc<dyn GenerationTask>,
    pub router: Arc<dyn GenerationTask>,
}

impl Default for TaskCatalogue {
    fn default() -> Self {
        Self {
            intent_extraction: intent_extraction(),
            worldbuilder: worldbuilder(),
            character_forge: character_forge(),
            plot_architect: plot_architect(),
            story_writer: story_writer(),
            quality_critic: quality_critic(),
            story_refiner: story_refiner(),
            story_editor: story_editor(),
            story_guide: story_guide(),
            router: router(),
        }
    }
}
