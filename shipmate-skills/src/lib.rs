//! Built-in skills for Shipmate: chat administration, reminders, deploy
//! pipelines, router administration, and cost reporting.
//!
//! Each skill is one module implementing [`shipmate_core::skills::Skill`].
//! [`register_builtin_skills`] wires them into a runtime directly;
//! [`provide_builtins`] hands their constructors to a
//! [`SkillLoader`](shipmate_core::skills::loader::SkillLoader) so the
//! directory layout and `skills.json` decide what loads.

pub mod chat_admin;
pub mod costs;
pub mod nl_admin;
pub mod pipeline;
pub mod reminders;

use std::sync::Arc;

use shipmate_core::skills::loader::SkillLoader;
use shipmate_core::skills::SkillRuntime;

pub use chat_admin::ChatAdminSkill;
pub use costs::CostsSkill;
pub use nl_admin::NlAdminSkill;
pub use pipeline::PipelineSkill;
pub use reminders::RemindersSkill;

/// Register every built-in skill directly.
pub async fn register_builtin_skills(runtime: &SkillRuntime) {
    runtime.register(Arc::new(ChatAdminSkill::new())).await;
    runtime.register(Arc::new(PipelineSkill::new())).await;
    runtime.register(Arc::new(RemindersSkill::new())).await;
    runtime.register(Arc::new(NlAdminSkill::new())).await;
    runtime.register(Arc::new(CostsSkill::new())).await;
}

/// Provide built-in constructors to a loader, keyed by directory name.
pub fn provide_builtins(loader: &mut SkillLoader) {
    loader.provide("chat-admin", |_| Arc::new(ChatAdminSkill::new()));
    loader.provide("pipeline", |_| Arc::new(PipelineSkill::new()));
    loader.provide("reminders", |_| Arc::new(RemindersSkill::new()));
    loader.provide("nl-admin", |_| Arc::new(NlAdminSkill::new()));
    loader.provide("costs", |_| Arc::new(CostsSkill::new()));
}
