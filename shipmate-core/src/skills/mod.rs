//! Skill runtime — registration, priority-ordered dispatch, lifecycle,
//! and the shared context every skill works against.
//!
//! A skill is anything implementing [`Skill`]; there is no base class.
//! The conveniences a base class would provide (result builders, command
//! parsing, prefixed logging) live in [`crate::skills::helpers`] and are
//! used by composition.
//!
//! Dispatch: skills are sorted by descending priority (stable by
//! registration order for ties); the first whose `can_handle` claims the
//! text executes. Skill failures are values: an `Err` from `execute` is
//! caught, audited, and returned as a structured failure — the runtime
//! never crashes on a skill error.

pub mod dispatch;
pub mod helpers;
pub mod loader;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tracing::{error, info, warn};

use crate::adapters::{MessagingAdapter, SourceControlAdapter};
use crate::audit::{AuditLog, AuditStatus};
use crate::confirm::ConfirmationBroker;
use crate::cost::CostTracker;
use crate::error::{ErrorKind, ShipmateError};
use crate::events::{EventBus, RuntimeEvent};
use crate::orchestrator::Orchestrator;
use crate::registry::{ChatContext, ChatRegistry};
use crate::router::NLRouter;
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::types::{InboundMessage, SkillResult};

/// One declared command pattern of a skill, for help output and the
/// diagnostic pattern index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Regex the skill matches, as written in its `can_handle`.
    pub pattern: String,
    /// Canonical usage line, e.g. `remind me <msg> in <N> m|h`.
    pub usage: String,
    pub description: String,
}

/// The shared singletons, injected once at construction. Skills never
/// reach these through globals.
pub struct SkillContext {
    pub store: Arc<Store>,
    pub registry: Arc<ChatRegistry>,
    pub cost: Arc<CostTracker>,
    pub router: Arc<NLRouter>,
    pub scheduler: Arc<Scheduler>,
    pub orchestrator: Arc<Orchestrator>,
    pub confirm: Arc<ConfirmationBroker>,
    pub messenger: Arc<dyn MessagingAdapter>,
    pub audit: Arc<AuditLog>,
    /// Absent when no source-control credentials are configured; skills
    /// that need it degrade with a configuration hint.
    pub source_control: Option<Arc<dyn SourceControlAdapter>>,
    /// Absent when no secret key is configured.
    pub secrets: Option<Arc<crate::secrets::SecretVault>>,
}

/// Everything a skill sees for one message.
pub struct MessageContext {
    pub message: InboundMessage,
    /// The chat's registered ambient context (repo, company, hq).
    pub chat: ChatContext,
    pub services: Arc<SkillContext>,
}

/// A capability unit dispatchable by the runtime.
#[async_trait]
pub trait Skill: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// Higher priorities are consulted first. Ties keep registration order.
    fn priority(&self) -> i32 {
        0
    }

    /// Declared command surface.
    fn commands(&self) -> Vec<CommandSpec> {
        Vec::new()
    }

    /// One-time setup. A failure disables the skill for the session.
    async fn initialize(&self, _ctx: &SkillContext) -> Result<(), ShipmateError> {
        Ok(())
    }

    /// Graceful teardown.
    async fn shutdown(&self) -> Result<(), ShipmateError> {
        Ok(())
    }

    /// Whether this skill claims the text. Must be cheap and synchronous.
    fn can_handle(&self, text: &str, ctx: &MessageContext) -> bool;

    /// Execute the claimed text. Errors are caught by the runtime and
    /// surfaced as structured failures.
    async fn execute(&self, text: &str, ctx: &MessageContext) -> Result<SkillResult, ShipmateError>;
}

/// A matching skill, for the diagnostic index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillMatch {
    pub name: String,
    pub priority: i32,
}

/// The skill registry and dispatcher.
pub struct SkillRuntime {
    skills: RwLock<Vec<Arc<dyn Skill>>>,
    disabled: Mutex<HashSet<String>>,
    events: EventBus,
    audit: Arc<AuditLog>,
}

impl SkillRuntime {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self {
            skills: RwLock::new(Vec::new()),
            disabled: Mutex::new(HashSet::new()),
            events: EventBus::default(),
            audit,
        }
    }

    /// The runtime's event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Register a skill. Unique by name: re-registering replaces the old
    /// instance, shutting it down first.
    pub async fn register(&self, skill: Arc<dyn Skill>) {
        let name = skill.name().to_string();
        let displaced = {
            let mut skills = self.skills.write().expect("skills lock poisoned");
            let displaced = skills
                .iter()
                .position(|s| s.name() == name)
                .map(|pos| skills.remove(pos));
            skills.push(Arc::clone(&skill));
            displaced
        };
        if let Some(old) = displaced {
            if let Err(e) = old.shutdown().await {
                warn!(skill = %name, error = %e, "displaced skill shutdown failed");
            }
            self.events.emit(RuntimeEvent::SkillUnregistered { skill: name.clone() });
        }
        self.disabled.lock().expect("disabled lock poisoned").remove(&name);
        info!(skill = %name, priority = skill.priority(), "skill registered");
        self.events.emit(RuntimeEvent::SkillRegistered {
            skill: name,
            priority: skill.priority(),
        });
    }

    /// Remove a skill by name, shutting it down.
    pub async fn unregister(&self, name: &str) -> bool {
        let removed = {
            let mut skills = self.skills.write().expect("skills lock poisoned");
            skills
                .iter()
                .position(|s| s.name() == name)
                .map(|pos| skills.remove(pos))
        };
        match removed {
            Some(skill) => {
                if let Err(e) = skill.shutdown().await {
                    warn!(skill = name, error = %e, "skill shutdown failed");
                }
                self.events.emit(RuntimeEvent::SkillUnregistered { skill: name.to_string() });
                true
            }
            None => false,
        }
    }

    /// Initialize every registered skill. Per-skill failures disable that
    /// skill for the session without aborting the batch.
    pub async fn initialize(&self, ctx: &SkillContext) {
        let skills: Vec<Arc<dyn Skill>> =
            self.skills.read().expect("skills lock poisoned").clone();
        for skill in skills {
            let name = skill.name().to_string();
            match skill.initialize(ctx).await {
                Ok(()) => {
                    self.events.emit(RuntimeEvent::SkillInitialized { skill: name });
                }
                Err(e) => {
                    error!(skill = %name, error = %e, "skill initialize failed; disabling");
                    self.disabled
                        .lock()
                        .expect("disabled lock poisoned")
                        .insert(name.clone());
                    self.events.emit(RuntimeEvent::SkillError {
                        skill: name,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// Skills in dispatch order: descending priority, stable for ties.
    fn dispatch_order(&self) -> Vec<Arc<dyn Skill>> {
        let mut skills: Vec<Arc<dyn Skill>> =
            self.skills.read().expect("skills lock poisoned").clone();
        skills.sort_by_key(|s| std::cmp::Reverse(s.priority()));
        skills
    }

    /// Dispatch one text to at most one skill.
    pub async fn route(&self, text: &str, ctx: &MessageContext) -> SkillResult {
        let disabled = self.disabled.lock().expect("disabled lock poisoned").clone();
        for skill in self.dispatch_order() {
            if disabled.contains(skill.name()) || !skill.can_handle(text, ctx) {
                continue;
            }
            let name = skill.name().to_string();
            self.events.emit(RuntimeEvent::BeforeExecute {
                skill: name.clone(),
                chat_id: ctx.message.chat_id.clone(),
            });
            let started = Instant::now();
            let mut result = match skill.execute(text, ctx).await {
                Ok(result) => result,
                Err(e) => {
                    error!(skill = %name, error = %e, "skill execute failed");
                    self.audit.record(
                        "skill.error",
                        &name,
                        AuditStatus::Failed,
                        &ctx.message.sender_id,
                        serde_json::json!({"error": e.to_string()}),
                    );
                    self.events.emit(RuntimeEvent::SkillError {
                        skill: name.clone(),
                        message: e.to_string(),
                    });
                    SkillResult::err(e.kind(), one_line(&e))
                        .with_attempted(text.to_string())
                }
            };
            let duration_ms = started.elapsed().as_millis() as u64;
            result.skill = Some(name.clone());
            result.time_ms = Some(duration_ms);
            self.events.emit(RuntimeEvent::AfterExecute {
                skill: name,
                chat_id: ctx.message.chat_id.clone(),
                success: result.success,
                duration_ms,
            });
            return result;
        }
        SkillResult::err(ErrorKind::NotFound, "No skill matched that message.")
            .with_suggestion("try 'help' for the command list")
    }

    /// Diagnostic: every skill whose `can_handle` claims the text, with
    /// priorities, for debugging pattern conflicts.
    pub fn find_matching_skills(&self, text: &str, ctx: &MessageContext) -> Vec<SkillMatch> {
        self.dispatch_order()
            .into_iter()
            .filter(|s| s.can_handle(text, ctx))
            .map(|s| SkillMatch {
                name: s.name().to_string(),
                priority: s.priority(),
            })
            .collect()
    }

    /// Declared commands of every enabled skill, for help output.
    pub fn command_index(&self) -> Vec<(String, Vec<CommandSpec>)> {
        self.dispatch_order()
            .into_iter()
            .map(|s| (s.name().to_string(), s.commands()))
            .collect()
    }

    /// Shut down every skill in reverse registration order, swallowing and
    /// logging per-skill failures.
    pub async fn shutdown(&self) {
        let skills: Vec<Arc<dyn Skill>> = {
            let mut skills = self.skills.write().expect("skills lock poisoned");
            skills.drain(..).collect()
        };
        for skill in skills.into_iter().rev() {
            if let Err(e) = skill.shutdown().await {
                warn!(skill = skill.name(), error = %e, "skill shutdown failed");
            }
        }
        self.events.emit(RuntimeEvent::Shutdown);
    }

    /// Names of registered skills, in registration order.
    pub fn skill_names(&self) -> Vec<String> {
        self.skills
            .read()
            .expect("skills lock poisoned")
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }
}

/// First line of an error display, for the one-line message contract.
fn one_line(e: &ShipmateError) -> String {
    e.to_string().lines().next().unwrap_or("internal error").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{message_context, FixedSkill};

    #[tokio::test]
    async fn test_priority_dispatch_highest_wins() {
        let runtime = SkillRuntime::new(Arc::new(AuditLog::default()));
        runtime.register(Arc::new(FixedSkill::new("low", 10, "ping", "low wins"))).await;
        runtime.register(Arc::new(FixedSkill::new("high", 30, "ping", "high wins"))).await;

        let ctx = message_context("C1", "u1").await;
        let result = runtime.route("ping", &ctx).await;
        assert!(result.success);
        assert_eq!(result.skill.as_deref(), Some("high"));
        assert_eq!(result.message, "high wins");
    }

    #[tokio::test]
    async fn test_equal_priority_keeps_registration_order() {
        let runtime = SkillRuntime::new(Arc::new(AuditLog::default()));
        runtime.register(Arc::new(FixedSkill::new("first", 10, "ping", "first"))).await;
        runtime.register(Arc::new(FixedSkill::new("second", 10, "ping", "second"))).await;

        let ctx = message_context("C1", "u1").await;
        let result = runtime.route("ping", &ctx).await;
        assert_eq!(result.skill.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_no_match_returns_structured_failure() {
        let runtime = SkillRuntime::new(Arc::new(AuditLog::default()));
        let ctx = message_context("C1", "u1").await;
        let result = runtime.route("nothing matches this", &ctx).await;
        assert!(!result.success);
        assert!(result.skill.is_none());
        assert_eq!(result.kind, Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_execute_error_is_caught_and_audited() {
        let audit = Arc::new(AuditLog::default());
        let runtime = SkillRuntime::new(Arc::clone(&audit));
        runtime.register(Arc::new(FixedSkill::failing("broken", 10, "boom"))).await;

        let ctx = message_context("C1", "u1").await;
        let result = runtime.route("boom", &ctx).await;
        assert!(!result.success);
        assert_eq!(result.skill.as_deref(), Some("broken"));
        assert_eq!(audit.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_reregister_replaces_and_shuts_down_old() {
        let runtime = SkillRuntime::new(Arc::new(AuditLog::default()));
        let old = Arc::new(FixedSkill::new("dup", 10, "ping", "old"));
        runtime.register(old.clone()).await;
        runtime.register(Arc::new(FixedSkill::new("dup", 10, "ping", "new"))).await;

        assert!(old.was_shut_down());
        let ctx = message_context("C1", "u1").await;
        let result = runtime.route("ping", &ctx).await;
        assert_eq!(result.message, "new");
        assert_eq!(runtime.skill_names(), vec!["dup"]);
    }

    #[tokio::test]
    async fn test_initialize_failure_disables_skill_only() {
        let runtime = SkillRuntime::new(Arc::new(AuditLog::default()));
        runtime.register(Arc::new(FixedSkill::bad_init("flaky", 50, "ping"))).await;
        runtime.register(Arc::new(FixedSkill::new("steady", 10, "ping", "steady"))).await;

        let ctx = message_context("C1", "u1").await;
        runtime.initialize(&ctx.services).await;

        let result = runtime.route("ping", &ctx).await;
        // The disabled higher-priority skill is skipped.
        assert_eq!(result.skill.as_deref(), Some("steady"));
    }

    #[tokio::test]
    async fn test_find_matching_skills_lists_all() {
        let runtime = SkillRuntime::new(Arc::new(AuditLog::default()));
        runtime.register(Arc::new(FixedSkill::new("a", 10, "ping", "a"))).await;
        runtime.register(Arc::new(FixedSkill::new("b", 30, "ping", "b"))).await;

        let ctx = message_context("C1", "u1").await;
        let matches = runtime.find_matching_skills("ping", &ctx);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].name, "b");
        assert_eq!(matches[0].priority, 30);
    }

    #[tokio::test]
    async fn test_events_emitted_around_execute() {
        let runtime = SkillRuntime::new(Arc::new(AuditLog::default()));
        let mut rx = runtime.events().subscribe();
        runtime.register(Arc::new(FixedSkill::new("s", 10, "ping", "ok"))).await;

        let ctx = message_context("C1", "u1").await;
        runtime.route("ping", &ctx).await;

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.event_name().to_string());
        }
        assert_eq!(names, vec!["skill_registered", "before_execute", "after_execute"]);
    }
}
