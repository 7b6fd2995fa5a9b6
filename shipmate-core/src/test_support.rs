//! Shared test doubles: a recording messenger, a scriptable skill, and a
//! fully wired in-memory [`SkillContext`].
//!
//! Compiled for this crate's own tests and, behind the `test-support`
//! feature, for downstream crates' test suites.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::adapters::{MessagingAdapter, SendOptions, SimulatedProcessAdapter};
use crate::audit::AuditLog;
use crate::config::{CostConfig, OrchestratorConfig, RouterConfig};
use crate::confirm::ConfirmationBroker;
use crate::cost::CostTracker;
use crate::error::{AdapterError, ShipmateError, SkillError};
use crate::orchestrator::{HealthChecker, Orchestrator};
use crate::registry::ChatRegistry;
use crate::router::NLRouter;
use crate::scheduler::Scheduler;
use crate::skills::{MessageContext, Skill, SkillContext};
use crate::store::Store;
use crate::types::{InboundMessage, SkillResult};

/// Records every outbound send.
#[derive(Default)]
pub struct RecordingMessenger {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingMessenger {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().expect("sent lock poisoned").clone()
    }
}

#[async_trait]
impl MessagingAdapter for RecordingMessenger {
    async fn send(&self, chat_id: &str, text: &str, _opts: SendOptions) -> Result<(), AdapterError> {
        self.sent
            .lock()
            .expect("sent lock poisoned")
            .push((chat_id.to_string(), text.to_string()));
        Ok(())
    }
}

/// Health checker with a fixed status code.
pub struct FixedHealthChecker(pub u16);

#[async_trait]
impl HealthChecker for FixedHealthChecker {
    async fn probe(&self, _url: &str, _timeout: Duration) -> Result<u16, String> {
        Ok(self.0)
    }
}

/// A skill that claims a fixed trigger word and replies with fixed text.
pub struct FixedSkill {
    name: String,
    priority: i32,
    trigger: String,
    reply: String,
    fail_execute: bool,
    fail_init: bool,
    shut_down: AtomicBool,
}

impl FixedSkill {
    pub fn new(name: &str, priority: i32, trigger: &str, reply: &str) -> Self {
        Self {
            name: name.into(),
            priority,
            trigger: trigger.into(),
            reply: reply.into(),
            fail_execute: false,
            fail_init: false,
            shut_down: AtomicBool::new(false),
        }
    }

    /// A skill whose `execute` always errors.
    pub fn failing(name: &str, priority: i32, trigger: &str) -> Self {
        let mut skill = Self::new(name, priority, trigger, "");
        skill.fail_execute = true;
        skill
    }

    /// A skill whose `initialize` always errors.
    pub fn bad_init(name: &str, priority: i32, trigger: &str) -> Self {
        let mut skill = Self::new(name, priority, trigger, "");
        skill.fail_init = true;
        skill
    }

    pub fn was_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Skill for FixedSkill {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "fixed test skill"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn initialize(&self, _ctx: &SkillContext) -> Result<(), ShipmateError> {
        if self.fail_init {
            return Err(SkillError::InitFailed {
                name: self.name.clone(),
                message: "scripted init failure".into(),
            }
            .into());
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ShipmateError> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn can_handle(&self, text: &str, _ctx: &MessageContext) -> bool {
        text.trim().starts_with(self.trigger.as_str())
    }

    async fn execute(
        &self,
        _text: &str,
        _ctx: &MessageContext,
    ) -> Result<SkillResult, ShipmateError> {
        if self.fail_execute {
            return Err(SkillError::ExecutionFailed {
                name: self.name.clone(),
                message: "scripted execute failure".into(),
            }
            .into());
        }
        Ok(SkillResult::ok(self.reply.clone()))
    }
}

/// A fully wired in-memory service context around the given messenger.
/// The orchestrator runs the simulated subprocess against a test project
/// named `aws-clawd-bot`, with health checks fixed at 200.
pub async fn services_with_messenger(messenger: Arc<RecordingMessenger>) -> Arc<SkillContext> {
    let store = Arc::new(Store::open_in_memory().expect("in-memory store"));
    let audit = Arc::new(AuditLog::default());
    let registry = Arc::new(ChatRegistry::new(Arc::clone(&store)));
    let cost = Arc::new(CostTracker::new(&CostConfig::default()));
    let router = Arc::new(NLRouter::new(&RouterConfig::default(), None));
    let confirm = Arc::new(ConfirmationBroker::new());

    let mut orch_config = OrchestratorConfig::default();
    orch_config
        .projects
        .insert("aws-clawd-bot".into(), std::path::PathBuf::from("/tmp/aws-clawd-bot"));
    orch_config
        .health_urls
        .insert("aws-clawd-bot".into(), "https://bot.example.com/health".into());
    orch_config.preview_settle_secs = 0;
    let orchestrator = Arc::new(Orchestrator::new(
        orch_config,
        Arc::new(SimulatedProcessAdapter::new()),
        Arc::clone(&confirm),
        Arc::clone(&audit),
        Arc::new(FixedHealthChecker(200)),
    ));

    let scheduler = Scheduler::new(
        Arc::clone(&store),
        messenger.clone() as Arc<dyn MessagingAdapter>,
        Arc::clone(&audit),
        4,
        Duration::from_secs(30),
    );

    Arc::new(SkillContext {
        store,
        registry,
        cost,
        router,
        scheduler,
        orchestrator,
        confirm,
        messenger,
        audit,
        source_control: None,
        secrets: None,
    })
}

/// An in-memory service context with a fresh recording messenger.
pub async fn services() -> Arc<SkillContext> {
    services_with_messenger(Arc::new(RecordingMessenger::default())).await
}

/// A message context for plain text from `sender` in `chat`.
pub async fn message_context(chat: &str, sender: &str) -> MessageContext {
    let services = services().await;
    MessageContext {
        message: InboundMessage::text(chat, sender, "", "test"),
        chat: Default::default(),
        services,
    }
}
