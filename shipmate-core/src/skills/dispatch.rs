//! The message pump: per-chat FIFO processing of inbound messages.
//!
//! Each chat gets a mailbox and a worker task, so a second command from
//! the same chat can never observe a prior one partially applied, while
//! different chats progress concurrently. The pump owns the inbound side
//! of the control flow: transcription of voice messages, conversation
//! memory, NL routing, and skill dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{MessageContext, SkillContext, SkillRuntime};
use crate::adapters::{Classification, SendOptions, TranscriberAdapter};
use crate::error::ErrorKind;
use crate::registry::ChatContext;
use crate::router::RouteDecision;
use crate::store::ConversationRole;
use crate::types::{InboundMessage, SkillResult, TaskType};

/// How many conversation lines to keep per user.
const CONVERSATION_KEEP: usize = 200;

struct Mailbox {
    sender: mpsc::UnboundedSender<InboundMessage>,
    worker: JoinHandle<()>,
}

/// Per-chat FIFO dispatcher. Constructed shared: mailbox workers hold a
/// handle back to the pump.
pub struct MessagePump {
    runtime: Arc<SkillRuntime>,
    services: Arc<SkillContext>,
    transcriber: Option<Arc<dyn TranscriberAdapter>>,
    mailboxes: Mutex<HashMap<String, Mailbox>>,
    weak: Weak<MessagePump>,
}

impl MessagePump {
    pub fn new(
        runtime: Arc<SkillRuntime>,
        services: Arc<SkillContext>,
        transcriber: Option<Arc<dyn TranscriberAdapter>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            runtime,
            services,
            transcriber,
            mailboxes: Mutex::new(HashMap::new()),
            weak: weak.clone(),
        })
    }

    /// Enqueue a message on its chat's mailbox. Replies go back through
    /// the messaging adapter.
    pub fn submit(&self, message: InboundMessage) {
        let mut mailboxes = self.mailboxes.lock().expect("mailboxes lock poisoned");
        let mailbox = mailboxes.entry(message.chat_id.clone()).or_insert_with(|| {
            let (sender, mut receiver) = mpsc::unbounded_channel::<InboundMessage>();
            let weak = self.weak.clone();
            let worker = tokio::spawn(async move {
                while let Some(message) = receiver.recv().await {
                    let Some(pump) = weak.upgrade() else { return };
                    let chat_id = message.chat_id.clone();
                    let result = pump.process_one(message).await;
                    if let Err(e) = pump
                        .services
                        .messenger
                        .send(&chat_id, &result.message, SendOptions::default())
                        .await
                    {
                        warn!(chat_id, error = %e, "reply delivery failed");
                    }
                }
            });
            Mailbox { sender, worker }
        });
        if mailbox.sender.send(message).is_err() {
            warn!("mailbox worker gone; message dropped");
        }
    }

    /// Process one message to a result. Public for transports that want
    /// the result inline (the console) rather than via the messenger.
    pub async fn process_one(&self, mut message: InboundMessage) -> SkillResult {
        // Voice first: transcribe, then treat as text.
        if message.text.trim().is_empty() {
            if let Some(audio) = message.audio.clone() {
                match self.transcribe(&audio).await {
                    Ok(text) => {
                        debug!(chat_id = %message.chat_id, "voice message transcribed");
                        message.text = text;
                    }
                    Err(result) => return result,
                }
            } else {
                return SkillResult::err(ErrorKind::BadArgument, "Empty message.");
            }
        }

        let user_id = message.sender_id.clone();
        if let Err(e) = self.services.store.append_conversation(
            &user_id,
            ConversationRole::User,
            &message.text,
        ) {
            warn!(error = %e, "conversation append failed");
        }

        let chat = self
            .services
            .registry
            .context_for(&message.chat_id)
            .unwrap_or_else(|e| {
                warn!(error = %e, "registry unavailable; routing without chat context");
                ChatContext::default()
            });

        let decision = self.services.router.route(&message.text, &chat).await;
        let routed_text = match decision {
            RouteDecision::Command(command) => command,
            RouteDecision::Passthrough => message.text.clone(),
            RouteDecision::Classified(classification) => {
                match command_from_classification(&classification) {
                    Some(command) => command,
                    None => {
                        return clarification_reply(&classification);
                    }
                }
            }
        };

        let ctx = MessageContext {
            message,
            chat,
            services: Arc::clone(&self.services),
        };
        let result = self.runtime.route(&routed_text, &ctx).await;

        if let Err(e) = self.services.store.append_conversation(
            &user_id,
            ConversationRole::Assistant,
            &result.message,
        ) {
            warn!(error = %e, "conversation append failed");
        }
        if let Err(e) = self.services.store.prune_conversations(&user_id, CONVERSATION_KEEP) {
            warn!(error = %e, "conversation prune failed");
        }
        result
    }

    async fn transcribe(&self, audio: &str) -> Result<String, SkillResult> {
        let Some(transcriber) = &self.transcriber else {
            return Err(SkillResult::err(
                ErrorKind::Degraded,
                "Voice messages need a transcription backend, and none is configured.",
            ));
        };
        match transcriber.transcribe(std::path::Path::new(audio)).await {
            Ok(text) if !text.trim().is_empty() => {
                self.services
                    .cost
                    .record("groq", "whisper-large-v3", 0, 0, TaskType::Transcription);
                Ok(text)
            }
            Ok(_) => Err(SkillResult::err(
                ErrorKind::BadArgument,
                "I could not hear anything in that recording.",
            )),
            Err(e) => Err(SkillResult::err(e.kind(), format!("Transcription failed: {e}"))
                .with_suggestion("try sending the request as text")),
        }
    }

    /// Drop all mailboxes and wait for their workers to drain.
    pub async fn shutdown(&self) {
        let mailboxes: Vec<Mailbox> = {
            let mut map = self.mailboxes.lock().expect("mailboxes lock poisoned");
            map.drain().map(|(_, m)| m).collect()
        };
        for mailbox in mailboxes {
            drop(mailbox.sender);
            if let Err(e) = mailbox.worker.await {
                warn!(error = %e, "mailbox worker join failed");
            }
        }
    }
}

/// Turn a confident classification into a canonical command, or `None`
/// when the user should be asked instead.
fn command_from_classification(c: &Classification) -> Option<String> {
    if c.ambiguous {
        return None;
    }
    let action = c.action.as_deref().unwrap_or(c.intent.as_str());
    match action {
        "deploy" => c.project.as_ref().map(|p| format!("pipeline deploy {p}")),
        "rollback" => c.project.as_ref().map(|p| format!("pipeline rollback {p}")),
        "test" => c.project.as_ref().map(|p| format!("pipeline test {p}")),
        "status" => Some("pipeline status".to_string()),
        "costs" => Some("ai costs".to_string()),
        "context" => Some("context".to_string()),
        _ => None,
    }
}

fn clarification_reply(c: &Classification) -> SkillResult {
    let question = c
        .clarifying_questions
        .first()
        .cloned()
        .unwrap_or_else(|| "Which project do you mean?".to_string());
    let mut result = SkillResult::ok(question);
    if !c.alternatives.is_empty() {
        result = result.with_suggestion(format!("did you mean: {}", c.alternatives.join(", ")));
    }
    result.data = Some(serde_json::json!({
        "intent": c.intent,
        "confidence": c.confidence,
        "ambiguous": c.ambiguous,
    }));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::RiskLevel;
    use crate::test_support::{services_with_messenger, FixedSkill, RecordingMessenger};
    use chrono::Utc;

    fn msg(chat: &str, text: &str) -> InboundMessage {
        InboundMessage {
            chat_id: chat.into(),
            sender_id: "u1".into(),
            text: text.into(),
            audio: None,
            platform: "test".into(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_process_one_routes_and_records_conversation() {
        let messenger = Arc::new(RecordingMessenger::default());
        let services = services_with_messenger(messenger.clone()).await;
        let runtime = Arc::new(SkillRuntime::new(Arc::clone(&services.audit)));
        runtime
            .register(Arc::new(FixedSkill::new("ctx", 10, "context", "Type: none")))
            .await;
        let pump = MessagePump::new(runtime, Arc::clone(&services), None);

        let result = pump.process_one(msg("C1", "context")).await;
        assert!(result.success);

        let lines = services.store.recent_conversations("u1", 10).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].role, ConversationRole::User);
        assert_eq!(lines[1].role, ConversationRole::Assistant);
    }

    #[tokio::test]
    async fn test_submit_serializes_per_chat_and_replies() {
        let messenger = Arc::new(RecordingMessenger::default());
        let services = services_with_messenger(messenger.clone()).await;
        let runtime = Arc::new(SkillRuntime::new(Arc::clone(&services.audit)));
        runtime
            .register(Arc::new(FixedSkill::new("echo", 10, "ping", "pong")))
            .await;
        let pump = MessagePump::new(runtime, Arc::clone(&services), None);

        for _ in 0..3 {
            pump.submit(msg("C1", "ping"));
        }
        pump.shutdown().await;

        let sent = messenger.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|(chat, text)| chat == "C1" && text == "pong"));
    }

    #[tokio::test]
    async fn test_empty_message_without_audio_rejected() {
        let messenger = Arc::new(RecordingMessenger::default());
        let services = services_with_messenger(messenger).await;
        let runtime = Arc::new(SkillRuntime::new(Arc::clone(&services.audit)));
        let pump = MessagePump::new(runtime, services, None);

        let result = pump.process_one(msg("C1", "   ")).await;
        assert!(!result.success);
        assert_eq!(result.kind, Some(ErrorKind::BadArgument));
    }

    #[test]
    fn test_command_from_classification() {
        let mut c = Classification {
            intent: "deploy".into(),
            action: Some("deploy".into()),
            project: Some("api".into()),
            company: None,
            confidence: 0.9,
            ambiguous: false,
            risk: RiskLevel::Med,
            requires_confirmation: true,
            alternatives: vec![],
            clarifying_questions: vec![],
            confidence_factors: Default::default(),
        };
        assert_eq!(
            command_from_classification(&c).as_deref(),
            Some("pipeline deploy api")
        );

        c.ambiguous = true;
        assert!(command_from_classification(&c).is_none());

        c.ambiguous = false;
        c.project = None;
        assert!(command_from_classification(&c).is_none());
    }
}
