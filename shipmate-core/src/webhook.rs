//! Source-control webhook fan-out.
//!
//! The kernel sees already-parsed `{event_type, payload}` events; the wire
//! bytes are the transport's problem. Supported kinds are formatted into a
//! one-line chat message and routed through the chat registry: immediate
//! chats get a send now, digest chats accumulate until the scheduled
//! flush. Unknown kinds are ignored. When a shared secret is configured,
//! raw bodies are verified with HMAC-SHA256 before parsing.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::adapters::{MessagingAdapter, SendOptions};
use crate::audit::{AuditLog, AuditStatus};
use crate::error::ShipmateError;
use crate::persistence;
use crate::registry::{ChatRegistry, RouteEvent};
use crate::scheduler::JobHandler;

type HmacSha256 = Hmac<Sha256>;

/// A parsed source-control event.
#[derive(Debug, Clone)]
pub struct SourceEvent {
    /// e.g. "push", "pull_request", "workflow_run".
    pub event_type: String,
    pub payload: Value,
}

/// Verify a `sha256=<hex>` signature header against the raw body.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(hex) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex_decode(hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn hex_decode(s: &str) -> Result<Vec<u8>, ()> {
    if s.len() % 2 != 0 {
        return Err(());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

/// A formatted event ready for routing.
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedEvent {
    pub repo: Option<String>,
    pub text: String,
    pub critical: bool,
}

/// Format a supported event into a chat line. Returns `None` for unknown
/// kinds, which the caller ignores.
pub fn format_event(event: &SourceEvent) -> Option<FormattedEvent> {
    let p = &event.payload;
    let repo = p
        .pointer("/repository/name")
        .and_then(Value::as_str)
        .map(String::from);
    let repo_label = repo.as_deref().unwrap_or("unknown repo");

    let formatted = match event.event_type.as_str() {
        "push" => {
            let pusher = p.pointer("/pusher/name").and_then(Value::as_str).unwrap_or("someone");
            let count = p.pointer("/commits").and_then(Value::as_array).map(Vec::len).unwrap_or(0);
            let branch = p
                .pointer("/ref")
                .and_then(Value::as_str)
                .and_then(|r| r.rsplit('/').next())
                .unwrap_or("?");
            FormattedEvent {
                text: format!("{repo_label}: {pusher} pushed {count} commit(s) to {branch}"),
                critical: false,
                repo,
            }
        }
        "pull_request" => {
            let action = p["action"].as_str().unwrap_or("updated");
            let number = p.pointer("/pull_request/number").and_then(Value::as_u64).unwrap_or(0);
            let title = p.pointer("/pull_request/title").and_then(Value::as_str).unwrap_or("");
            FormattedEvent {
                text: format!("{repo_label}: PR #{number} {action} - {title}"),
                critical: false,
                repo,
            }
        }
        "issues" => {
            let action = p["action"].as_str().unwrap_or("updated");
            let number = p.pointer("/issue/number").and_then(Value::as_u64).unwrap_or(0);
            let title = p.pointer("/issue/title").and_then(Value::as_str).unwrap_or("");
            FormattedEvent {
                text: format!("{repo_label}: issue #{number} {action} - {title}"),
                critical: false,
                repo,
            }
        }
        "workflow_run" => {
            let name = p.pointer("/workflow_run/name").and_then(Value::as_str).unwrap_or("workflow");
            let conclusion = p
                .pointer("/workflow_run/conclusion")
                .and_then(Value::as_str)
                .unwrap_or("in progress");
            let failed = conclusion == "failure" || conclusion == "timed_out";
            FormattedEvent {
                text: format!("{repo_label}: {name} finished: {conclusion}"),
                critical: failed,
                repo,
            }
        }
        "create" => {
            let ref_type = p["ref_type"].as_str().unwrap_or("ref");
            let git_ref = p["ref"].as_str().unwrap_or("?");
            FormattedEvent {
                text: format!("{repo_label}: {ref_type} '{git_ref}' created"),
                critical: false,
                repo,
            }
        }
        "release" => {
            let tag = p.pointer("/release/tag_name").and_then(Value::as_str).unwrap_or("?");
            let action = p["action"].as_str().unwrap_or("published");
            FormattedEvent {
                text: format!("{repo_label}: release {tag} {action}"),
                critical: false,
                repo,
            }
        }
        "ping" => FormattedEvent {
            text: format!("{repo_label}: webhook ping received"),
            critical: false,
            repo,
        },
        other => {
            debug!(event_type = other, "ignoring unsupported event kind");
            return None;
        }
    };
    Some(formatted)
}

/// Accumulates digest-mode deliveries per chat, persisted to a sidecar
/// file so a restart does not drop a batch.
#[derive(Debug)]
pub struct DigestQueue {
    queues: Mutex<HashMap<String, Vec<String>>>,
    path: Option<PathBuf>,
}

impl DigestQueue {
    pub fn new(path: Option<PathBuf>) -> Self {
        let queues = path
            .as_deref()
            .and_then(|p| persistence::load_json_or_default::<HashMap<String, Vec<String>>>(p).ok())
            .unwrap_or_default();
        Self {
            queues: Mutex::new(queues),
            path,
        }
    }

    pub fn push(&self, chat_id: &str, line: String) {
        let snapshot = {
            let mut queues = self.queues.lock().expect("digest lock poisoned");
            queues.entry(chat_id.to_string()).or_default().push(line);
            self.path.as_ref().map(|_| queues.clone())
        };
        self.persist(snapshot);
    }

    /// Take every queued batch, clearing the queue.
    pub fn drain(&self) -> Vec<(String, Vec<String>)> {
        let (drained, snapshot) = {
            let mut queues = self.queues.lock().expect("digest lock poisoned");
            let drained: Vec<(String, Vec<String>)> = queues.drain().collect();
            (drained, self.path.as_ref().map(|_| queues.clone()))
        };
        self.persist(snapshot);
        drained
    }

    pub fn pending_count(&self) -> usize {
        self.queues
            .lock()
            .expect("digest lock poisoned")
            .values()
            .map(Vec::len)
            .sum()
    }

    fn persist(&self, snapshot: Option<HashMap<String, Vec<String>>>) {
        if let (Some(path), Some(queues)) = (&self.path, snapshot) {
            if let Err(e) = persistence::save_json(path, &queues) {
                warn!(error = %e, "digest queue persist failed");
            }
        }
    }
}

/// Routes formatted events to chats.
pub struct WebhookFanout {
    registry: Arc<ChatRegistry>,
    messenger: Arc<dyn MessagingAdapter>,
    digest: Arc<DigestQueue>,
    audit: Arc<AuditLog>,
}

impl WebhookFanout {
    pub fn new(
        registry: Arc<ChatRegistry>,
        messenger: Arc<dyn MessagingAdapter>,
        digest: Arc<DigestQueue>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            registry,
            messenger,
            digest,
            audit,
        }
    }

    /// Ingest one parsed event. Returns how many chats got an immediate
    /// send. Unknown kinds count as zero and are not an error.
    pub async fn ingest(&self, event: &SourceEvent) -> Result<usize, ShipmateError> {
        let Some(formatted) = format_event(event) else {
            return Ok(0);
        };
        let delivery = self.registry.route_for(&RouteEvent {
            repo: formatted.repo.clone(),
            company: None,
            critical: formatted.critical,
        })?;

        let mut delivered = 0;
        for chat_id in &delivery.immediate {
            match self
                .messenger
                .send(chat_id, &formatted.text, SendOptions::default())
                .await
            {
                Ok(()) => delivered += 1,
                Err(e) => warn!(chat_id, error = %e, "webhook delivery failed"),
            }
        }
        for chat_id in &delivery.digest {
            self.digest.push(chat_id, formatted.text.clone());
        }

        self.audit.record(
            format!("webhook.{}", event.event_type),
            formatted.repo.as_deref().unwrap_or("unknown"),
            AuditStatus::Success,
            "webhook",
            serde_json::json!({
                "immediate": delivered,
                "queued": delivery.digest.len(),
                "critical": formatted.critical,
            }),
        );
        info!(
            event_type = %event.event_type,
            immediate = delivered,
            queued = delivery.digest.len(),
            "webhook event routed"
        );
        Ok(delivered)
    }
}

/// Scheduler handler that flushes the digest queue as one batched message
/// per chat. Registered under the name `digest_flush`.
pub struct DigestFlushHandler {
    messenger: Arc<dyn MessagingAdapter>,
    digest: Arc<DigestQueue>,
}

impl DigestFlushHandler {
    pub fn new(messenger: Arc<dyn MessagingAdapter>, digest: Arc<DigestQueue>) -> Self {
        Self { messenger, digest }
    }
}

#[async_trait]
impl JobHandler for DigestFlushHandler {
    async fn run(&self, _params: &Value) -> Result<Option<String>, ShipmateError> {
        for (chat_id, lines) in self.digest.drain() {
            if lines.is_empty() {
                continue;
            }
            let message = format!("Digest ({} events):\n- {}", lines.len(), lines.join("\n- "));
            if let Err(e) = self
                .messenger
                .send(&chat_id, &message, SendOptions::default())
                .await
            {
                warn!(chat_id, error = %e, "digest delivery failed");
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChatType, NotificationLevel};
    use crate::test_support::{services_with_messenger, RecordingMessenger};

    fn push_event(repo: &str) -> SourceEvent {
        SourceEvent {
            event_type: "push".into(),
            payload: serde_json::json!({
                "repository": {"name": repo},
                "pusher": {"name": "dev"},
                "ref": "refs/heads/main",
                "commits": [{"id": "a"}, {"id": "b"}],
            }),
        }
    }

    fn failed_workflow(repo: &str) -> SourceEvent {
        SourceEvent {
            event_type: "workflow_run".into(),
            payload: serde_json::json!({
                "repository": {"name": repo},
                "workflow_run": {"name": "CI", "conclusion": "failure"},
            }),
        }
    }

    #[test]
    fn test_signature_verification() {
        // HMAC-SHA256("secret", "body") known-answer check via self-consistency.
        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(b"body");
        let hex: String = mac
            .finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();

        assert!(verify_signature("secret", b"body", &format!("sha256={hex}")));
        assert!(!verify_signature("secret", b"tampered", &format!("sha256={hex}")));
        assert!(!verify_signature("wrong", b"body", &format!("sha256={hex}")));
        assert!(!verify_signature("secret", b"body", "sha1=abc"));
        assert!(!verify_signature("secret", b"body", "sha256=zz"));
    }

    #[test]
    fn test_format_push_and_workflow() {
        let push = format_event(&push_event("api")).unwrap();
        assert_eq!(push.repo.as_deref(), Some("api"));
        assert!(push.text.contains("pushed 2 commit(s) to main"));
        assert!(!push.critical);

        let wf = format_event(&failed_workflow("api")).unwrap();
        assert!(wf.critical);
        assert!(wf.text.contains("failure"));
    }

    #[test]
    fn test_unknown_kind_ignored() {
        let event = SourceEvent {
            event_type: "deployment_protection_rule".into(),
            payload: serde_json::json!({}),
        };
        assert!(format_event(&event).is_none());
    }

    #[tokio::test]
    async fn test_ingest_routes_immediate_and_digest() {
        let messenger = Arc::new(RecordingMessenger::default());
        let services = services_with_messenger(messenger.clone()).await;
        register(&services, "now", ChatType::Repo, Some("api"), NotificationLevel::All);
        register(&services, "later", ChatType::Hq, None, NotificationLevel::Digest);

        let digest = Arc::new(DigestQueue::new(None));
        let fanout = WebhookFanout::new(
            Arc::clone(&services.registry),
            messenger.clone() as Arc<dyn MessagingAdapter>,
            Arc::clone(&digest),
            Arc::clone(&services.audit),
        );

        let delivered = fanout.ingest(&push_event("api")).await.unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(messenger.sent().len(), 1);
        assert_eq!(digest.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_digest_flush_handler_batches() {
        let messenger = Arc::new(RecordingMessenger::default());
        let digest = Arc::new(DigestQueue::new(None));
        digest.push("C1", "event one".into());
        digest.push("C1", "event two".into());

        let handler = DigestFlushHandler::new(
            messenger.clone() as Arc<dyn MessagingAdapter>,
            Arc::clone(&digest),
        );
        handler.run(&Value::Null).await.unwrap();

        let sent = messenger.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("Digest (2 events)"));
        assert_eq!(digest.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_digest_queue_persists_across_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("digest.json");

        let queue = DigestQueue::new(Some(path.clone()));
        queue.push("C1", "pending event".into());
        drop(queue);

        let restored = DigestQueue::new(Some(path));
        assert_eq!(restored.pending_count(), 1);
    }

    fn register(
        services: &Arc<crate::skills::SkillContext>,
        chat: &str,
        chat_type: ChatType,
        target: Option<&str>,
        level: NotificationLevel,
    ) {
        services
            .registry
            .register(
                chat,
                crate::registry::RegisterRequest {
                    chat_type,
                    target: target.map(String::from),
                    notifications: level,
                    platform: "test".into(),
                    label: None,
                    registered_by: "u1".into(),
                },
            )
            .unwrap();
    }
}
