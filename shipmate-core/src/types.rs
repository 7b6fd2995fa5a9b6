//! Shared types that flow between the runtime, skills, and adapters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// An inbound chat message as seen by the kernel.
///
/// Transports normalize their wire formats into this before handing the
/// message to the skill runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Chat the message arrived in.
    pub chat_id: String,
    /// Sender user id on the origin platform.
    pub sender_id: String,
    /// Text content. Empty when the message is audio-only.
    pub text: String,
    /// Reference to an audio artifact to transcribe, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    /// Origin platform name (e.g., "telegram", "console").
    pub platform: String,
    /// Arrival time.
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Create a text message.
    pub fn text(
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        Self {
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            text: text.into(),
            audio: None,
            platform: platform.into(),
            received_at: Utc::now(),
        }
    }
}

/// The result envelope every skill returns.
///
/// Failures are values: a skill that cannot complete returns
/// `success = false` with a one-line message and, where possible, what was
/// attempted and what to try next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillResult {
    /// Whether the skill completed its action.
    pub success: bool,
    /// One-line human message for the chat.
    pub message: String,
    /// Structured payload for callers that want more than text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// What was attempted, for failed results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempted: Option<String>,
    /// What the user should try next, for failed results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Taxonomy classification for failed results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    /// Wall-clock execution time in milliseconds, when measured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,
    /// Name of the skill that produced this result. `None` when no skill
    /// claimed the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
}

impl SkillResult {
    /// A successful result with a message.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            attempted: None,
            suggestion: None,
            kind: None,
            time_ms: None,
            skill: None,
        }
    }

    /// A failed result with a message and taxonomy kind.
    pub fn err(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            attempted: None,
            suggestion: None,
            kind: Some(kind),
            time_ms: None,
            skill: None,
        }
    }

    /// Attach a structured payload.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Record what was attempted.
    pub fn with_attempted(mut self, attempted: impl Into<String>) -> Self {
        self.attempted = Some(attempted.into());
        self
    }

    /// Record a next-step suggestion.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Task classification attached to provider cost entries.
///
/// Free-form at the edges, but the optimizer recognizes the simple kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Simple,
    Greeting,
    Chitchat,
    Classification,
    Transcription,
    Chat,
    Other(String),
}

impl TaskType {
    /// Whether a cheap model is always sufficient for this kind of task.
    pub fn is_trivial(&self) -> bool {
        matches!(self, TaskType::Simple | TaskType::Greeting | TaskType::Chitchat)
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskType::Simple => "simple",
            TaskType::Greeting => "greeting",
            TaskType::Chitchat => "chitchat",
            TaskType::Classification => "classification",
            TaskType::Transcription => "transcription",
            TaskType::Chat => "chat",
            TaskType::Other(s) => s.as_str(),
        }
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        match s {
            "simple" => TaskType::Simple,
            "greeting" => TaskType::Greeting,
            "chitchat" => TaskType::Chitchat,
            "classification" => TaskType::Classification,
            "transcription" => TaskType::Transcription,
            "chat" => TaskType::Chat,
            other => TaskType::Other(other.to_string()),
        }
    }
}
