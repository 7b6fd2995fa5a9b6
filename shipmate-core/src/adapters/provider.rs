//! AI provider façades: an OpenAI-compatible chat/classification client
//! and a Whisper-style transcription client.
//!
//! Both speak plain `reqwest` JSON with a hard deadline and map failures
//! onto [`AdapterError`] at the boundary. The classifier prompt asks for a
//! strict JSON object matching [`Classification`]; a reply that does not
//! parse is an upstream error the router degrades on.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::{ChatMessage, ChatReply, Classification, ProviderAdapter, TranscriberAdapter};
use crate::error::AdapterError;

const CLASSIFIER_SYSTEM_PROMPT: &str = "You classify operator messages for a repo-operations bot. \
Reply with one JSON object only, no prose: {\"intent\": string, \"action\": string|null, \
\"project\": string|null, \"company\": string|null, \"confidence\": number 0-1, \
\"ambiguous\": bool, \"risk\": \"low\"|\"med\"|\"high\", \"requires_confirmation\": bool, \
\"alternatives\": [string], \"clarifying_questions\": [string], \
\"confidence_factors\": {string: number}}";

/// OpenAI-compatible chat completions client (works against Groq, OpenAI,
/// and compatible gateways).
pub struct OpenAiCompatProvider {
    client: Client,
    base_url: String,
    api_key: String,
    provider_name: String,
    model: String,
    timeout: Duration,
}

impl OpenAiCompatProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        provider_name: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            provider_name: provider_name.into(),
            model: model.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn completions(&self, body: Value) -> Result<Value, AdapterError> {
        debug!(provider = %self.provider_name, model = %self.model, "chat completion request");
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AdapterError::Timeout {
                        adapter: self.provider_name.clone(),
                        timeout_secs: self.timeout.as_secs(),
                    }
                } else {
                    AdapterError::Request {
                        adapter: self.provider_name.clone(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(AdapterError::Status {
                adapter: self.provider_name.clone(),
                status: status.as_u16(),
                message,
            });
        }
        resp.json().await.map_err(|e| AdapterError::ResponseParse {
            adapter: self.provider_name.clone(),
            message: e.to_string(),
        })
    }

    fn reply_from(&self, body: &Value) -> Result<ChatReply, AdapterError> {
        let content = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| AdapterError::ResponseParse {
                adapter: self.provider_name.clone(),
                message: "missing choices[0].message.content".into(),
            })?;
        Ok(ChatReply {
            response: content.to_string(),
            input_tokens: body.pointer("/usage/prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
            output_tokens: body
                .pointer("/usage/completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            provider: self.provider_name.clone(),
            model: self.model.clone(),
        })
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatProvider {
    async fn classify(
        &self,
        text: &str,
        context: &Value,
    ) -> Result<Classification, AdapterError> {
        let user = format!("Context: {context}\nMessage: {text}");
        let body = self
            .completions(json!({
                "model": self.model,
                "temperature": 0,
                "response_format": {"type": "json_object"},
                "messages": [
                    {"role": "system", "content": CLASSIFIER_SYSTEM_PROMPT},
                    {"role": "user", "content": user},
                ],
            }))
            .await?;
        let reply = self.reply_from(&body)?;
        parse_classification(&reply.response).map_err(|message| AdapterError::ResponseParse {
            adapter: self.provider_name.clone(),
            message,
        })
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatReply, AdapterError> {
        let body = self
            .completions(json!({
                "model": self.model,
                "messages": messages,
            }))
            .await?;
        self.reply_from(&body)
    }
}

/// Parse the classifier's JSON reply, tolerating code fences.
fn parse_classification(reply: &str) -> Result<Classification, String> {
    let trimmed = reply
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let mut c: Classification =
        serde_json::from_str(trimmed).map_err(|e| format!("classifier reply not JSON: {e}"))?;
    c.confidence = c.confidence.clamp(0.0, 1.0);
    Ok(c)
}

/// Whisper-style transcription over a multipart upload.
pub struct GroqTranscriber {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl GroqTranscriber {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[async_trait]
impl TranscriberAdapter for GroqTranscriber {
    async fn transcribe(&self, audio_path: &Path) -> Result<String, AdapterError> {
        let bytes = tokio::fs::read(audio_path).await.map_err(|e| AdapterError::Request {
            adapter: "transcriber".into(),
            message: format!("cannot read {}: {e}", audio_path.display()),
        })?;
        let file_name = audio_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.ogg".to_string());

        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            );

        let resp = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AdapterError::Timeout {
                        adapter: "transcriber".into(),
                        timeout_secs: self.timeout.as_secs(),
                    }
                } else {
                    AdapterError::Request {
                        adapter: "transcriber".into(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AdapterError::Status {
                adapter: "transcriber".into(),
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        let body: Value = resp.json().await.map_err(|e| AdapterError::ResponseParse {
            adapter: "transcriber".into(),
            message: e.to_string(),
        })?;
        body["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AdapterError::ResponseParse {
                adapter: "transcriber".into(),
                message: "missing 'text' in transcription response".into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_classification_plain_json() {
        let c = parse_classification(
            r#"{"intent": "deploy", "project": "api", "confidence": 0.92, "risk": "high",
                "requires_confirmation": true}"#,
        )
        .unwrap();
        assert_eq!(c.intent, "deploy");
        assert_eq!(c.project.as_deref(), Some("api"));
        assert!(c.requires_confirmation);
    }

    #[test]
    fn test_parse_classification_fenced() {
        let c = parse_classification("```json\n{\"intent\": \"status\", \"confidence\": 1.4}\n```")
            .unwrap();
        assert_eq!(c.intent, "status");
        // out-of-range confidence is clamped
        assert_eq!(c.confidence, 1.0);
    }

    #[test]
    fn test_parse_classification_garbage() {
        assert!(parse_classification("sure, deploying now!").is_err());
    }
}
