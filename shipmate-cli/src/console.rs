//! Console transport — a stdin/stdout stand-in for a chat platform.
//!
//! Every line typed is a message from the owner in the `console` chat;
//! outbound sends (scheduler deliveries, webhook fan-out) print with
//! their chat id so multi-chat routing stays visible.

use async_trait::async_trait;
use shipmate_core::adapters::{MessagingAdapter, SendOptions};
use shipmate_core::error::AdapterError;
use tokio::io::AsyncWriteExt;

/// The chat id the console session occupies.
pub const CONSOLE_CHAT_ID: &str = "console";

/// Prints outbound messages to stdout.
#[derive(Debug, Default)]
pub struct ConsoleMessenger;

#[async_trait]
impl MessagingAdapter for ConsoleMessenger {
    async fn send(&self, chat_id: &str, text: &str, _opts: SendOptions) -> Result<(), AdapterError> {
        let mut stdout = tokio::io::stdout();
        let line = if chat_id == CONSOLE_CHAT_ID {
            format!("{text}\n")
        } else {
            format!("[{chat_id}] {text}\n")
        };
        stdout
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AdapterError::Request {
                adapter: "console".into(),
                message: e.to_string(),
            })?;
        stdout.flush().await.map_err(|e| AdapterError::Request {
            adapter: "console".into(),
            message: e.to_string(),
        })
    }
}
