//! Conversation history rows. Append-only; pruning is by age, never id
//! reuse.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::{parse_ts, ts, Store};
use crate::error::StoreError;

/// Who said it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationRole {
    User,
    Assistant,
    System,
}

impl ConversationRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationRole::User => "user",
            ConversationRole::Assistant => "assistant",
            ConversationRole::System => "system",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "user" => Ok(ConversationRole::User),
            "assistant" => Ok(ConversationRole::Assistant),
            "system" => Ok(ConversationRole::System),
            other => Err(StoreError::InvalidField {
                field: "role".into(),
                message: other.to_string(),
            }),
        }
    }
}

/// One conversation line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub id: i64,
    pub user_id: String,
    pub role: ConversationRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Store {
    /// Append a conversation line. Content must be non-empty.
    pub fn append_conversation(
        &self,
        user_id: &str,
        role: ConversationRole,
        content: &str,
    ) -> Result<i64, StoreError> {
        if content.is_empty() {
            return Err(StoreError::InvalidField {
                field: "content".into(),
                message: "must be non-empty".into(),
            });
        }
        let conn = self.lock();
        conn.execute(
            "INSERT INTO conversations (user_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, role.as_str(), content, ts(Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The latest `n` lines for a user, oldest first.
    pub fn recent_conversations(
        &self,
        user_id: &str,
        n: usize,
    ) -> Result<Vec<ConversationEntry>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, role, content, created_at FROM conversations
             WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let mut rows: Vec<ConversationEntry> = stmt
            .query_map(params![user_id, n as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(id, user_id, role, content, created_at)| {
                Ok(ConversationEntry {
                    id,
                    user_id,
                    role: ConversationRole::parse(&role)?,
                    content,
                    created_at: parse_ts(&created_at)?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        rows.reverse();
        Ok(rows)
    }

    /// Keep only the latest `keep` lines for a user. Returns rows removed.
    pub fn prune_conversations(&self, user_id: &str, keep: usize) -> Result<usize, StoreError> {
        let conn = self.lock();
        let removed = conn.execute(
            "DELETE FROM conversations WHERE user_id = ?1 AND id NOT IN (
                 SELECT id FROM conversations WHERE user_id = ?1
                 ORDER BY id DESC LIMIT ?2
             )",
            params![user_id, keep as i64],
        )?;
        Ok(removed)
    }
}
