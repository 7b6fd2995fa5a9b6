//! Chat registration rows — the persisted half of the chat registry.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::{parse_ts, ts, Store};
use crate::error::StoreError;

/// What a chat is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Repo,
    Company,
    Hq,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::Repo => "repo",
            ChatType::Company => "company",
            ChatType::Hq => "hq",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "repo" => Ok(ChatType::Repo),
            "company" => Ok(ChatType::Company),
            "hq" => Ok(ChatType::Hq),
            other => Err(StoreError::InvalidField {
                field: "reg_type".into(),
                message: other.to_string(),
            }),
        }
    }
}

/// Per-chat delivery filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    All,
    Critical,
    Digest,
}

impl NotificationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationLevel::All => "all",
            NotificationLevel::Critical => "critical",
            NotificationLevel::Digest => "digest",
        }
    }

    /// Parse a user-supplied level name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(NotificationLevel::All),
            "critical" => Some(NotificationLevel::Critical),
            "digest" => Some(NotificationLevel::Digest),
            _ => None,
        }
    }
}

/// One registered chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRegistration {
    pub chat_id: String,
    pub chat_type: ChatType,
    /// Required for repo/company registrations; absent for hq.
    pub target: Option<String>,
    pub notifications: NotificationLevel,
    pub platform: String,
    pub label: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub registered_by: String,
}

const REG_COLS: &str =
    "chat_id, reg_type, target, notifications, platform, label, registered_at, registered_by";

type RegRow = (
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    String,
    String,
);

fn reg_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn build_reg(raw: RegRow) -> Result<ChatRegistration, StoreError> {
    let (chat_id, reg_type, target, notifications, platform, label, registered_at, registered_by) =
        raw;
    Ok(ChatRegistration {
        chat_id,
        chat_type: ChatType::parse(&reg_type)?,
        target,
        notifications: NotificationLevel::parse(&notifications).ok_or_else(|| {
            StoreError::InvalidField {
                field: "notifications".into(),
                message: notifications.clone(),
            }
        })?,
        platform,
        label,
        registered_at: parse_ts(&registered_at)?,
        registered_by,
    })
}

impl Store {
    /// Insert or replace a chat registration (a chat has at most one).
    pub fn put_registration(&self, reg: &ChatRegistration) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO chat_registrations
             (chat_id, reg_type, target, notifications, platform, label, registered_at, registered_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                reg.chat_id,
                reg.chat_type.as_str(),
                reg.target,
                reg.notifications.as_str(),
                reg.platform,
                reg.label,
                ts(reg.registered_at),
                reg.registered_by
            ],
        )?;
        Ok(())
    }

    /// Fetch a chat's registration, if any.
    pub fn get_registration(&self, chat_id: &str) -> Result<Option<ChatRegistration>, StoreError> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {REG_COLS} FROM chat_registrations WHERE chat_id = ?1"),
                params![chat_id],
                reg_from_row,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StoreError::from(other)),
            })?;
        raw.map(build_reg).transpose()
    }

    /// Remove a chat's registration. Returns whether a row existed.
    pub fn delete_registration(&self, chat_id: &str) -> Result<bool, StoreError> {
        let conn = self.lock();
        let changed = conn.execute(
            "DELETE FROM chat_registrations WHERE chat_id = ?1",
            params![chat_id],
        )?;
        Ok(changed > 0)
    }

    /// All registrations, stable by chat id.
    pub fn list_registrations(&self) -> Result<Vec<ChatRegistration>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REG_COLS} FROM chat_registrations ORDER BY chat_id"
        ))?;
        let raw: Vec<RegRow> = stmt
            .query_map([], reg_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(build_reg).collect()
    }

    /// Update just the notification level.
    pub fn set_registration_notifications(
        &self,
        chat_id: &str,
        level: NotificationLevel,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE chat_registrations SET notifications = ?1 WHERE chat_id = ?2",
            params![level.as_str(), chat_id],
        )?;
        if changed == 0 {
            return Err(StoreError::RowNotFound {
                collection: "chat_registrations".into(),
            });
        }
        Ok(())
    }
}
