//! Tracked work items. Triggers keep `completed_at` in lockstep with the
//! `completed` status.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::{parse_ts, ts, Store};
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(StoreError::InvalidField {
                field: "status".into(),
                message: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Urgent => "urgent",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            "urgent" => Ok(TaskPriority::Urgent),
            other => Err(StoreError::InvalidField {
                field: "priority".into(),
                message: other.to_string(),
            }),
        }
    }
}

/// One tracked task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

const TASK_COLS: &str =
    "id, user_id, title, description, status, priority, due_date, created_at, completed_at";

type TaskRow = (
    i64,
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
);

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn build_task(raw: TaskRow) -> Result<Task, StoreError> {
    let (id, user_id, title, description, status, priority, due_date, created_at, completed_at) =
        raw;
    Ok(Task {
        id,
        user_id,
        title,
        description,
        status: TaskStatus::parse(&status)?,
        priority: TaskPriority::parse(&priority)?,
        due_date: due_date.as_deref().map(parse_ts).transpose()?,
        created_at: parse_ts(&created_at)?,
        completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
    })
}

impl Store {
    /// Insert a task. Title must be non-empty.
    pub fn insert_task(
        &self,
        user_id: &str,
        title: &str,
        description: Option<&str>,
        priority: TaskPriority,
        due_date: Option<DateTime<Utc>>,
    ) -> Result<i64, StoreError> {
        if title.is_empty() {
            return Err(StoreError::InvalidField {
                field: "title".into(),
                message: "must be non-empty".into(),
            });
        }
        let conn = self.lock();
        conn.execute(
            "INSERT INTO tasks (user_id, title, description, priority, due_date, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_id,
                title,
                description,
                priority.as_str(),
                due_date.map(ts),
                ts(Utc::now())
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Move a task to a new status. Triggers maintain `completed_at`.
    pub fn set_task_status(&self, id: i64, status: TaskStatus) -> Result<(), StoreError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE tasks SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        if changed == 0 {
            return Err(StoreError::RowNotFound {
                collection: "tasks".into(),
            });
        }
        Ok(())
    }

    /// Fetch one task.
    pub fn get_task(&self, id: i64) -> Result<Task, StoreError> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {TASK_COLS} FROM tasks WHERE id = ?1"),
                params![id],
                task_from_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::RowNotFound {
                    collection: "tasks".into(),
                },
                other => other.into(),
            })?;
        build_task(raw)
    }

    /// List a user's tasks, optionally filtered by status, urgent first
    /// then newest.
    pub fn list_tasks(
        &self,
        user_id: &str,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>, StoreError> {
        let conn = self.lock();
        let order = "ORDER BY CASE priority
                WHEN 'urgent' THEN 0 WHEN 'high' THEN 1
                WHEN 'medium' THEN 2 ELSE 3 END, id DESC";
        let raw: Vec<TaskRow> = match status {
            Some(s) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLS} FROM tasks WHERE user_id = ?1 AND status = ?2 {order}"
                ))?;
                let rows = stmt.query_map(params![user_id, s.as_str()], task_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLS} FROM tasks WHERE user_id = ?1 {order}"
                ))?;
                let rows = stmt.query_map(params![user_id], task_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        raw.into_iter().map(build_task).collect()
    }
}
