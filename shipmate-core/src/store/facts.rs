//! Remembered facts about the operator. `updated_at` is bumped by a
//! write-time trigger on any row mutation.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::{parse_ts, ts, Store};
use crate::error::StoreError;

/// One remembered fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: i64,
    pub user_id: String,
    pub category: String,
    pub fact: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn fact_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, String, String, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn build_fact(
    (id, user_id, category, fact, source, created_at, updated_at): (
        i64,
        String,
        String,
        String,
        String,
        String,
        String,
    ),
) -> Result<Fact, StoreError> {
    Ok(Fact {
        id,
        user_id,
        category,
        fact,
        source,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

const FACT_COLS: &str = "id, user_id, category, fact, source, created_at, updated_at";

impl Store {
    /// Insert a fact. Category defaults to "general" when empty.
    pub fn insert_fact(
        &self,
        user_id: &str,
        category: &str,
        fact: &str,
        source: &str,
    ) -> Result<i64, StoreError> {
        if fact.is_empty() {
            return Err(StoreError::InvalidField {
                field: "fact".into(),
                message: "must be non-empty".into(),
            });
        }
        let category = if category.is_empty() { "general" } else { category };
        let now = ts(Utc::now());
        let conn = self.lock();
        conn.execute(
            "INSERT INTO facts (user_id, category, fact, source, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![user_id, category, fact, source, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Update a fact's text. The trigger bumps `updated_at`.
    pub fn update_fact(&self, id: i64, new_text: &str) -> Result<(), StoreError> {
        if new_text.is_empty() {
            return Err(StoreError::InvalidField {
                field: "fact".into(),
                message: "must be non-empty".into(),
            });
        }
        let conn = self.lock();
        let changed = conn.execute("UPDATE facts SET fact = ?1 WHERE id = ?2", params![new_text, id])?;
        if changed == 0 {
            return Err(StoreError::RowNotFound {
                collection: "facts".into(),
            });
        }
        Ok(())
    }

    /// Fetch one fact.
    pub fn get_fact(&self, id: i64) -> Result<Fact, StoreError> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {FACT_COLS} FROM facts WHERE id = ?1"),
                params![id],
                fact_from_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::RowNotFound {
                    collection: "facts".into(),
                },
                other => other.into(),
            })?;
        build_fact(raw)
    }

    /// List a user's facts, optionally by category, newest first.
    pub fn list_facts(&self, user_id: &str, category: Option<&str>) -> Result<Vec<Fact>, StoreError> {
        let conn = self.lock();
        let raw: Vec<_> = match category {
            Some(cat) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {FACT_COLS} FROM facts WHERE user_id = ?1 AND category = ?2
                     ORDER BY updated_at DESC"
                ))?;
                let rows = stmt.query_map(params![user_id, cat], fact_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {FACT_COLS} FROM facts WHERE user_id = ?1 ORDER BY updated_at DESC"
                ))?;
                let rows = stmt.query_map(params![user_id], fact_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        raw.into_iter().map(build_fact).collect()
    }

    /// Delete a fact.
    pub fn delete_fact(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.lock();
        let changed = conn.execute("DELETE FROM facts WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StoreError::RowNotFound {
                collection: "facts".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_defaults_category() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_fact("u1", "", "likes espresso", "chat").unwrap();
        let fact = store.get_fact(id).unwrap();
        assert_eq!(fact.category, "general");
        assert_eq!(fact.created_at, fact.updated_at);
    }

    #[test]
    fn test_update_bumps_updated_at() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_fact("u1", "prefs", "likes espresso", "chat").unwrap();
        let before = store.get_fact(id).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        store.update_fact(id, "switched to tea").unwrap();

        let after = store.get_fact(id).unwrap();
        assert_eq!(after.fact, "switched to tea");
        assert!(after.updated_at > before.updated_at);
        assert!(after.updated_at >= after.created_at);
    }

    #[test]
    fn test_list_by_category() {
        let store = Store::open_in_memory().unwrap();
        store.insert_fact("u1", "prefs", "a", "s").unwrap();
        store.insert_fact("u1", "work", "b", "s").unwrap();
        store.insert_fact("u1", "prefs", "c", "s").unwrap();

        assert_eq!(store.list_facts("u1", Some("prefs")).unwrap().len(), 2);
        assert_eq!(store.list_facts("u1", None).unwrap().len(), 3);
    }

    #[test]
    fn test_missing_fact_not_found() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.get_fact(99),
            Err(StoreError::RowNotFound { .. })
        ));
        assert!(store.update_fact(99, "x").is_err());
        assert!(store.delete_fact(99).is_err());
    }
}
