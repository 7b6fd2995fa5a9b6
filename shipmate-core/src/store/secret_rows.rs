//! Secret rows. The store holds only ciphertext; the cipher lives in
//! [`crate::secrets`].

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::{parse_ts, ts, Store};
use crate::error::StoreError;

/// One stored secret (ciphertext only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRow {
    pub name: String,
    pub encrypted_value: String,
    pub encryption_key_id: String,
    pub owner_user_id: String,
    pub updated_at: DateTime<Utc>,
}

impl Store {
    /// Insert or replace a secret row.
    pub fn put_secret(
        &self,
        name: &str,
        encrypted_value: &str,
        encryption_key_id: &str,
        owner_user_id: &str,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO secrets
             (name, encrypted_value, encryption_key_id, owner_user_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, encrypted_value, encryption_key_id, owner_user_id, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Fetch a secret row by name.
    pub fn get_secret(&self, name: &str) -> Result<Option<SecretRow>, StoreError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT name, encrypted_value, encryption_key_id, owner_user_id, updated_at
             FROM secrets WHERE name = ?1",
            params![name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(StoreError::from(other)),
        })?
        .map(|(name, encrypted_value, encryption_key_id, owner_user_id, updated_at)| {
            Ok(SecretRow {
                name,
                encrypted_value,
                encryption_key_id,
                owner_user_id,
                updated_at: parse_ts(&updated_at)?,
            })
        })
        .transpose()
    }

    /// Delete a secret row. Returns whether it existed.
    pub fn delete_secret(&self, name: &str) -> Result<bool, StoreError> {
        let conn = self.lock();
        let changed = conn.execute("DELETE FROM secrets WHERE name = ?1", params![name])?;
        Ok(changed > 0)
    }

    /// Names of all stored secrets (values never leave encrypted form here).
    pub fn list_secret_names(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT name FROM secrets ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let store = Store::open_in_memory().unwrap();
        store.put_secret("gh-token", "ciphertext", "k1", "u1").unwrap();

        let row = store.get_secret("gh-token").unwrap().unwrap();
        assert_eq!(row.encrypted_value, "ciphertext");
        assert_eq!(row.encryption_key_id, "k1");

        assert_eq!(store.list_secret_names().unwrap(), vec!["gh-token"]);
        assert!(store.delete_secret("gh-token").unwrap());
        assert!(store.get_secret("gh-token").unwrap().is_none());
    }

    #[test]
    fn test_replace_updates_value() {
        let store = Store::open_in_memory().unwrap();
        store.put_secret("s", "old", "k1", "u1").unwrap();
        store.put_secret("s", "new", "k2", "u1").unwrap();
        let row = store.get_secret("s").unwrap().unwrap();
        assert_eq!(row.encrypted_value, "new");
        assert_eq!(row.encryption_key_id, "k2");
    }
}
