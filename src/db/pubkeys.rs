//! Registered SSH public keys.  Rows are append-only; revocation deletes.

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::{known_dids::check_did, Db, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub did: String,
    pub name: String,
    pub key: String,
    pub created: String,
}

impl PublicKey {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            did: row.get(0)?,
            name: row.get(1)?,
            key: row.get(2)?,
            created: row.get(3)?,
        })
    }
}

/// Trimmed `key` if it is a single `<algorithm> <base64> [comment]` line.
///
/// Anything else could smuggle extra lines or options into `authorized_keys`.
pub fn check_public_key(key: &str) -> Result<&str, StoreError> {
    let key = key.trim();
    if key.chars().any(char::is_control) {
        return Err(StoreError::InvalidKey);
    }

    let mut parts = key.splitn(3, ' ');
    let algorithm = parts.next().unwrap_or_default();
    let blob = parts.next().unwrap_or_default();
    let algorithm_ok = !algorithm.is_empty()
        && algorithm
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '@'));
    let blob_ok = !blob.is_empty()
        && blob
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='));

    if algorithm_ok && blob_ok {
        Ok(key)
    } else {
        Err(StoreError::InvalidKey)
    }
}

impl Db {
    /// Register `key` for `did`.  Returns `false` if the exact
    /// `(did, name, key)` row already existed.
    #[instrument(skip(self, key), fields(%did, %name))]
    pub fn add_public_key(
        &self,
        did: &str,
        name: &str,
        key: &str,
        created: Option<&str>,
    ) -> Result<bool, StoreError> {
        check_did(did)?;
        let key = check_public_key(key)?;
        let created = match created {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        let inserted = self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO public_keys (did, name, key, created) VALUES (?1, ?2, ?3, ?4)",
                params![did, name, key, created],
            )
        })?;
        Ok(inserted > 0)
    }

    /// Delete every registration of `key` for `did`.
    pub fn remove_public_key(&self, did: &str, key: &str) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM public_keys WHERE did = ?1 AND key = ?2",
                params![did, key.trim()],
            )
        })
    }

    /// All registered keys in insertion order.
    pub fn public_keys(&self) -> Result<Vec<PublicKey>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT did, name, key, created FROM public_keys ORDER BY id")?;
            let keys = stmt
                .query_map([], PublicKey::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys)
        })
    }

    pub fn public_keys_for(&self, did: &str) -> Result<Vec<PublicKey>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT did, name, key, created FROM public_keys WHERE did = ?1 ORDER BY id",
            )?;
            let keys = stmt
                .query_map([did], PublicKey::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys)
        })
    }
}
