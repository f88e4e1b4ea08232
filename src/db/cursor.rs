//! Persisted firehose cursor (microseconds since the epoch).

use rusqlite::OptionalExtension;

use super::{Db, StoreError};

impl Db {
    pub fn last_time_us(&self) -> Result<Option<i64>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT time_us FROM cursor WHERE id = 1", [], |row| row.get(0))
                .optional()
        })
    }

    /// Persist `time_us` unless a later cursor is already stored.  Returns the
    /// cursor now on disk.
    pub fn save_last_time_us(&self, time_us: i64) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cursor (id, time_us) VALUES (1, ?1)
                 ON CONFLICT (id) DO UPDATE SET time_us = MAX(time_us, excluded.time_us)",
                [time_us],
            )?;
            conn.query_row("SELECT time_us FROM cursor WHERE id = 1", [], |row| row.get(0))
        })
    }
}
