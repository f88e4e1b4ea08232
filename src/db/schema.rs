//! SQLite schema definitions

use rusqlite::Connection;

pub const SCHEMA_VERSION: u32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        -- Positive grants: subject may perform action on objects matching
        -- the glob pattern, within domain.
        CREATE TABLE IF NOT EXISTS grants (
            subject TEXT NOT NULL,
            domain  TEXT NOT NULL CHECK (domain <> ''),
            object  TEXT NOT NULL,
            action  TEXT NOT NULL,
            PRIMARY KEY (subject, domain, object, action)
        );

        CREATE INDEX IF NOT EXISTS idx_grants_domain_action
            ON grants(domain, action);
        CREATE INDEX IF NOT EXISTS idx_grants_object
            ON grants(domain, object);

        -- subject inherits every grant of role within domain
        CREATE TABLE IF NOT EXISTS groupings (
            subject TEXT NOT NULL,
            role    TEXT NOT NULL,
            domain  TEXT NOT NULL CHECK (domain <> ''),
            PRIMARY KEY (subject, role, domain)
        );

        CREATE INDEX IF NOT EXISTS idx_groupings_role
            ON groupings(role, domain);

        CREATE TABLE IF NOT EXISTS public_keys (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            did     TEXT NOT NULL,
            name    TEXT NOT NULL,
            key     TEXT NOT NULL,
            created TEXT NOT NULL,
            UNIQUE (did, name, key)
        );

        CREATE TABLE IF NOT EXISTS known_dids (
            did TEXT PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS cursor (
            id      INTEGER PRIMARY KEY CHECK (id = 1),
            time_us INTEGER NOT NULL
        );
    "#,
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
