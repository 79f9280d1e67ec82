//! Identity store schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The SQLite
//! `user_version` pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::StoreError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "identity tables",
        r#"
        CREATE TABLE IF NOT EXISTS identities (
            id              TEXT PRIMARY KEY,
            username        TEXT NOT NULL UNIQUE,
            email           TEXT UNIQUE,
            first_name      TEXT,
            last_name       TEXT,
            enabled         INTEGER NOT NULL DEFAULT 0,
            email_verified  INTEGER NOT NULL DEFAULT 0,
            federation_link TEXT,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_identities_federation_link ON identities (federation_link);

        CREATE TABLE IF NOT EXISTS identity_attributes (
            identity_id TEXT    NOT NULL REFERENCES identities (id) ON DELETE CASCADE,
            name        TEXT    NOT NULL,
            position    INTEGER NOT NULL,
            value       TEXT    NOT NULL,
            PRIMARY KEY (identity_id, name, position)
        );

        CREATE TABLE IF NOT EXISTS clients (
            client_id   TEXT PRIMARY KEY,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS roles (
            scope       TEXT NOT NULL,
            name        TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            PRIMARY KEY (scope, name)
        );

        CREATE TABLE IF NOT EXISTS role_mappings (
            identity_id TEXT NOT NULL REFERENCES identities (id) ON DELETE CASCADE,
            scope       TEXT NOT NULL,
            name        TEXT NOT NULL,
            PRIMARY KEY (identity_id, scope, name),
            FOREIGN KEY (scope, name) REFERENCES roles (scope, name)
        );

        CREATE TABLE IF NOT EXISTS credentials (
            id              TEXT PRIMARY KEY,
            identity_id     TEXT    NOT NULL REFERENCES identities (id) ON DELETE CASCADE,
            credential_type TEXT    NOT NULL,
            value           TEXT    NOT NULL,
            algorithm       TEXT    NOT NULL,
            hash_iterations INTEGER NOT NULL,
            created_date    INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_credentials_identity ON credentials (identity_id);
        "#,
    ),
    (
        2,
        "run bookkeeping",
        r#"
        CREATE TABLE IF NOT EXISTS kv_state (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            action      TEXT NOT NULL,
            details     TEXT,
            success     INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_created_at ON audit_log (created_at);
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking identity store migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| StoreError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<u32, StoreError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), StoreError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
