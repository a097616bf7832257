use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

/// Current schema version. Bump and append to `MIGRATIONS` on change.
const CURRENT_VERSION: u32 = 1;

type MigrationFn = fn(&Connection) -> Result<()>;

/// Ordered migrations; index 0 = version 1.
const MIGRATIONS: &[MigrationFn] = &[migrate_v1];

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version     INTEGER NOT NULL,
            applied_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current = get_current_version(conn)?;
    if current >= CURRENT_VERSION {
        return Ok(());
    }

    for version in (current + 1)..=CURRENT_VERSION {
        let idx = (version - 1) as usize;
        info!("applying store migration v{version}");
        MIGRATIONS[idx](conn)?;
        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    }

    Ok(())
}

fn get_current_version(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Version 1: the identity keypair and the contact list. The settings table
/// is reserved for host-application preferences.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS keys (
            pubkey   BLOB NOT NULL,
            privkey  BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS contacts (
            id           INTEGER PRIMARY KEY,
            name         TEXT NOT NULL,
            pubkey       BLOB NOT NULL UNIQUE,
            static_host  TEXT
        );

        CREATE TABLE IF NOT EXISTS settings (
            key    TEXT PRIMARY KEY,
            value  TEXT
        );
        ",
    )?;
    Ok(())
}
