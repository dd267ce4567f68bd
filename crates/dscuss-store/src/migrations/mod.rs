//! Schema migrations, guarded by `PRAGMA user_version`.

pub mod v001_initial;
pub mod v002_sync_cursors;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Migration = (u32, &'static str, fn(&Connection) -> rusqlite::Result<()>);

/// Applied in order; each entry bumps `user_version` to its number.
const MIGRATIONS: &[Migration] = &[
    (1, "v001_initial", v001_initial::up),
    (2, "v002_sync_cursors", v002_sync_cursors::up),
];

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|(v, _, _)| *v > current).collect();
    tracing::debug!(current, pending = pending.len(), "checking entity database schema");

    for (version, name, up) in pending {
        tracing::info!(migration = name, "applying schema migration");
        up(conn).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        conn.pragma_update(None, "user_version", version)?;
    }
    Ok(())
}
