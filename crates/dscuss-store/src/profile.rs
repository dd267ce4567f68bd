//! Owner profile: the set of users trusted as moderators.
//!
//! The owner is always an implicit moderator and is never stored. Reads are
//! served from a cache that every write clears under the same lock.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use dscuss_shared::Id;

use crate::database::get_id;
use crate::error::{Result, StoreError};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS Moderator (User_id BLOB PRIMARY KEY NOT NULL)";

struct Inner {
    conn: Connection,
    cache: Option<Vec<Id>>,
}

pub struct ProfileStore {
    owner_id: Id,
    inner: Mutex<Inner>,
}

impl ProfileStore {
    pub fn open(path: &Path, owner_id: Id) -> Result<Self> {
        tracing::info!(path = %path.display(), "opening profile database");
        let conn = Connection::open(path).map_err(|e| StoreError::CantOpenDb {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            owner_id,
            inner: Mutex::new(Inner { conn, cache: None }),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::DbOperFailed("profile lock poisoned".into()))
    }

    pub fn owner_id(&self) -> Id {
        self.owner_id
    }

    pub fn add_moderator(&self, id: &Id) -> Result<()> {
        if *id == self.owner_id {
            return Err(StoreError::ForbiddenOperation);
        }
        let mut inner = self.lock()?;
        let changed = inner.conn.execute(
            "INSERT OR IGNORE INTO Moderator (User_id) VALUES (?1)",
            params![id.as_bytes().as_slice()],
        )?;
        inner.cache = None;
        if changed == 0 {
            return Err(StoreError::AlreadyModerator);
        }
        tracing::info!(moderator = %id.short(), "moderator added");
        Ok(())
    }

    pub fn remove_moderator(&self, id: &Id) -> Result<()> {
        if *id == self.owner_id {
            return Err(StoreError::ForbiddenOperation);
        }
        let mut inner = self.lock()?;
        let changed = inner.conn.execute(
            "DELETE FROM Moderator WHERE User_id = ?1",
            params![id.as_bytes().as_slice()],
        )?;
        inner.cache = None;
        if changed == 0 {
            return Err(StoreError::NoSuchModerator);
        }
        tracing::info!(moderator = %id.short(), "moderator removed");
        Ok(())
    }

    /// The owner first, then stored moderators in insertion order.
    pub fn get_moderators(&self) -> Result<Vec<Id>> {
        let mut inner = self.lock()?;
        if let Some(cached) = &inner.cache {
            return Ok(cached.clone());
        }

        let mut ids = vec![self.owner_id];
        {
            let mut stmt = inner
                .conn
                .prepare("SELECT User_id FROM Moderator ORDER BY rowid ASC")?;
            let rows = stmt.query_map([], |row| get_id(row, 0))?;
            for row in rows {
                ids.push(row?);
            }
        }
        inner.cache = Some(ids.clone());
        Ok(ids)
    }

    pub fn is_moderator(&self, id: &Id) -> Result<bool> {
        if *id == self.owner_id {
            return Ok(true);
        }
        Ok(self.get_moderators()?.contains(id))
    }

    /// Bypasses the cache; used to check what is durably stored.
    pub fn is_stored_moderator(&self, id: &Id) -> Result<bool> {
        let inner = self.lock()?;
        let found = inner
            .conn
            .query_row(
                "SELECT 1 FROM Moderator WHERE User_id = ?1",
                params![id.as_bytes().as_slice()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, ProfileStore, Id) {
        let dir = tempfile::tempdir().unwrap();
        let owner = Id::digest(b"owner");
        let store = ProfileStore::open(&dir.path().join("profile.db"), owner).unwrap();
        (dir, store, owner)
    }

    #[test]
    fn test_owner_is_implicit() {
        let (_dir, store, owner) = open();
        assert_eq!(store.get_moderators().unwrap(), vec![owner]);
        assert!(store.is_moderator(&owner).unwrap());
        assert!(matches!(store.add_moderator(&owner), Err(StoreError::ForbiddenOperation)));
        assert!(matches!(store.remove_moderator(&owner), Err(StoreError::ForbiddenOperation)));
        assert!(!store.is_stored_moderator(&owner).unwrap());
    }

    #[test]
    fn test_add_remove_invalidate_cache() {
        let (_dir, store, owner) = open();
        let a = Id::digest(b"a");
        assert!(!store.is_moderator(&a).unwrap());

        store.add_moderator(&a).unwrap();
        assert_eq!(store.get_moderators().unwrap(), vec![owner, a]);
        assert!(matches!(store.add_moderator(&a), Err(StoreError::AlreadyModerator)));

        store.remove_moderator(&a).unwrap();
        assert_eq!(store.get_moderators().unwrap(), vec![owner]);
        assert!(matches!(store.remove_moderator(&a), Err(StoreError::NoSuchModerator)));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.db");
        let owner = Id::digest(b"owner");
        let a = Id::digest(b"a");
        ProfileStore::open(&path, owner).unwrap().add_moderator(&a).unwrap();

        let reopened = ProfileStore::open(&path, owner).unwrap();
        assert!(reopened.is_moderator(&a).unwrap());
        assert!(reopened.is_stored_moderator(&a).unwrap());
    }
}
