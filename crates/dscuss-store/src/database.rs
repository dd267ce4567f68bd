//! Entity database handle.
//!
//! [`EntityStore`] keeps two connections to `entities.db`: a single writer
//! (all inserts are serialised through it) and a reader used by every query,
//! so lookups never wait behind a long write transaction in WAL mode.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::mpsc;

use dscuss_shared::types::{self, Id};
use dscuss_shared::Entity;

use crate::error::{Result, StoreError};
use crate::migrations;

/// Handle returned by [`EntityStore::attach_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct Observer {
    id: ObserverId,
    tx: mpsc::Sender<Entity>,
}

pub struct EntityStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    observers: Mutex<Vec<Observer>>,
    next_observer: AtomicU64,
    path: PathBuf,
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).map_err(|e| StoreError::CantOpenDb {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

impl EntityStore {
    /// Open (or create) the entity database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "opening entity database");

        let writer = open_connection(path)?;
        migrations::run_migrations(&writer)?;
        let reader = open_connection(path)?;

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn writer(&self) -> Result<MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| StoreError::DbOperFailed("writer lock poisoned".into()))
    }

    pub(crate) fn reader(&self) -> Result<MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| StoreError::DbOperFailed("reader lock poisoned".into()))
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    /// Register a channel that receives every newly stored entity.
    pub fn attach_observer(&self, tx: mpsc::Sender<Entity>) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut observers) = self.observers.lock() {
            observers.push(Observer { id, tx });
        }
        tracing::debug!(observer = id.0, "observer attached");
        id
    }

    pub fn detach_observer(&self, id: ObserverId) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.retain(|o| o.id != id);
        }
        tracing::debug!(observer = id.0, "observer detached");
    }

    /// Deliver `entity` to every observer except `sender`. A full channel
    /// drops the notification for that observer only.
    pub(crate) fn notify(&self, entity: &Entity, sender: Option<ObserverId>) {
        let snapshot: Vec<(ObserverId, mpsc::Sender<Entity>)> = match self.observers.lock() {
            Ok(observers) => observers.iter().map(|o| (o.id, o.tx.clone())).collect(),
            Err(_) => return,
        };
        for (id, tx) in snapshot {
            if Some(id) == sender {
                continue;
            }
            if let Err(e) = tx.try_send(entity.clone()) {
                tracing::debug!(observer = id.0, entity = %entity, error = %e, "observer missed notification");
            }
        }
    }

    // ------------------------------------------------------------------
    // Generic write surface
    // ------------------------------------------------------------------

    /// Store `entity` stamped with the current time. Returns `true` if a new
    /// row was written; storing a known entity again is a no-op.
    pub fn put_entity(&self, entity: &Entity, sender: Option<ObserverId>) -> Result<bool> {
        self.put_entity_at(entity, types::now(), sender)
    }

    pub fn put_entity_at(
        &self,
        entity: &Entity,
        stored: DateTime<Utc>,
        sender: Option<ObserverId>,
    ) -> Result<bool> {
        let inserted = match entity {
            Entity::User(u) => self.insert_user(u, stored)?,
            Entity::Message(m) => self.insert_message(m, stored)?,
            Entity::Operation(o) => self.insert_operation(o, stored)?,
        };
        if inserted {
            tracing::debug!(entity = %entity, "entity stored");
            self.notify(entity, sender);
        }
        Ok(inserted)
    }

    /// Look up any entity kind by id.
    pub fn get_entity(&self, id: &Id) -> Result<Entity> {
        match self.get_user(id) {
            Ok(u) => return Ok(Entity::User(u)),
            Err(StoreError::NoSuchEntity) => {}
            Err(e) => return Err(e),
        }
        match self.get_message(id) {
            Ok(m) => return Ok(Entity::Message(m)),
            Err(StoreError::NoSuchEntity) => {}
            Err(e) => return Err(e),
        }
        self.get_operation(id).map(Entity::Operation)
    }

    pub fn has_entity(&self, id: &Id) -> Result<bool> {
        Ok(self.has_user(id)? || self.has_message(id)? || self.has_operation(id)?)
    }
}

// ----------------------------------------------------------------------
// Row helpers shared by the per-kind modules
// ----------------------------------------------------------------------

fn conversion_error<E>(idx: usize, ty: rusqlite::types::Type, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(e))
}

#[derive(Debug)]
struct BadLength(usize);

impl std::fmt::Display for BadLength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected 32 bytes, got {}", self.0)
    }
}

impl std::error::Error for BadLength {}

pub(crate) fn get_id(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Id> {
    let bytes: Vec<u8> = row.get(idx)?;
    Id::from_slice(&bytes)
        .ok_or_else(|| conversion_error(idx, rusqlite::types::Type::Blob, BadLength(bytes.len())))
}

pub(crate) fn get_time(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let nanos: i64 = row.get(idx)?;
    Ok(types::from_unix_nanos(nanos))
}

/// Whether `table` has a row with primary key `id`.
pub(crate) fn exists(conn: &Connection, table: &str, id: &Id) -> Result<bool> {
    let sql = format!("SELECT 1 FROM {table} WHERE Id = ?1");
    Ok(conn
        .query_row(&sql, params![id.as_bytes().as_slice()], |_| Ok(()))
        .optional()?
        .is_some())
}

pub(crate) fn wrap_conversion<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    conversion_error(idx, rusqlite::types::Type::Blob, e)
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use dscuss_shared::{Message, Operation, OperationType, PrivateKey, Reason, Topic, User};

    pub struct Fixture {
        pub dir: tempfile::TempDir,
        pub store: EntityStore,
    }

    pub fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = EntityStore::open(&dir.path().join("entities.db")).unwrap();
        Fixture { dir, store }
    }

    pub fn user(nick: &str) -> (PrivateKey, User) {
        let key = PrivateKey::generate();
        let user = User::emerge(&key, 0, nick, "", types::now()).unwrap();
        (key, user)
    }

    static TICK: AtomicU64 = AtomicU64::new(0);

    /// Strictly increasing dates so written-time order is deterministic.
    pub fn written() -> DateTime<Utc> {
        types::now() + chrono::Duration::milliseconds(TICK.fetch_add(1, Ordering::Relaxed) as i64)
    }

    pub fn root(key: &PrivateKey, author: &User, subject: &str, topic: &str) -> Message {
        let topic: Topic = topic.parse().unwrap();
        Message::emerge(key, author.id(), subject, "body", Id::ZERO, Some(topic), written())
            .unwrap()
    }

    pub fn reply(key: &PrivateKey, author: &User, parent: &Message, subject: &str) -> Message {
        Message::emerge(key, author.id(), subject, "body", parent.id(), None, written())
            .unwrap()
    }

    pub fn oper(key: &PrivateKey, author: &User, t: OperationType, object: Id) -> Operation {
        Operation::emerge(key, t, Reason::Spam, "", author.id(), object, types::now()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn test_open_twice_keeps_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entities.db");
        drop(EntityStore::open(&path).unwrap());
        let store = EntityStore::open(&path).unwrap();
        assert_eq!(store.path(), path.as_path());
    }

    #[tokio::test]
    async fn test_observers_skip_sender() {
        let f = fixture();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let a = f.store.attach_observer(tx_a);
        let _b = f.store.attach_observer(tx_b);

        let (_, alice) = user("alice");
        assert!(f.store.put_entity(&Entity::User(alice.clone()), Some(a)).unwrap());

        assert_eq!(rx_b.recv().await.unwrap().id(), alice.id());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_put_notifies_once() {
        let f = fixture();
        let (tx, mut rx) = mpsc::channel(4);
        f.store.attach_observer(tx);

        let (_, alice) = user("alice");
        let e = Entity::User(alice);
        assert!(f.store.put_entity(&e, None).unwrap());
        assert!(!f.store.put_entity(&e, None).unwrap());

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_observer_does_not_block() {
        let f = fixture();
        let (tx, _rx) = mpsc::channel(1);
        f.store.attach_observer(tx);
        for nick in ["a", "b", "c"] {
            let (_, u) = user(nick);
            assert!(f.store.put_entity(&Entity::User(u), None).unwrap());
        }
    }

    #[test]
    fn test_detach() {
        let f = fixture();
        let (tx, mut rx) = mpsc::channel(4);
        let id = f.store.attach_observer(tx);
        f.store.detach_observer(id);
        let (_, u) = user("alice");
        f.store.put_entity(&Entity::User(u), None).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_get_entity_any_kind() {
        let f = fixture();
        let (key, alice) = user("alice");
        let msg = root(&key, &alice, "hi", "linux");
        f.store.put_entity(&Entity::User(alice.clone()), None).unwrap();
        f.store.put_entity(&Entity::Message(msg.clone()), None).unwrap();

        assert_eq!(f.store.get_entity(&msg.id()).unwrap(), Entity::Message(msg));
        assert_eq!(f.store.get_entity(&alice.id()).unwrap(), Entity::User(alice));
        assert!(matches!(
            f.store.get_entity(&Id::digest(b"none")),
            Err(StoreError::NoSuchEntity)
        ));
    }
}
