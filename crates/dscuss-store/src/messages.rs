//! Storage for [`Message`] entities and their topic tags.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use dscuss_shared::types::to_unix_nanos;
use dscuss_shared::{Id, Message, Signature, Thread, Topic};

use crate::database::{exists, get_id, get_time, wrap_conversion, EntityStore};
use crate::error::{Result, StoreError};

const MESSAGE_COLUMNS: &str = "Id, Subject, Text, AuthorId, ParentId, DateWritten, Sig";

/// Upper bound on parent hops when looking for a thread root.
const MAX_THREAD_DEPTH: usize = 10_000;

/// A `Messages` row before its tags are attached.
struct MessageRow {
    id: Id,
    subject: String,
    text: String,
    author_id: Id,
    parent_id: Id,
    date_written: DateTime<Utc>,
    sig: Signature,
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    let sig_bytes: Vec<u8> = row.get(6)?;
    Ok(MessageRow {
        id: get_id(row, 0)?,
        subject: row.get(1)?,
        text: row.get(2)?,
        author_id: get_id(row, 3)?,
        parent_id: get_id(row, 4)?,
        date_written: get_time(row, 5)?,
        sig: Signature::from_slice(&sig_bytes).map_err(|e| wrap_conversion(6, e))?,
    })
}

fn load_topic(conn: &Connection, id: &Id) -> Result<Option<Topic>> {
    let mut stmt = conn.prepare_cached(
        "SELECT t.Name FROM Tags t
         JOIN Message_Tags mt ON mt.Tag_id = t.Id
         WHERE mt.Message_id = ?1",
    )?;
    let tags = stmt
        .query_map(params![id.as_bytes().as_slice()], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    if tags.is_empty() {
        return Ok(None);
    }
    Topic::new(tags)
        .map(Some)
        .map_err(|e| StoreError::InconsistentDb(format!("message {}: {e}", id.short())))
}

fn finish(conn: &Connection, row: MessageRow) -> Result<Message> {
    let topic = load_topic(conn, &row.id)?;
    let id = row.id;
    Message::new_from_fields(
        row.id,
        row.subject,
        row.text,
        row.author_id,
        row.parent_id,
        row.date_written,
        topic,
        row.sig,
    )
    .map_err(|e| StoreError::InconsistentDb(format!("message {}: {e}", id.short())))
}

fn query_messages(conn: &Connection, sql: &str, args: Vec<Value>) -> Result<Vec<Message>> {
    let rows = {
        let mut stmt = conn.prepare(sql)?;
        let mapped = stmt.query_map(params_from_iter(args), row_to_message)?;
        mapped.collect::<rusqlite::Result<Vec<MessageRow>>>()?
    };
    rows.into_iter().map(|r| finish(conn, r)).collect()
}

/// Rows whose last column is `TimeStored`, paired with that time.
fn query_stored_messages(
    conn: &Connection,
    sql: &str,
    args: Vec<Value>,
) -> Result<Vec<(DateTime<Utc>, Message)>> {
    let rows = {
        let mut stmt = conn.prepare(sql)?;
        let mapped = stmt.query_map(params_from_iter(args), |row| {
            Ok((get_time(row, 7)?, row_to_message(row)?))
        })?;
        mapped.collect::<rusqlite::Result<Vec<_>>>()?
    };
    rows.into_iter()
        .map(|(stored, r)| finish(conn, r).map(|msg| (stored, msg)))
        .collect()
}

fn blob(id: &Id) -> Value {
    Value::Blob(id.as_bytes().to_vec())
}

impl EntityStore {
    /// Insert the message row and its tag links atomically. The author and,
    /// for replies, the parent must already be stored.
    pub(crate) fn insert_message(&self, msg: &Message, stored: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        if exists(&tx, "Messages", &msg.id())? {
            return Ok(false);
        }
        if !exists(&tx, "Users", &msg.author_id())? {
            tracing::debug!(msg = %msg.id().short(), author = %msg.author_id().short(), "message author unknown");
            return Err(StoreError::NoSuchEntity);
        }
        if !msg.is_root() && !exists(&tx, "Messages", &msg.parent_id())? {
            tracing::debug!(msg = %msg.id().short(), parent = %msg.parent_id().short(), "message parent unknown");
            return Err(StoreError::NoSuchEntity);
        }

        tx.execute(
            "INSERT INTO Messages
                 (Id, Subject, Text, AuthorId, ParentId, DateWritten, Sig, TimeStored)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                msg.id().as_bytes().as_slice(),
                msg.subject(),
                msg.text(),
                msg.author_id().as_bytes().as_slice(),
                msg.parent_id().as_bytes().as_slice(),
                to_unix_nanos(&msg.date_written()),
                msg.sig().as_bytes(),
                to_unix_nanos(&stored),
            ],
        )?;

        if let Some(topic) = msg.topic() {
            for tag in topic.tags() {
                tx.execute("INSERT OR IGNORE INTO Tags (Name) VALUES (?1)", params![tag])?;
                tx.execute(
                    "INSERT OR IGNORE INTO Message_Tags (Tag_id, Message_id)
                     SELECT Id, ?2 FROM Tags WHERE Name = ?1",
                    params![tag, msg.id().as_bytes().as_slice()],
                )?;
            }
        }

        tx.commit()?;
        Ok(true)
    }

    pub fn put_message(&self, msg: &Message) -> Result<bool> {
        self.put_entity(&msg.clone().into(), None)
    }

    pub fn get_message(&self, id: &Id) -> Result<Message> {
        let conn = self.reader()?;
        let row = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM Messages WHERE Id = ?1"),
                params![id.as_bytes().as_slice()],
                row_to_message,
            )
            .map_err(StoreError::from_query)?;
        finish(&conn, row)
    }

    pub fn has_message(&self, id: &Id) -> Result<bool> {
        let conn = self.reader()?;
        exists(&conn, "Messages", id)
    }

    /// Thread roots, oldest first.
    pub fn get_root_messages(&self, offset: u32, limit: u32) -> Result<Vec<Message>> {
        let conn = self.reader()?;
        query_messages(
            &conn,
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM Messages
                 WHERE ParentId = ?1
                 ORDER BY DateWritten ASC, Id ASC
                 LIMIT ?2 OFFSET ?3"
            ),
            vec![blob(&Id::ZERO), Value::from(limit), Value::from(offset)],
        )
    }

    /// Messages whose tag set includes every tag of `topic`, oldest first.
    pub fn get_topic_messages(&self, topic: &Topic, offset: u32, limit: u32) -> Result<Vec<Message>> {
        let tags: Vec<&str> = topic.tags().collect();
        let placeholders = vec!["?"; tags.len()].join(", ");
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM Messages
             WHERE Id IN (
                 SELECT mt.Message_id FROM Message_Tags mt
                 JOIN Tags t ON t.Id = mt.Tag_id
                 WHERE t.Name IN ({placeholders})
                 GROUP BY mt.Message_id
                 HAVING COUNT(DISTINCT t.Name) = ?
             )
             ORDER BY DateWritten ASC, Id ASC
             LIMIT ? OFFSET ?"
        );
        let mut args: Vec<Value> = tags.iter().map(|t| Value::Text(t.to_string())).collect();
        args.push(Value::from(tags.len() as i64));
        args.push(Value::from(limit));
        args.push(Value::from(offset));
        let conn = self.reader()?;
        query_messages(&conn, &sql, args)
    }

    /// Direct replies to `parent_id`, oldest first.
    pub fn get_replies(&self, parent_id: &Id) -> Result<Vec<Message>> {
        let conn = self.reader()?;
        query_messages(
            &conn,
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM Messages
                 WHERE ParentId = ?1
                 ORDER BY DateWritten ASC, Id ASC"
            ),
            vec![blob(parent_id)],
        )
    }

    /// Assemble the reply tree under `root_id`, breadth first.
    pub fn get_thread(&self, root_id: &Id) -> Result<Thread> {
        let mut thread = Thread::new(self.get_message(root_id)?);
        let mut queue = VecDeque::from([(Thread::ROOT, *root_id)]);
        while let Some((node, id)) = queue.pop_front() {
            for reply in self.get_replies(&id)? {
                let reply_id = reply.id();
                let child = thread
                    .add_reply(node, reply)
                    .ok_or_else(|| StoreError::InconsistentDb("thread node vanished".into()))?;
                queue.push_back((child, reply_id));
            }
        }
        Ok(thread)
    }

    /// Follow parent links up to the thread root.
    pub fn get_thread_root(&self, id: &Id) -> Result<Message> {
        let mut msg = self.get_message(id)?;
        for _ in 0..MAX_THREAD_DEPTH {
            if msg.is_root() {
                return Ok(msg);
            }
            msg = self.get_message(&msg.parent_id())?;
        }
        Err(StoreError::InconsistentDb(format!(
            "no root within {MAX_THREAD_DEPTH} hops of {}",
            id.short()
        )))
    }

    /// Messages stored strictly after `ts`, in storage order.
    pub fn get_messages_stored_after(&self, ts: DateTime<Utc>, limit: u32) -> Result<Vec<Message>> {
        let scanned = self.scan_messages_stored_after(ts, limit)?;
        Ok(scanned.into_iter().map(|(_, msg)| msg).collect())
    }

    /// [`get_messages_stored_after`](Self::get_messages_stored_after) with
    /// each message's `TimeStored`, for resuming a scan where it stopped.
    pub fn scan_messages_stored_after(
        &self,
        ts: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<(DateTime<Utc>, Message)>> {
        let conn = self.reader()?;
        query_stored_messages(
            &conn,
            &format!(
                "SELECT {MESSAGE_COLUMNS}, TimeStored FROM Messages
                 WHERE TimeStored > ?1
                 ORDER BY TimeStored ASC, rowid ASC
                 LIMIT ?2"
            ),
            vec![Value::from(to_unix_nanos(&ts)), Value::from(limit)],
        )
    }

    /// The earliest message stored no earlier than `ts - delta`, used to
    /// anchor incremental queries.
    pub fn get_nearest_message_id(&self, ts: DateTime<Utc>, delta: Duration) -> Result<Option<Id>> {
        let from = to_unix_nanos(&(ts - delta));
        let found = self
            .reader()?
            .query_row(
                "SELECT Id FROM Messages
                 WHERE TimeStored >= ?1
                 ORDER BY TimeStored ASC, rowid ASC
                 LIMIT 1",
                params![from],
                |row| get_id(row, 0),
            )
            .optional()?;
        Ok(found)
    }

    pub fn get_message_time_stored(&self, id: &Id) -> Result<DateTime<Utc>> {
        self.reader()?
            .query_row(
                "SELECT TimeStored FROM Messages WHERE Id = ?1",
                params![id.as_bytes().as_slice()],
                |row| get_time(row, 0),
            )
            .map_err(StoreError::from_query)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use crate::database::test_util::*;
    use crate::error::StoreError;
    use dscuss_shared::types::now;
    use dscuss_shared::{Id, Topic};

    #[test]
    fn test_put_get_root() {
        let f = fixture();
        let (key, alice) = user("alice");
        f.store.put_user(&alice).unwrap();
        let m = root(&key, &alice, "Subj", "linux,news");
        assert!(f.store.put_message(&m).unwrap());
        assert!(!f.store.put_message(&m).unwrap());

        let back = f.store.get_message(&m.id()).unwrap();
        assert_eq!(back, m);
        assert_eq!(back.topic().unwrap().to_string(), "linux,news");
        assert!(f.store.has_message(&m.id()).unwrap());
    }

    #[test]
    fn test_message_needs_author() {
        let f = fixture();
        let (key, alice) = user("alice");
        let m = root(&key, &alice, "Subj", "linux");
        assert!(matches!(f.store.put_message(&m), Err(StoreError::NoSuchEntity)));
        assert!(!f.store.has_message(&m.id()).unwrap());
    }

    #[test]
    fn test_reply_needs_parent() {
        let f = fixture();
        let (key, alice) = user("alice");
        f.store.put_user(&alice).unwrap();
        let r = root(&key, &alice, "Subj", "linux");
        let rep = reply(&key, &alice, &r, "Re");
        assert!(matches!(f.store.put_message(&rep), Err(StoreError::NoSuchEntity)));
        f.store.put_message(&r).unwrap();
        assert!(f.store.put_message(&rep).unwrap());
        assert_eq!(f.store.get_replies(&r.id()).unwrap(), vec![rep.clone()]);
        assert_eq!(f.store.get_thread_root(&rep.id()).unwrap(), r);
    }

    #[test]
    fn test_root_pagination() {
        let f = fixture();
        let (key, alice) = user("alice");
        f.store.put_user(&alice).unwrap();
        let msgs: Vec<_> = (0..5)
            .map(|i| root(&key, &alice, &format!("m{i}"), "linux"))
            .collect();
        for m in &msgs {
            f.store.put_message(m).unwrap();
        }
        let page = f.store.get_root_messages(1, 2).unwrap();
        assert_eq!(page, msgs[1..3].to_vec());
        assert_eq!(f.store.get_root_messages(0, 100).unwrap().len(), 5);
    }

    #[test]
    fn test_topic_messages_superset_match() {
        let f = fixture();
        let (key, alice) = user("alice");
        f.store.put_user(&alice).unwrap();
        let ln = root(&key, &alice, "ln", "linux,news");
        let l = root(&key, &alice, "l", "linux");
        let b = root(&key, &alice, "b", "bsd");
        for m in [&ln, &l, &b] {
            f.store.put_message(m).unwrap();
        }

        let linux: Topic = "linux".parse().unwrap();
        let got = f.store.get_topic_messages(&linux, 0, 10).unwrap();
        assert_eq!(got, vec![ln.clone(), l]);

        let both: Topic = "news,linux".parse().unwrap();
        assert_eq!(f.store.get_topic_messages(&both, 0, 10).unwrap(), vec![ln]);
    }

    #[test]
    fn test_thread_assembly() {
        let f = fixture();
        let (key, alice) = user("alice");
        f.store.put_user(&alice).unwrap();
        let r = root(&key, &alice, "root", "linux");
        let a = reply(&key, &alice, &r, "a");
        let a1 = reply(&key, &alice, &a, "a1");
        let b = reply(&key, &alice, &r, "b");
        for m in [&r, &a, &a1, &b] {
            f.store.put_message(m).unwrap();
        }

        let t = f.store.get_thread(&r.id()).unwrap();
        let subjects: Vec<&str> = t.messages().iter().map(|m| m.subject()).collect();
        assert_eq!(subjects, vec!["root", "a", "a1", "b"]);
    }

    #[test]
    fn test_stored_after_and_nearest() {
        let f = fixture();
        let (key, alice) = user("alice");
        f.store.put_user(&alice).unwrap();
        let base = now();
        let msgs: Vec<_> = (0..3)
            .map(|i| root(&key, &alice, &format!("m{i}"), "linux"))
            .collect();
        for (i, m) in msgs.iter().enumerate() {
            let at = base + Duration::seconds(i as i64);
            f.store.put_entity_at(&m.clone().into(), at, None).unwrap();
        }

        let after = f.store.get_messages_stored_after(base, 10).unwrap();
        assert_eq!(after, msgs[1..].to_vec());
        let all = f
            .store
            .get_messages_stored_after(base - Duration::seconds(1), 10)
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(f.store.get_messages_stored_after(base, 1).unwrap().len(), 1);

        let nearest = f
            .store
            .get_nearest_message_id(base + Duration::seconds(2), Duration::seconds(1))
            .unwrap();
        assert_eq!(nearest, Some(msgs[1].id()));
        assert_eq!(
            f.store
                .get_nearest_message_id(base + Duration::seconds(10), Duration::zero())
                .unwrap(),
            None
        );
        assert_eq!(
            f.store.get_message_time_stored(&msgs[2].id()).unwrap(),
            base + Duration::seconds(2)
        );
    }

    #[test]
    fn test_scan_resumes_from_cursor() {
        let f = fixture();
        let (key, alice) = user("alice");
        f.store.put_user(&alice).unwrap();
        let base = now();
        for i in 0..5 {
            let m = root(&key, &alice, &format!("m{i}"), "linux");
            let at = base + Duration::milliseconds(i);
            f.store.put_entity_at(&m.into(), at, None).unwrap();
        }

        let start = base - Duration::seconds(1);
        let first = f.store.scan_messages_stored_after(start, 2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].0, base + Duration::milliseconds(1));

        let rest = f.store.scan_messages_stored_after(first[1].0, 10).unwrap();
        assert_eq!(rest.len(), 3);
        let seen: Vec<Id> = first.iter().chain(&rest).map(|(_, m)| m.id()).collect();
        let all: Vec<Id> = f
            .store
            .get_messages_stored_after(start, 10)
            .unwrap()
            .iter()
            .map(|m| m.id())
            .collect();
        assert_eq!(seen, all);
    }

    #[test]
    fn test_missing_message() {
        let f = fixture();
        assert!(matches!(
            f.store.get_message(&Id::digest(b"x")),
            Err(StoreError::NoSuchEntity)
        ));
    }
}
