//! Storage for [`Operation`] entities and their links to the objects they
//! act on.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use dscuss_shared::types::to_unix_nanos;
use dscuss_shared::{Id, Operation, OperationType, Reason, Signature};

use crate::database::{exists, get_id, get_time, wrap_conversion, EntityStore};
use crate::error::{Result, StoreError};

const OPERATION_COLUMNS: &str =
    "o.Id, o.Type, o.Reason, o.Comment, o.AuthorId, o.ObjectId, o.DatePerformed, o.Sig";

type OperationRow = std::result::Result<Operation, dscuss_shared::EntityError>;

fn row_to_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<OperationRow> {
    let id = get_id(row, 0)?;
    let type_code: i64 = row.get(1)?;
    let reason_code: i64 = row.get(2)?;
    let comment: String = row.get(3)?;
    let author_id = get_id(row, 4)?;
    let object_id = get_id(row, 5)?;
    let date_performed = get_time(row, 6)?;
    let sig_bytes: Vec<u8> = row.get(7)?;
    let sig = Signature::from_slice(&sig_bytes).map_err(|e| wrap_conversion(7, e))?;

    let op_type = match OperationType::from_code(type_code) {
        Ok(t) => t,
        Err(e) => return Ok(Err(e)),
    };
    let reason = match Reason::from_code(reason_code) {
        Ok(r) => r,
        Err(e) => return Ok(Err(e)),
    };
    Ok(Operation::new_from_fields(
        id,
        op_type,
        reason,
        comment,
        author_id,
        object_id,
        date_performed,
        sig,
    ))
}

fn query_operations(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Operation>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, row_to_operation)?;

    let mut ops = Vec::new();
    for row in rows {
        ops.push(row?.map_err(|e| StoreError::InconsistentDb(format!("operation: {e}")))?);
    }
    Ok(ops)
}

fn query_stored_operations(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<(DateTime<Utc>, Operation)>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, |row| Ok((get_time(row, 8)?, row_to_operation(row)?)))?;

    let mut ops = Vec::new();
    for row in rows {
        let (stored, op) = row?;
        let op = op.map_err(|e| StoreError::InconsistentDb(format!("operation: {e}")))?;
        ops.push((stored, op));
    }
    Ok(ops)
}

impl EntityStore {
    /// Insert an operation and its object link. The object must already be
    /// stored and be of the kind the operation type acts on.
    pub(crate) fn insert_operation(&self, op: &Operation, stored: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        if exists(&tx, "Operations", &op.id())? {
            return Ok(false);
        }
        if !exists(&tx, "Users", &op.author_id())? {
            return Err(StoreError::NoSuchEntity);
        }
        let (object_table, link_sql) = match op.op_type() {
            OperationType::RemoveMessage => (
                "Messages",
                "INSERT OR IGNORE INTO Operations_on_Messages (Operation_id, Message_id)
                 VALUES (?1, ?2)",
            ),
            OperationType::BanUser => (
                "Users",
                "INSERT OR IGNORE INTO Operations_on_Users (Operation_id, User_id)
                 VALUES (?1, ?2)",
            ),
        };
        if !exists(&tx, object_table, &op.object_id())? {
            tracing::debug!(
                op = %op.id().short(),
                object = %op.object_id().short(),
                kind = object_table,
                "operation object unknown"
            );
            return Err(StoreError::NoSuchEntity);
        }

        tx.execute(
            "INSERT INTO Operations
                 (Id, Type, Reason, Comment, AuthorId, ObjectId, DatePerformed, Sig, TimeStored)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                op.id().as_bytes().as_slice(),
                op.op_type().code(),
                op.reason().code(),
                op.comment(),
                op.author_id().as_bytes().as_slice(),
                op.object_id().as_bytes().as_slice(),
                to_unix_nanos(&op.date_performed()),
                op.sig().as_bytes(),
                to_unix_nanos(&stored),
            ],
        )?;
        tx.execute(
            link_sql,
            params![op.id().as_bytes().as_slice(), op.object_id().as_bytes().as_slice()],
        )?;

        tx.commit()?;
        Ok(true)
    }

    pub fn put_operation(&self, op: &Operation) -> Result<bool> {
        self.put_entity(&op.clone().into(), None)
    }

    pub fn get_operation(&self, id: &Id) -> Result<Operation> {
        let op = self
            .reader()?
            .query_row(
                &format!("SELECT {OPERATION_COLUMNS} FROM Operations o WHERE o.Id = ?1"),
                params![id.as_bytes().as_slice()],
                row_to_operation,
            )
            .map_err(StoreError::from_query)?;
        op.map_err(|e| StoreError::InconsistentDb(format!("operation {}: {e}", id.short())))
    }

    pub fn has_operation(&self, id: &Id) -> Result<bool> {
        let conn = self.reader()?;
        exists(&conn, "Operations", id)
    }

    pub fn get_operations_on_user(&self, user_id: &Id) -> Result<Vec<Operation>> {
        let conn = self.reader()?;
        query_operations(
            &conn,
            &format!(
                "SELECT {OPERATION_COLUMNS} FROM Operations o
                 JOIN Operations_on_Users ou ON ou.Operation_id = o.Id
                 WHERE ou.User_id = ?1
                 ORDER BY o.DatePerformed ASC"
            ),
            &[&user_id.as_bytes().as_slice()],
        )
    }

    pub fn get_operations_on_message(&self, message_id: &Id) -> Result<Vec<Operation>> {
        let conn = self.reader()?;
        query_operations(
            &conn,
            &format!(
                "SELECT {OPERATION_COLUMNS} FROM Operations o
                 JOIN Operations_on_Messages om ON om.Operation_id = o.Id
                 WHERE om.Message_id = ?1
                 ORDER BY o.DatePerformed ASC"
            ),
            &[&message_id.as_bytes().as_slice()],
        )
    }

    /// Operations stored strictly after `ts`, in storage order.
    pub fn get_operations_stored_after(&self, ts: DateTime<Utc>, limit: u32) -> Result<Vec<Operation>> {
        let scanned = self.scan_operations_stored_after(ts, limit)?;
        Ok(scanned.into_iter().map(|(_, op)| op).collect())
    }

    pub fn scan_operations_stored_after(
        &self,
        ts: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<(DateTime<Utc>, Operation)>> {
        let conn = self.reader()?;
        query_stored_operations(
            &conn,
            &format!(
                "SELECT {OPERATION_COLUMNS}, o.TimeStored FROM Operations o
                 WHERE o.TimeStored > ?1
                 ORDER BY o.TimeStored ASC, o.rowid ASC
                 LIMIT ?2"
            ),
            &[&to_unix_nanos(&ts), &limit],
        )
    }
}
