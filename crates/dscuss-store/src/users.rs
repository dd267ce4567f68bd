//! Storage for [`User`] entities.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use dscuss_shared::types::to_unix_nanos;
use dscuss_shared::{Id, PublicKey, Signature, User};

use crate::database::{get_id, get_time, wrap_conversion, EntityStore};
use crate::error::{Result, StoreError};

impl EntityStore {
    pub(crate) fn insert_user(&self, user: &User, stored: DateTime<Utc>) -> Result<bool> {
        let conn = self.writer()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO Users
                 (Id, PubKey, Proof, Nickname, Info, RegDate, Sig, TimeStored)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                user.id().as_bytes().as_slice(),
                user.pub_key().to_der(),
                user.proof() as i64,
                user.nickname(),
                user.info(),
                to_unix_nanos(&user.reg_date()),
                user.sig().as_bytes(),
                to_unix_nanos(&stored),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn put_user(&self, user: &User) -> Result<bool> {
        self.put_entity(&user.clone().into(), None)
    }

    pub fn get_user(&self, id: &Id) -> Result<User> {
        let user = self
            .reader()?
            .query_row(
                "SELECT Id, PubKey, Proof, Nickname, Info, RegDate, Sig
                 FROM Users WHERE Id = ?1",
                params![id.as_bytes().as_slice()],
                row_to_user,
            )
            .map_err(StoreError::from_query)?;
        user.map_err(|e| StoreError::InconsistentDb(format!("user {}: {e}", id.short())))
    }

    pub fn has_user(&self, id: &Id) -> Result<bool> {
        let found = self
            .reader()?
            .query_row(
                "SELECT 1 FROM Users WHERE Id = ?1",
                params![id.as_bytes().as_slice()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Every known user, ordered by nickname.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT Id, PubKey, Proof, Nickname, Info, RegDate, Sig
             FROM Users ORDER BY Nickname ASC",
        )?;
        let rows = stmt.query_map([], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?.map_err(|e| StoreError::InconsistentDb(e.to_string()))?);
        }
        Ok(users)
    }
}

/// Rows that no longer validate come back as the inner `Err`, so callers
/// can tell corruption from SQLite failures.
fn row_to_user(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<std::result::Result<User, dscuss_shared::EntityError>> {
    let id = get_id(row, 0)?;
    let der: Vec<u8> = row.get(1)?;
    let pub_key = PublicKey::from_der(&der).map_err(|e| wrap_conversion(1, e))?;
    let proof: i64 = row.get(2)?;
    let nickname: String = row.get(3)?;
    let info: String = row.get(4)?;
    let reg_date = get_time(row, 5)?;
    let sig_bytes: Vec<u8> = row.get(6)?;
    let sig = Signature::from_slice(&sig_bytes).map_err(|e| wrap_conversion(6, e))?;

    Ok(User::new_from_fields(
        id,
        pub_key,
        proof as u64,
        nickname,
        info,
        reg_date,
        sig,
    ))
}
