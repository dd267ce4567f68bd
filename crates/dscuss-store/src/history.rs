//! Peer history: one row per remote user, replaced on every disconnect.

use chrono::{DateTime, Utc};
use rusqlite::params;

use dscuss_shared::types::{from_unix_nanos, to_unix_nanos};
use dscuss_shared::{Id, Subscriptions};

use crate::database::{get_id, get_time, EntityStore};
use crate::error::{Result, StoreError};
use crate::models::UserHistory;

const HISTORY_COLUMNS: &str =
    "User_id, Disconnected, Subscriptions, MessagesCursor, OperationsCursor";

struct HistoryRow {
    user_id: Id,
    disconnected: DateTime<Utc>,
    subscriptions: String,
    messages_cursor: Option<i64>,
    operations_cursor: Option<i64>,
}

fn row_to_history(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRow> {
    Ok(HistoryRow {
        user_id: get_id(row, 0)?,
        disconnected: get_time(row, 1)?,
        subscriptions: row.get(2)?,
        messages_cursor: row.get(3)?,
        operations_cursor: row.get(4)?,
    })
}

fn finish(row: HistoryRow) -> Result<UserHistory> {
    let subscriptions: Subscriptions = serde_json::from_str(&row.subscriptions).map_err(|e| {
        StoreError::InconsistentDb(format!("history of {}: {e}", row.user_id.short()))
    })?;
    Ok(UserHistory {
        user_id: row.user_id,
        disconnected: row.disconnected,
        subscriptions,
        messages_cursor: row.messages_cursor.map(from_unix_nanos),
        operations_cursor: row.operations_cursor.map(from_unix_nanos),
    })
}

impl EntityStore {
    pub fn put_user_history(&self, history: &UserHistory) -> Result<()> {
        let subs = serde_json::to_string(&history.subscriptions)?;
        self.writer()?.execute(
            &format!(
                "INSERT OR REPLACE INTO User_History ({HISTORY_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5)"
            ),
            params![
                history.user_id.as_bytes().as_slice(),
                to_unix_nanos(&history.disconnected),
                subs,
                history.messages_cursor.as_ref().map(to_unix_nanos),
                history.operations_cursor.as_ref().map(to_unix_nanos),
            ],
        )?;
        tracing::debug!(
            user = %history.user_id.short(),
            resumable = history.messages_cursor.is_some() || history.operations_cursor.is_some(),
            "peer history recorded"
        );
        Ok(())
    }

    pub fn get_user_history(&self, user_id: &Id) -> Result<UserHistory> {
        let row = self
            .reader()?
            .query_row(
                &format!("SELECT {HISTORY_COLUMNS} FROM User_History WHERE User_id = ?1"),
                params![user_id.as_bytes().as_slice()],
                row_to_history,
            )
            .map_err(StoreError::from_query)?;
        finish(row)
    }

    /// Every history row, most recent disconnect first.
    pub fn list_user_history(&self) -> Result<Vec<UserHistory>> {
        let rows = {
            let conn = self.reader()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {HISTORY_COLUMNS} FROM User_History ORDER BY Disconnected DESC"
            ))?;
            let rows = stmt.query_map([], row_to_history)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        rows.into_iter().map(finish).collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use crate::database::test_util::fixture;
    use crate::error::StoreError;
    use crate::models::UserHistory;
    use dscuss_shared::types::now;
    use dscuss_shared::{Id, Subscriptions};

    #[test]
    fn test_history_replace() {
        let f = fixture();
        let id = Id::digest(b"bob");
        let first = UserHistory {
            user_id: id,
            disconnected: now(),
            subscriptions: Subscriptions::parse_lines("linux").unwrap(),
            messages_cursor: None,
            operations_cursor: None,
        };
        f.store.put_user_history(&first).unwrap();
        assert_eq!(f.store.get_user_history(&id).unwrap(), first);

        let second = UserHistory {
            disconnected: first.disconnected + Duration::minutes(5),
            subscriptions: Subscriptions::parse_lines("linux\nbsd").unwrap(),
            messages_cursor: Some(first.disconnected - Duration::hours(1)),
            ..first.clone()
        };
        f.store.put_user_history(&second).unwrap();
        assert_eq!(f.store.get_user_history(&id).unwrap(), second);
        assert_eq!(f.store.list_user_history().unwrap(), vec![second]);
    }

    #[test]
    fn test_history_missing() {
        let f = fixture();
        assert!(matches!(
            f.store.get_user_history(&Id::digest(b"nobody")),
            Err(StoreError::NoSuchEntity)
        ));
        assert!(f.store.list_user_history().unwrap().is_empty());
    }
}
