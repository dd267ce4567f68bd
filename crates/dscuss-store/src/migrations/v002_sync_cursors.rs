//! v002 -- Per-peer sync cursors.
//!
//! A sync turn that stops before draining its window leaves the
//! `TimeStored` of the last entity it got through, one column per kind.
//! NULL means the last turn drained everything.

use rusqlite::Connection;

const UP_SQL: &str = r#"
ALTER TABLE User_History ADD COLUMN MessagesCursor   INTEGER;
ALTER TABLE User_History ADD COLUMN OperationsCursor INTEGER;
"#;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
