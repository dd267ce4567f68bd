//! v001 -- Initial schema.
//!
//! Ids and keys are raw BLOBs, timestamps are INTEGER Unix nanoseconds so
//! that ordering and range queries work directly in SQL.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS Users (
    Id          BLOB PRIMARY KEY NOT NULL,  -- SHA-256 of PubKey
    PubKey      BLOB NOT NULL,              -- SPKI DER
    Proof       INTEGER NOT NULL,           -- u64 nonce, bit-cast to i64
    Nickname    TEXT NOT NULL,
    Info        TEXT NOT NULL,
    RegDate     INTEGER NOT NULL,
    Sig         BLOB NOT NULL,
    TimeStored  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS Messages (
    Id          BLOB PRIMARY KEY NOT NULL,
    Subject     TEXT NOT NULL,
    Text        TEXT NOT NULL,
    AuthorId    BLOB NOT NULL REFERENCES Users(Id),
    ParentId    BLOB NOT NULL,              -- zero id for thread roots
    DateWritten INTEGER NOT NULL,
    Sig         BLOB NOT NULL,
    TimeStored  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_parent ON Messages (ParentId, DateWritten);
CREATE INDEX IF NOT EXISTS idx_messages_stored ON Messages (TimeStored);

CREATE TABLE IF NOT EXISTS Tags (
    Id   INTEGER PRIMARY KEY AUTOINCREMENT,
    Name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS Message_Tags (
    Tag_id     INTEGER NOT NULL REFERENCES Tags(Id),
    Message_id BLOB NOT NULL REFERENCES Messages(Id),
    UNIQUE (Tag_id, Message_id)
);

CREATE TABLE IF NOT EXISTS Operations (
    Id            BLOB PRIMARY KEY NOT NULL,
    Type          INTEGER NOT NULL,
    Reason        INTEGER NOT NULL,
    Comment       TEXT NOT NULL,
    AuthorId      BLOB NOT NULL REFERENCES Users(Id),
    ObjectId      BLOB NOT NULL,
    DatePerformed INTEGER NOT NULL,
    Sig           BLOB NOT NULL,
    TimeStored    INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_operations_stored ON Operations (TimeStored);

CREATE TABLE IF NOT EXISTS Operations_on_Messages (
    Operation_id BLOB NOT NULL REFERENCES Operations(Id),
    Message_id   BLOB NOT NULL REFERENCES Messages(Id),
    UNIQUE (Operation_id, Message_id)
);

CREATE TABLE IF NOT EXISTS Operations_on_Users (
    Operation_id BLOB NOT NULL REFERENCES Operations(Id),
    User_id      BLOB NOT NULL REFERENCES Users(Id),
    UNIQUE (Operation_id, User_id)
);

CREATE TABLE IF NOT EXISTS User_History (
    User_id       BLOB PRIMARY KEY NOT NULL,
    Disconnected  INTEGER NOT NULL,
    Subscriptions TEXT NOT NULL           -- JSON array of topic strings
);
"#;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
