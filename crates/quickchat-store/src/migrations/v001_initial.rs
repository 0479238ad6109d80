//! v001 -- Initial schema creation.
//!
//! Creates the `messages` table. `seq` is the insertion order and breaks ties
//! between messages that share a creation timestamp.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    id           TEXT NOT NULL UNIQUE,        -- UUID v4
    sender_id    TEXT NOT NULL,
    receiver_id  TEXT NOT NULL,
    text         TEXT,
    image        TEXT,                        -- media host URL
    seen         INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    created_at   INTEGER NOT NULL             -- unix microseconds, UTC
);

CREATE INDEX IF NOT EXISTS idx_messages_pair_ts
    ON messages(sender_id, receiver_id, created_at, seq);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
