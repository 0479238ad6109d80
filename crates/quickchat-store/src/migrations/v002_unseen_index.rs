use rusqlite::Connection;

// Partial index for mark-seen updates and per-peer unseen counters.
const UP_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_messages_unseen
    ON messages(receiver_id, sender_id)
    WHERE seen = 0;
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
