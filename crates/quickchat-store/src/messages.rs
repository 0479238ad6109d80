use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use quickchat_shared::types::{MessageId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{ChatMessage, NewMessage, UnseenCounts};

const SELECT_COLUMNS: &str =
    "SELECT id, sender_id, receiver_id, text, image, seen, created_at FROM messages";

impl Database {
    /// Persist a new message and return the stored record.
    ///
    /// Timestamps are kept at microsecond precision; the returned record
    /// carries the truncated value so it compares equal to what
    /// [`Database::history`] later reads back.
    pub fn append_message(&self, draft: NewMessage) -> Result<ChatMessage> {
        let micros = draft.created_at.unwrap_or_else(Utc::now).timestamp_micros();
        let created_at =
            DateTime::<Utc>::from_timestamp_micros(micros).ok_or(StoreError::Timestamp(micros))?;

        let message = ChatMessage {
            id: MessageId::new(),
            sender_id: draft.sender_id,
            receiver_id: draft.receiver_id,
            text: draft.text,
            image: draft.image,
            seen: false,
            created_at,
        };

        self.conn().execute(
            "INSERT INTO messages (id, sender_id, receiver_id, text, image, seen, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![
                message.id.0.to_string(),
                message.sender_id.as_str(),
                message.receiver_id.as_str(),
                message.text,
                message.image,
                micros,
            ],
        )?;

        Ok(message)
    }

    /// All messages exchanged between `a` and `b`, in either direction,
    /// oldest first. Messages with equal timestamps keep insertion order.
    pub fn history(&self, a: &UserId, b: &UserId) -> Result<Vec<ChatMessage>> {
        let sql = format!(
            "{SELECT_COLUMNS}
             WHERE (sender_id = ?1 AND receiver_id = ?2)
                OR (sender_id = ?2 AND receiver_id = ?1)
             ORDER BY created_at ASC, seq ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;

        let rows = stmt.query_map(params![a.as_str(), b.as_str()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Mark every unseen message sent by `from` to `to` as seen.
    ///
    /// Returns the number of messages that flipped. A second call returns 0.
    pub fn mark_seen(&self, from: &UserId, to: &UserId) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE messages SET seen = 1
             WHERE sender_id = ?1 AND receiver_id = ?2 AND seen = 0",
            params![from.as_str(), to.as_str()],
        )?;
        Ok(affected)
    }

    /// Number of unseen messages addressed to `receiver`, grouped by sender.
    pub fn unseen_counts(&self, receiver: &UserId) -> Result<UnseenCounts> {
        let mut stmt = self.conn().prepare(
            "SELECT sender_id, COUNT(*) FROM messages
             WHERE receiver_id = ?1 AND seen = 0
             GROUP BY sender_id",
        )?;

        let rows = stmt.query_map(params![receiver.as_str()], |row| {
            let sender: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((UserId(sender), count.max(0) as u64))
        })?;

        let mut counts = UnseenCounts::new();
        for row in rows {
            let (sender, count) = row?;
            counts.insert(sender, count);
        }
        Ok(counts)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let id_str: String = row.get(0)?;
    let sender_id: String = row.get(1)?;
    let receiver_id: String = row.get(2)?;
    let text: Option<String> = row.get(3)?;
    let image: Option<String> = row.get(4)?;
    let seen: bool = row.get(5)?;
    let micros: i64 = row.get(6)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let created_at = DateTime::<Utc>::from_timestamp_micros(micros).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Integer,
            Box::new(StoreError::Timestamp(micros)),
        )
    })?;

    Ok(ChatMessage {
        id: MessageId(id),
        sender_id: UserId(sender_id),
        receiver_id: UserId(receiver_id),
        text,
        image,
        seen,
        created_at,
    })
}
