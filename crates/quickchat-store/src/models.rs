//! Records handled by the store.
//!
//! Persisted messages use the shared [`ChatMessage`] type directly so the
//! record a client receives over a push is the same one `history` returns.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use quickchat_shared::protocol::ChatMessage;
use quickchat_shared::protocol::MessageBody;
use quickchat_shared::types::UserId;

/// A message that has not been written yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub text: Option<String>,
    pub image: Option<String>,
    /// Assigned by the store when absent.
    pub created_at: Option<DateTime<Utc>>,
}

impl NewMessage {
    pub fn new(sender_id: UserId, receiver_id: UserId, body: MessageBody) -> Self {
        let body = body.normalized();
        Self {
            sender_id,
            receiver_id,
            text: body.text,
            image: body.image,
            created_at: None,
        }
    }
}

/// Unseen message count per sender, for one receiver.
pub type UnseenCounts = BTreeMap<UserId, u64>;
