use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{EVENT_NEW_MESSAGE, EVENT_ONLINE_USERS};
use crate::error::ProtocolError;
use crate::types::{MessageId, UserId};

/// A persisted direct message, as returned by the REST surface and pushed
/// over live connections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// URL returned by the media host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub seen: bool,
    pub created_at: DateTime<Utc>,
}

/// Client-supplied content of a new message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageBody {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            image: None,
        }
    }

    /// Drops blank fields so an all-whitespace text counts as absent.
    pub fn normalized(self) -> Self {
        fn keep(field: Option<String>) -> Option<String> {
            field.filter(|s| !s.trim().is_empty())
        }
        Self {
            text: keep(self.text),
            image: keep(self.image),
        }
    }

    pub fn is_empty(&self) -> bool {
        let blank = |f: &Option<String>| f.as_deref().map_or(true, |s| s.trim().is_empty());
        blank(&self.text) && blank(&self.image)
    }
}

/// Server -> client events on a persistent connection. There is no client
/// acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    NewMessage(ChatMessage),
    OnlineUsers(Vec<UserId>),
}

#[derive(Serialize)]
struct EventFrame<'a, T: Serialize> {
    event: &'a str,
    data: &'a T,
}

impl PushEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::NewMessage(_) => EVENT_NEW_MESSAGE,
            PushEvent::OnlineUsers(_) => EVENT_ONLINE_USERS,
        }
    }

    /// Encode as a `{"event": ..., "data": ...}` JSON text frame.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let encoded = match self {
            PushEvent::NewMessage(msg) => serde_json::to_string(&EventFrame {
                event: self.name(),
                data: msg,
            }),
            PushEvent::OnlineUsers(users) => serde_json::to_string(&EventFrame {
                event: self.name(),
                data: users,
            }),
        };
        encoded.map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Frames a client may send on its persistent connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    /// Presents the credential when it was not attached to the upgrade
    /// request. Only valid while handshaking.
    Auth { token: String },
    Ping,
}

impl ClientFrame {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }
}
