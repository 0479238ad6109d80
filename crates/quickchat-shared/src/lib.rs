// Types shared between the store and the server: identities, the message
// record and the push-event wire format.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{AuthError, ProtocolError};
pub use protocol::{ChatMessage, ClientFrame, MessageBody, PushEvent};
pub use types::{ConnectionId, MessageId, UserId};
