//! Async front for the SQLite message store.
//!
//! `rusqlite` is synchronous, so every call runs on the blocking pool behind
//! one mutex. Any failure of the backend surfaces as
//! [`ServerError::StoreUnavailable`].

use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::error;

use quickchat_shared::{ChatMessage, UserId};
use quickchat_store::{Database, NewMessage, StoreError, UnseenCounts};

use crate::error::ServerError;

#[derive(Clone)]
pub struct MessageStore {
    db: Arc<Mutex<Database>>,
}

impl MessageStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self, ServerError> {
        Database::open_at(path)
            .map(Self::new)
            .map_err(|e| unavailable("open", e))
    }

    pub fn in_memory() -> Result<Self, ServerError> {
        Database::open_in_memory()
            .map(Self::new)
            .map_err(|e| unavailable("open", e))
    }

    /// Persist a message; the returned record carries its id and timestamp.
    pub async fn append(&self, draft: NewMessage) -> Result<ChatMessage, ServerError> {
        self.run("append", move |db| db.append_message(draft)).await
    }

    /// Conversation between `a` and `b`, oldest first. Re-queried on every call.
    pub async fn history(&self, a: &UserId, b: &UserId) -> Result<Vec<ChatMessage>, ServerError> {
        let (a, b) = (a.clone(), b.clone());
        self.run("history", move |db| db.history(&a, &b)).await
    }

    /// Mark messages from `from` to `to` as seen. Returns how many flipped.
    pub async fn mark_seen(&self, from: &UserId, to: &UserId) -> Result<usize, ServerError> {
        let (from, to) = (from.clone(), to.clone());
        self.run("mark_seen", move |db| db.mark_seen(&from, &to)).await
    }

    pub async fn unseen_counts(&self, receiver: &UserId) -> Result<UnseenCounts, ServerError> {
        let receiver = receiver.clone();
        self.run("unseen_counts", move |db| db.unseen_counts(&receiver))
            .await
    }

    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, ServerError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> quickchat_store::Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|_| ServerError::StoreUnavailable("store lock poisoned".into()))?;
            f(&*guard).map_err(|e| unavailable(op, e))
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(e) => {
                error!(op, error = %e, "Store task failed");
                Err(ServerError::StoreUnavailable(e.to_string()))
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn with_db<T>(&self, f: impl FnOnce(&Database) -> T) -> T {
        f(&*self.db.lock().unwrap())
    }
}

fn unavailable(op: &'static str, err: StoreError) -> ServerError {
    error!(op, error = %err, "Message store operation failed");
    ServerError::StoreUnavailable(err.to_string())
}
