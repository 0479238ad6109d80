//! Presence registry and online-set broadcaster.
//!
//! The registry maps each online user to the one connection currently
//! allowed to receive pushes for them. All access goes through a single
//! lock; nothing awaits network I/O while holding it. Pushes use a cloned
//! [`ConnectionHandle`] after the lock is released.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info};

use quickchat_shared::constants::CONNECTION_QUEUE_DEPTH;
use quickchat_shared::{ConnectionId, PushEvent, UserId};

/// Why a push did not reach a connection. Logged, never returned to a sender.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushError {
    #[error("connection closed")]
    Closed,

    #[error("push timed out after {0:?}")]
    TimedOut(Duration),
}

/// Sending side of one live, authenticated connection.
///
/// Cloning the handle does not clone the connection: every clone feeds the
/// same outbound queue, drained by the connection's writer task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user: UserId,
    tx: mpsc::Sender<PushEvent>,
}

impl ConnectionHandle {
    /// Create a handle for `user` plus the receiver its writer task drains.
    pub fn new(user: UserId) -> (Self, mpsc::Receiver<PushEvent>) {
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE_DEPTH);
        let handle = Self {
            id: ConnectionId::new(),
            user,
            tx,
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Queue an event for this connection, waiting at most `timeout` for
    /// room in the queue.
    pub async fn push(&self, event: PushEvent, timeout: Duration) -> Result<(), PushError> {
        self.tx.send_timeout(event, timeout).await.map_err(|e| match e {
            mpsc::error::SendTimeoutError::Timeout(_) => PushError::TimedOut(timeout),
            mpsc::error::SendTimeoutError::Closed(_) => PushError::Closed,
        })
    }
}

/// Latest-value broadcast of the online set.
///
/// Backed by a `watch` channel: a burst of changes coalesces into whatever
/// snapshot a slow connection reads next, and the last value always equals
/// the registry's final state.
#[derive(Clone)]
pub struct PresenceBroadcaster {
    tx: Arc<watch::Sender<Arc<Vec<UserId>>>>,
}

impl PresenceBroadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Vec::new()));
        Self { tx: Arc::new(tx) }
    }

    /// Publish a new online set to every subscribed connection.
    pub fn announce(&self, online: &BTreeSet<UserId>) {
        let snapshot: Vec<UserId> = online.iter().cloned().collect();
        let receivers = self.tx.receiver_count();
        self.tx.send_replace(Arc::new(snapshot));
        debug!(online = online.len(), receivers, "Announced online users");
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<UserId>>> {
        self.tx.subscribe()
    }

    /// The most recently announced set.
    pub fn latest(&self) -> Arc<Vec<UserId>> {
        self.tx.borrow().clone()
    }
}

impl Default for PresenceBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Who is online right now, and through which connection.
#[derive(Clone)]
pub struct PresenceRegistry {
    connections: Arc<RwLock<HashMap<UserId, ConnectionHandle>>>,
    broadcaster: PresenceBroadcaster,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            broadcaster: PresenceBroadcaster::new(),
        }
    }

    /// Insert or replace the mapping for the handle's user, then announce.
    ///
    /// Returns the handle that was displaced, if any. The displaced
    /// connection is not closed here; it simply stops receiving pushes.
    pub async fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut connections = self.connections.write().await;
        let user = handle.user().clone();
        let conn = handle.id();
        let replaced = connections.insert(user.clone(), handle);

        // Announcing under the lock keeps announcements in mutation order.
        self.broadcaster.announce(&snapshot_of(&connections));
        drop(connections);

        match &replaced {
            Some(old) => info!(
                user = %user,
                conn = %conn,
                replaced = %old.id(),
                "Connection replaced an existing session"
            ),
            None => info!(user = %user, conn = %conn, "User online"),
        }

        replaced
    }

    /// Remove `handle` if it is still the registered connection for its
    /// user. A stale handle (already replaced) is a silent no-op.
    ///
    /// Returns whether the mapping was removed.
    pub async fn unregister(&self, handle: &ConnectionHandle) -> bool {
        let mut connections = self.connections.write().await;
        let is_current = connections
            .get(handle.user())
            .is_some_and(|current| current.id() == handle.id());

        if !is_current {
            debug!(
                user = %handle.user(),
                conn = %handle.id(),
                "Ignoring unregister of stale connection"
            );
            return false;
        }

        connections.remove(handle.user());
        self.broadcaster.announce(&snapshot_of(&connections));
        drop(connections);

        info!(user = %handle.user(), conn = %handle.id(), "User offline");
        true
    }

    /// The live connection for `user`, if online.
    pub async fn lookup(&self, user: &UserId) -> Option<ConnectionHandle> {
        self.connections.read().await.get(user).cloned()
    }

    /// Whether `handle` is still the registered connection for its user.
    pub async fn is_current(&self, handle: &ConnectionHandle) -> bool {
        self.connections
            .read()
            .await
            .get(handle.user())
            .is_some_and(|current| current.id() == handle.id())
    }

    /// The current online set.
    pub async fn snapshot(&self) -> BTreeSet<UserId> {
        snapshot_of(&*self.connections.read().await)
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<UserId>>> {
        self.broadcaster.subscribe()
    }

    pub fn broadcaster(&self) -> &PresenceBroadcaster {
        &self.broadcaster
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot_of(connections: &HashMap<UserId, ConnectionHandle>) -> BTreeSet<UserId> {
    connections.keys().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId::from(id)
    }

    #[tokio::test]
    async fn test_register_lookup_unregister() {
        let registry = PresenceRegistry::new();
        let (handle, _rx) = ConnectionHandle::new(user("u1"));

        assert!(registry.register(handle.clone()).await.is_none());
        let found = registry.lookup(&user("u1")).await.unwrap();
        assert_eq!(found.id(), handle.id());

        assert!(registry.unregister(&handle).await);
        assert!(registry.lookup(&user("u1")).await.is_none());
        assert!(!registry.unregister(&handle).await);
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_newer_connection() {
        let registry = PresenceRegistry::new();
        let (old, _old_rx) = ConnectionHandle::new(user("u1"));
        let (new, _new_rx) = ConnectionHandle::new(user("u1"));

        registry.register(old.clone()).await;
        let replaced = registry.register(new.clone()).await.unwrap();
        assert_eq!(replaced.id(), old.id());

        // Late disconnect of the replaced connection.
        assert!(!registry.unregister(&old).await);

        let current = registry.lookup(&user("u1")).await.unwrap();
        assert_eq!(current.id(), new.id());
        assert!(!registry.is_current(&old).await);
        assert!(registry.is_current(&new).await);
    }

    #[tokio::test]
    async fn test_announcements_follow_mutations() {
        let registry = PresenceRegistry::new();
        let mut rx = registry.subscribe();
        assert!(rx.borrow_and_update().is_empty());

        let (a, _a_rx) = ConnectionHandle::new(user("a"));
        let (b, _b_rx) = ConnectionHandle::new(user("b"));
        registry.register(a.clone()).await;
        registry.register(b).await;
        registry.unregister(&a).await;

        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update().clone(), vec![user("b")]);
    }

    #[tokio::test]
    async fn test_final_broadcast_matches_registry_under_concurrency() {
        let registry = PresenceRegistry::new();
        let mut tasks = Vec::new();

        for i in 0..50 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (handle, _rx) = ConnectionHandle::new(UserId::new(format!("u{i}")));
                registry.register(handle.clone()).await;
                tokio::task::yield_now().await;
                // Every third user disconnects again.
                if i % 3 == 0 {
                    registry.unregister(&handle).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let expected: Vec<UserId> = registry.snapshot().await.into_iter().collect();
        assert_eq!(expected.len(), 50 - 17);
        assert_eq!(*registry.broadcaster().latest(), expected);
    }

    #[tokio::test]
    async fn test_push_to_closed_connection_fails() {
        let (handle, rx) = ConnectionHandle::new(user("u1"));
        drop(rx);

        let result = handle
            .push(PushEvent::OnlineUsers(vec![]), Duration::from_millis(10))
            .await;
        assert_eq!(result, Err(PushError::Closed));
    }

    #[tokio::test]
    async fn test_push_to_full_queue_times_out() {
        let (handle, _rx) = ConnectionHandle::new(user("u1"));
        for _ in 0..CONNECTION_QUEUE_DEPTH {
            handle
                .push(PushEvent::OnlineUsers(vec![]), Duration::from_millis(10))
                .await
                .unwrap();
        }

        let result = handle
            .push(PushEvent::OnlineUsers(vec![]), Duration::from_millis(10))
            .await;
        assert_eq!(result, Err(PushError::TimedOut(Duration::from_millis(10))));
    }
}
