//! Message delivery: persist first, then push to the recipient if online.

use std::time::Duration;

use tracing::{debug, info, warn};

use quickchat_shared::{ChatMessage, MessageBody, PushEvent, UserId};
use quickchat_store::NewMessage;

use crate::error::ServerError;
use crate::presence::PresenceRegistry;
use crate::store::MessageStore;

#[derive(Clone)]
pub struct DeliveryRouter {
    store: MessageStore,
    registry: PresenceRegistry,
    push_timeout: Duration,
}

impl DeliveryRouter {
    pub fn new(store: MessageStore, registry: PresenceRegistry, push_timeout: Duration) -> Self {
        Self {
            store,
            registry,
            push_timeout,
        }
    }

    /// Store a message from `sender` to `receiver` and push it to the
    /// receiver's live connection.
    ///
    /// Nothing is pushed unless the append succeeded. A failed or timed-out
    /// push is logged and otherwise ignored: the message is durable and the
    /// receiver picks it up from history. The sender's other sessions are
    /// not notified.
    pub async fn deliver(
        &self,
        sender: &UserId,
        receiver: &UserId,
        body: MessageBody,
    ) -> Result<ChatMessage, ServerError> {
        if body.is_empty() {
            return Err(ServerError::EmptyMessage);
        }

        let stored = self
            .store
            .append(NewMessage::new(sender.clone(), receiver.clone(), body))
            .await?;

        info!(
            id = %stored.id,
            from = %sender.short(),
            to = %receiver.short(),
            "Message stored"
        );

        let Some(handle) = self.registry.lookup(receiver).await else {
            debug!(id = %stored.id, to = %receiver.short(), "Receiver offline, stored only");
            return Ok(stored);
        };

        match handle
            .push(PushEvent::NewMessage(stored.clone()), self.push_timeout)
            .await
        {
            Ok(()) => debug!(id = %stored.id, conn = %handle.id(), "Message pushed"),
            Err(e) => warn!(
                id = %stored.id,
                conn = %handle.id(),
                error = %e,
                "Push failed, receiver will fetch from history"
            ),
        }

        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use quickchat_shared::constants::CONNECTION_QUEUE_DEPTH;

    use super::*;
    use crate::presence::ConnectionHandle;

    const PUSH_TIMEOUT: Duration = Duration::from_millis(50);

    fn setup() -> (DeliveryRouter, MessageStore, PresenceRegistry) {
        let store = MessageStore::in_memory().unwrap();
        let registry = PresenceRegistry::new();
        let router = DeliveryRouter::new(store.clone(), registry.clone(), PUSH_TIMEOUT);
        (router, store, registry)
    }

    fn u(id: &str) -> UserId {
        UserId::from(id)
    }

    #[tokio::test]
    async fn test_online_receiver_gets_the_stored_message() {
        let (router, store, registry) = setup();
        let (handle, mut rx) = ConnectionHandle::new(u("u2"));
        registry.register(handle).await;

        let sent = router
            .deliver(&u("u1"), &u("u2"), MessageBody::text("hi"))
            .await
            .unwrap();

        let pushed = match rx.try_recv().unwrap() {
            PushEvent::NewMessage(m) => m,
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(pushed, sent);

        let history = store.history(&u("u1"), &u("u2")).await.unwrap();
        assert_eq!(history, vec![pushed]);
    }

    #[tokio::test]
    async fn test_offline_receiver_is_store_only() {
        let (router, store, registry) = setup();
        let (bystander, mut bystander_rx) = ConnectionHandle::new(u("u3"));
        registry.register(bystander).await;

        let sent = router
            .deliver(&u("u1"), &u("u2"), MessageBody::text("hi"))
            .await
            .unwrap();
        assert!(!sent.seen);
        assert!(bystander_rx.try_recv().is_err());

        let history = store.history(&u("u2"), &u("u1")).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn test_sender_sessions_are_not_echoed() {
        let (router, _store, registry) = setup();
        let (sender_conn, mut sender_rx) = ConnectionHandle::new(u("u1"));
        registry.register(sender_conn).await;

        router
            .deliver(&u("u1"), &u("u2"), MessageBody::text("hi"))
            .await
            .unwrap();
        assert!(sender_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected_before_storage() {
        let (router, store, _registry) = setup();

        let err = router
            .deliver(&u("u1"), &u("u2"), MessageBody::text("   "))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::EmptyMessage));
        assert!(store.history(&u("u1"), &u("u2")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_means_no_push() {
        let (router, store, registry) = setup();
        let (handle, mut rx) = ConnectionHandle::new(u("u2"));
        registry.register(handle).await;
        store.with_db(|db| db.conn().execute_batch("DROP TABLE messages").unwrap());

        let err = router
            .deliver(&u("u1"), &u("u2"), MessageBody::text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::StoreUnavailable(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_push_failures_do_not_fail_delivery() {
        let (router, store, registry) = setup();

        // Receiver whose writer is gone.
        let (closed, closed_rx) = ConnectionHandle::new(u("u2"));
        registry.register(closed).await;
        drop(closed_rx);
        router
            .deliver(&u("u1"), &u("u2"), MessageBody::text("one"))
            .await
            .unwrap();

        // Receiver whose queue is full and never drains.
        let (stuck, _stuck_rx) = ConnectionHandle::new(u("u3"));
        registry.register(stuck.clone()).await;
        for _ in 0..CONNECTION_QUEUE_DEPTH {
            stuck
                .push(PushEvent::OnlineUsers(vec![]), PUSH_TIMEOUT)
                .await
                .unwrap();
        }
        router
            .deliver(&u("u1"), &u("u3"), MessageBody::text("two"))
            .await
            .unwrap();

        assert_eq!(store.history(&u("u1"), &u("u2")).await.unwrap().len(), 1);
        assert_eq!(store.history(&u("u1"), &u("u3")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pair_order_follows_append_order() {
        let (router, store, _registry) = setup();
        for text in ["1", "2", "3", "4"] {
            router
                .deliver(&u("u1"), &u("u2"), MessageBody::text(text))
                .await
                .unwrap();
        }

        let texts: Vec<_> = store
            .history(&u("u1"), &u("u2"))
            .await
            .unwrap()
            .into_iter()
            .filter_map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["1", "2", "3", "4"]);
    }
}
