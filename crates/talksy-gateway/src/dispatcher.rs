use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Capacity of each conversation's feed. Lagging only costs a re-read.
const FEED_CAPACITY: usize = 64;

/// "Something was appended to this conversation." Carries no payload;
/// receivers re-read the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub conversation_id: Uuid,
    /// Sequence of the appended message, or `None` when the receiver
    /// missed events and only knows that something changed.
    pub seq: Option<i64>,
}

/// Per-conversation change feeds. A feed exists only while someone listens.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// conversation_id -> broadcast sender
    feeds: Mutex<HashMap<Uuid, broadcast::Sender<ChangeEvent>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                feeds: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to appends on one conversation. Dropping the subscription
    /// releases it; the feed is removed with its last subscriber.
    pub fn subscribe(&self, conversation_id: Uuid) -> ConversationSubscription {
        let mut feeds = self.feeds();
        let rx = feeds
            .entry(conversation_id)
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .subscribe();

        ConversationSubscription {
            conversation_id,
            rx: Some(rx),
            dispatcher: self.clone(),
        }
    }

    /// Notify listeners of `conversation_id`. A no-op when nobody listens.
    pub fn publish(&self, event: ChangeEvent) {
        let feeds = self.feeds();
        if let Some(tx) = feeds.get(&event.conversation_id) {
            let delivered = tx.send(event).unwrap_or(0);
            debug!(
                "change on {} delivered to {} subscriber(s)",
                event.conversation_id, delivered
            );
        }
    }

    /// Number of conversations with at least one live subscriber.
    pub fn feed_count(&self) -> usize {
        self.feeds().len()
    }

    fn release(&self, conversation_id: Uuid) {
        let mut feeds = self.feeds();
        if feeds
            .get(&conversation_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            feeds.remove(&conversation_id);
        }
    }

    fn feeds(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, broadcast::Sender<ChangeEvent>>> {
        // The map stays consistent even if a holder panicked mid-operation.
        self.inner
            .feeds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConversationSubscription {
    conversation_id: Uuid,
    rx: Option<broadcast::Receiver<ChangeEvent>>,
    dispatcher: Dispatcher,
}

impl ConversationSubscription {
    /// Next change. Missed events collapse into one seq-less event.
    /// Returns `None` only if the feed was torn down underneath us.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        let rx = self.rx.as_mut()?;
        match rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("subscription to {} lagged by {} events", self.conversation_id, n);
                Some(ChangeEvent {
                    conversation_id: self.conversation_id,
                    seq: None,
                })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

impl Drop for ConversationSubscription {
    fn drop(&mut self) {
        // Drop the receiver first so the count seen by release() excludes us.
        self.rx.take();
        self.dispatcher.release(self.conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_only_that_conversation() {
        let dispatcher = Dispatcher::new();
        let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());
        let mut s1 = dispatcher.subscribe(c1);
        let mut s2 = dispatcher.subscribe(c2);

        dispatcher.publish(ChangeEvent { conversation_id: c1, seq: Some(7) });

        assert_eq!(
            s1.recv().await,
            Some(ChangeEvent { conversation_id: c1, seq: Some(7) })
        );
        let nothing = tokio::time::timeout(std::time::Duration::from_millis(50), s2.recv()).await;
        assert!(nothing.is_err());
    }

    #[test]
    fn feed_is_released_with_last_subscriber() {
        let dispatcher = Dispatcher::new();
        let cid = Uuid::new_v4();

        let a = dispatcher.subscribe(cid);
        let b = dispatcher.subscribe(cid);
        assert_eq!(dispatcher.feed_count(), 1);

        drop(a);
        assert_eq!(dispatcher.feed_count(), 1);
        drop(b);
        assert_eq!(dispatcher.feed_count(), 0);
    }

    #[test]
    fn publish_without_listeners_is_harmless() {
        let dispatcher = Dispatcher::new();
        dispatcher.publish(ChangeEvent { conversation_id: Uuid::new_v4(), seq: Some(1) });
        assert_eq!(dispatcher.feed_count(), 0);
    }

    #[tokio::test]
    async fn lag_collapses_into_one_event() {
        let dispatcher = Dispatcher::new();
        let cid = Uuid::new_v4();
        let mut sub = dispatcher.subscribe(cid);

        for seq in 0..(FEED_CAPACITY as i64 + 10) {
            dispatcher.publish(ChangeEvent { conversation_id: cid, seq: Some(seq) });
        }

        let first = sub.recv().await.unwrap();
        assert_eq!(first, ChangeEvent { conversation_id: cid, seq: None });
    }
}
