use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::SubscriptionRecord;

const FEED_CAPACITY: usize = 256;

/// In-process change feed of subscription rows. Each event is a full-row
/// snapshot, so a consumer that misses events only needs the latest one.
#[derive(Clone)]
pub struct SubscriptionFeed {
    tx: broadcast::Sender<SubscriptionRecord>,
}

impl Default for SubscriptionFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, record: SubscriptionRecord) {
        // No receivers is fine: nobody is watching this user right now.
        let _ = self.tx.send(record);
    }

    /// Events for `user_id` only. Dropping the returned value unsubscribes.
    pub fn subscribe(&self, user_id: Uuid) -> UserFeed {
        UserFeed {
            user_id,
            rx: self.tx.subscribe(),
        }
    }
}

pub struct UserFeed {
    user_id: Uuid,
    rx: broadcast::Receiver<SubscriptionRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Snapshot(SubscriptionRecord),
    /// Events were dropped before this consumer read them; one of them may
    /// have been for this user, so its latest row must be re-read.
    Lagged,
}

impl UserFeed {
    /// Next event for this user, or `None` once the feed is closed.
    pub async fn next(&mut self) -> Option<FeedEvent> {
        loop {
            match self.rx.recv().await {
                Ok(record) if record.user_id == self.user_id => {
                    return Some(FeedEvent::Snapshot(record))
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(user_id = %self.user_id, skipped, "subscription feed lagged");
                    return Some(FeedEvent::Lagged);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
