use std::time::SystemTime;

use async_trait::async_trait;

use crate::{MessageId, QueuedMessage, Result, SendStatus};

/// Durable home of queued outbound mail.
///
/// `pickup_batch` hands out messages under an exclusive lock; the lock is
/// held until exactly one of the `mark_*` calls records the message's fate.
/// A message is never returned by two concurrent pickups.
#[async_trait]
pub trait QueueStore: Send + Sync + std::fmt::Debug {
    /// Add a message to the queue.
    async fn enqueue(&self, message: QueuedMessage) -> Result<MessageId>;

    /// Lock and return up to `limit` messages whose next attempt is due at
    /// `now` and whose send is neither paused nor discarded.
    async fn pickup_batch(&self, limit: usize, now: SystemTime) -> Result<Vec<QueuedMessage>>;

    /// The message reached the remote MX; remove it.
    async fn mark_delivered(&self, id: &MessageId) -> Result<()>;

    /// Re-queue the message for another attempt after `next_attempt_after`.
    async fn mark_deferred(
        &self,
        id: &MessageId,
        next_attempt_after: SystemTime,
        reason: &str,
    ) -> Result<()>;

    /// Terminal failure; remove it.
    async fn mark_failed(&self, id: &MessageId, reason: &str) -> Result<()>;

    /// Removed on administrative request.
    async fn mark_discarded(&self, id: &MessageId) -> Result<()>;

    /// Take back a message that was never picked up, as if it had not been
    /// enqueued. No disposition is recorded.
    async fn withdraw(&self, id: &MessageId) -> Result<()>;

    /// Number of messages currently queued, locked or not.
    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

/// Administrative control over logical sends.
#[async_trait]
pub trait SendControl: Send + Sync {
    async fn send_status(&self, send_id: &str) -> SendStatus;

    /// Exclude the send's messages from future pickups.
    async fn pause_send(&self, send_id: &str);

    async fn resume_send(&self, send_id: &str);

    /// Exclude the send and drain its queued messages, returning how many
    /// were removed. Messages locked by an in-flight pickup are removed
    /// when that attempt records its outcome.
    async fn discard_send(&self, send_id: &str) -> Result<usize>;
}
