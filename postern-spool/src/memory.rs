use std::{sync::Arc, time::SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use postern_common::internal;

use crate::{
    MessageId, QueuedMessage, Result, SendStatus, SpoolError,
    store::{QueueStore, SendControl},
};

/// What happened to a message each time its fate was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Delivered,
    Deferred { reason: String },
    Failed { reason: String },
    Discarded,
}

#[derive(Debug)]
struct Entry {
    message: QueuedMessage,
    locked: bool,
}

/// In-memory queue store
///
/// Messages live in a `DashMap`, so pickups from concurrent workers only
/// contend on the shard holding a given message. The pickup lock is a flag
/// flipped while the shard is write-locked during iteration.
///
/// Every recorded disposition is kept in an append-only log so callers (and
/// tests) can verify each message reached exactly one terminal state.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueueStore {
    messages: Arc<DashMap<MessageId, Entry>>,
    sends: Arc<DashMap<String, SendStatus>>,
    history: Arc<Mutex<Vec<(MessageId, Disposition)>>>,
    /// Maximum number of messages to store (None = unlimited)
    capacity: Option<usize>,
}

impl MemoryQueueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Every disposition recorded so far, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<(MessageId, Disposition)> {
        self.history.lock().clone()
    }

    /// Dispositions recorded for one message.
    #[must_use]
    pub fn dispositions(&self, id: &MessageId) -> Vec<Disposition> {
        self.history
            .lock()
            .iter()
            .filter(|(entry, _)| entry == id)
            .map(|(_, disposition)| disposition.clone())
            .collect()
    }

    /// A snapshot of a queued message, if it is still queued.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<QueuedMessage> {
        self.messages.get(id).map(|entry| entry.message.clone())
    }

    #[must_use]
    pub fn is_locked(&self, id: &MessageId) -> bool {
        self.messages.get(id).is_some_and(|entry| entry.locked)
    }

    fn status_of(&self, send_id: Option<&str>) -> SendStatus {
        send_id
            .and_then(|id| self.sends.get(id).map(|status| *status))
            .unwrap_or_default()
    }

    fn record(&self, id: MessageId, disposition: Disposition) {
        internal!(level = DEBUG, "{id}: {disposition:?}");
        self.history.lock().push((id, disposition));
    }

    /// Remove a locked message and record its terminal disposition.
    fn finish(&self, id: &MessageId, disposition: Disposition) -> Result<()> {
        match self.messages.remove_if(id, |_, entry| entry.locked) {
            Some(_) => {
                self.record(*id, disposition);
                Ok(())
            }
            None if self.messages.contains_key(id) => Err(SpoolError::NotLocked(*id)),
            None => Err(SpoolError::NotFound(*id)),
        }
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(&self, message: QueuedMessage) -> Result<MessageId> {
        if let Some(capacity) = self.capacity
            && self.messages.len() >= capacity
        {
            return Err(SpoolError::CapacityExceeded(capacity));
        }

        let id = message.id;
        self.messages.insert(
            id,
            Entry {
                message,
                locked: false,
            },
        );
        Ok(id)
    }

    async fn pickup_batch(&self, limit: usize, now: SystemTime) -> Result<Vec<QueuedMessage>> {
        let mut batch = Vec::new();
        if limit == 0 {
            return Ok(batch);
        }

        for mut entry in self.messages.iter_mut() {
            if entry.locked
                || !entry.message.is_due(now)
                || self.status_of(entry.message.send_id.as_deref()) != SendStatus::Active
            {
                continue;
            }

            entry.locked = true;
            batch.push(entry.message.clone());

            if batch.len() >= limit {
                break;
            }
        }

        Ok(batch)
    }

    async fn mark_delivered(&self, id: &MessageId) -> Result<()> {
        self.finish(id, Disposition::Delivered)
    }

    async fn mark_deferred(
        &self,
        id: &MessageId,
        next_attempt_after: SystemTime,
        reason: &str,
    ) -> Result<()> {
        let send_id = {
            let mut entry = self
                .messages
                .get_mut(id)
                .ok_or(SpoolError::NotFound(*id))?;
            if !entry.locked {
                return Err(SpoolError::NotLocked(*id));
            }
            entry.message.send_id.clone()
        };

        // The send was discarded while this attempt was in flight
        if self.status_of(send_id.as_deref()) == SendStatus::Discarded {
            return self.finish(id, Disposition::Discarded);
        }

        let mut entry = self
            .messages
            .get_mut(id)
            .ok_or(SpoolError::NotFound(*id))?;
        entry.message.next_attempt_after = next_attempt_after;
        entry.message.attempts = entry.message.attempts.saturating_add(1);
        entry.message.last_error = Some(reason.to_string());
        entry.locked = false;
        drop(entry);

        self.record(
            *id,
            Disposition::Deferred {
                reason: reason.to_string(),
            },
        );
        Ok(())
    }

    async fn mark_failed(&self, id: &MessageId, reason: &str) -> Result<()> {
        self.finish(
            id,
            Disposition::Failed {
                reason: reason.to_string(),
            },
        )
    }

    async fn mark_discarded(&self, id: &MessageId) -> Result<()> {
        self.finish(id, Disposition::Discarded)
    }

    async fn withdraw(&self, id: &MessageId) -> Result<()> {
        match self.messages.remove_if(id, |_, entry| !entry.locked) {
            Some(_) => {
                internal!(level = DEBUG, "{id}: withdrawn");
                Ok(())
            }
            None if self.messages.contains_key(id) => Err(SpoolError::Locked(*id)),
            None => Err(SpoolError::NotFound(*id)),
        }
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.messages.len())
    }
}

#[async_trait]
impl SendControl for MemoryQueueStore {
    async fn send_status(&self, send_id: &str) -> SendStatus {
        self.status_of(Some(send_id))
    }

    async fn pause_send(&self, send_id: &str) {
        internal!(level = INFO, "Pausing send {send_id}");
        self.sends.insert(send_id.to_string(), SendStatus::Paused);
    }

    async fn resume_send(&self, send_id: &str) {
        internal!(level = INFO, "Resuming send {send_id}");
        self.sends.insert(send_id.to_string(), SendStatus::Active);
    }

    async fn discard_send(&self, send_id: &str) -> Result<usize> {
        internal!(level = INFO, "Discarding send {send_id}");
        self.sends.insert(send_id.to_string(), SendStatus::Discarded);

        let drained: Vec<MessageId> = self
            .messages
            .iter()
            .filter(|entry| !entry.locked && entry.message.send_id.as_deref() == Some(send_id))
            .map(|entry| *entry.key())
            .collect();

        let mut removed = 0;
        for id in drained {
            if self
                .messages
                .remove_if(&id, |_, entry| !entry.locked)
                .is_some()
            {
                self.record(id, Disposition::Discarded);
                removed += 1;
            }
        }

        Ok(removed)
    }
}
