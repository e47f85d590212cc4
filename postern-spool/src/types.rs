use std::{
    fmt,
    str::FromStr,
    sync::Arc,
    time::{Duration, SystemTime},
};

use postern_common::address::Address;
use serde::{Deserialize, Serialize};

/// Identifier for a queued message
///
/// A ULID, so identifiers sort by creation time and double as file names
/// when a message is written to a local drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(ulid::Ulid);

impl MessageId {
    /// Generate a new unique message ID
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new())
    }

    #[must_use]
    pub const fn ulid(&self) -> ulid::Ulid {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s).map(Self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// `None` is the null reverse-path
    pub sender: Option<Address>,
    pub recipients: Vec<Address>,
}

impl Envelope {
    /// The lowercased domain deliveries for this envelope are routed by.
    #[must_use]
    pub fn recipient_domain(&self) -> Option<String> {
        self.recipients.first().map(Address::domain_key)
    }
}

/// Administrative state of a logical send (campaign, batch, ...).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendStatus {
    #[default]
    Active,
    Paused,
    Discarded,
}

/// A message waiting for outbound delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: MessageId,
    pub envelope: Envelope,
    pub data: Arc<[u8]>,
    /// The logical send this message belongs to, if any
    pub send_id: Option<String>,
    /// Name of the sending group endpoints are chosen from
    pub group: String,
    pub queued_at: SystemTime,
    pub next_attempt_after: SystemTime,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl QueuedMessage {
    /// Create a message eligible for immediate pickup.
    #[must_use]
    pub fn new(envelope: Envelope, data: impl Into<Arc<[u8]>>, group: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Self {
            id: MessageId::generate(),
            envelope,
            data: data.into(),
            send_id: None,
            group: group.into(),
            queued_at: now,
            next_attempt_after: now,
            attempts: 0,
            last_error: None,
        }
    }

    #[must_use]
    pub fn with_send_id(mut self, send_id: impl Into<String>) -> Self {
        self.send_id = Some(send_id.into());
        self
    }

    /// How long the message has been sitting in the queue.
    #[must_use]
    pub fn residence(&self, now: SystemTime) -> Duration {
        now.duration_since(self.queued_at).unwrap_or_default()
    }

    #[must_use]
    pub fn is_due(&self, now: SystemTime) -> bool {
        self.next_attempt_after <= now
    }
}
