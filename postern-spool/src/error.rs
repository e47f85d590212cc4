//! Error types for the postern-spool crate.

use std::io;

use thiserror::Error;

use crate::MessageId;

#[derive(Debug, Error)]
pub enum SpoolError {
    /// I/O operation failed (local drop writes).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Message not found in the queue.
    #[error("Message not found: {0}")]
    NotFound(MessageId),

    /// A disposition was recorded for a message nobody had picked up.
    #[error("Message is not locked by a pickup: {0}")]
    NotLocked(MessageId),

    /// The message is held by a pickup and cannot be withdrawn.
    #[error("Message is locked by a pickup: {0}")]
    Locked(MessageId),

    /// The store refused the write because it is full.
    #[error("Queue capacity exceeded: {0} messages")]
    CapacityExceeded(usize),

    /// A recipient could not be mapped to a safe mailbox path.
    #[error("Invalid mailbox path: {0}")]
    InvalidMailbox(String),
}

pub type Result<T> = std::result::Result<T, SpoolError>;
