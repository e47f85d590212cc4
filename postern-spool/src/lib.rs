//! Storage contracts the MTA core drives: the outbound queue and the local
//! mailbox drop, with in-memory and directory backed implementations.

pub mod error;
pub mod local;
pub mod memory;
pub mod store;
pub mod types;

pub use error::{Result, SpoolError};
pub use local::{DirectoryMailDrop, LocalDelivery, MemoryMailDrop};
pub use memory::{Disposition, MemoryQueueStore};
pub use store::{QueueStore, SendControl};
pub use types::{Envelope, MessageId, QueuedMessage, SendStatus};
