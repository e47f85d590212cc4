//! Local mailbox drop
//!
//! Mail addressed to a local domain never enters the outbound queue; the
//! inbound server hands it straight to a [`LocalDelivery`] implementation.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use postern_common::{address::Address, internal};

use crate::{Envelope, MessageId, Result, SpoolError};

#[async_trait]
pub trait LocalDelivery: Send + Sync + std::fmt::Debug {
    /// Store `data` in the mailbox of every recipient in `envelope`.
    async fn deliver(&self, id: MessageId, envelope: &Envelope, data: Arc<[u8]>) -> Result<()>;
}

/// Keeps dropped messages in memory, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryMailDrop {
    messages: Arc<Mutex<Vec<(MessageId, Envelope, Arc<[u8]>)>>>,
}

impl MemoryMailDrop {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn messages(&self) -> Vec<(MessageId, Envelope, Arc<[u8]>)> {
        self.messages.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LocalDelivery for MemoryMailDrop {
    async fn deliver(&self, id: MessageId, envelope: &Envelope, data: Arc<[u8]>) -> Result<()> {
        self.messages.lock().push((id, envelope.clone(), data));
        Ok(())
    }
}

/// Writes each message to `<root>/<domain>/<local-part>/<id>.eml`.
#[derive(Debug, Clone)]
pub struct DirectoryMailDrop {
    root: PathBuf,
}

impl DirectoryMailDrop {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a recipient onto its mailbox directory, refusing anything that
    /// could escape the root.
    fn mailbox(&self, recipient: &Address) -> Result<PathBuf> {
        let domain = recipient.domain_key();
        let local = recipient.local_part.to_lowercase();

        for component in [&domain, &local] {
            if component.is_empty()
                || component.starts_with('.')
                || component.contains(['/', '\\', '\0'])
            {
                return Err(SpoolError::InvalidMailbox(recipient.to_string()));
            }
        }

        Ok(self.root.join(domain).join(local))
    }
}

#[async_trait]
impl LocalDelivery for DirectoryMailDrop {
    async fn deliver(&self, id: MessageId, envelope: &Envelope, data: Arc<[u8]>) -> Result<()> {
        for recipient in &envelope.recipients {
            let mailbox = self.mailbox(recipient)?;
            tokio::fs::create_dir_all(&mailbox).await?;

            let path = mailbox.join(format!("{id}.eml"));
            tokio::fs::write(&path, &data[..]).await?;
            internal!(level = DEBUG, "Dropped {id} for {recipient} at {}", path.display());
        }

        Ok(())
    }
}
