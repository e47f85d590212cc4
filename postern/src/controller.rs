use std::{
    path::PathBuf,
    sync::{Arc, LazyLock},
};

use anyhow::Context;
use futures_util::future::join_all;
use postern_common::{Signal, internal, logging, tracing};
use postern_delivery::{DeliveryConfig, DeliveryEngine, HickoryLookup, MxLookup, RuleSet, StaticRules};
use postern_smtp::{Listener, SmtpServer};
use postern_spool::{DirectoryMailDrop, LocalDelivery, MemoryMailDrop, MemoryQueueStore};
use serde::Deserialize;
use tokio::sync::broadcast;

/// Everything read from `postern.config.ron`.
#[derive(Debug, Deserialize)]
pub struct Postern {
    #[serde(alias = "smtp")]
    listeners: Vec<SmtpServer>,
    #[serde(default)]
    delivery: DeliveryConfig,
    #[serde(default = "RuleSet::unlimited")]
    rules: RuleSet,
    /// Mailbox root for local domains. Kept in memory when unset.
    #[serde(default)]
    local_drop: Option<PathBuf>,
    /// Upper bound on queued messages. Unbounded when unset.
    #[serde(default)]
    queue_capacity: Option<usize>,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[tracing::instrument(level = "trace")]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .context("Nothing is listening for shutdown")?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(Signal::Finalised) | Err(broadcast::error::RecvError::Closed) => break,
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                internal!(level = WARN, "Forcing shutdown");
                break;
            }
        }
    }

    Ok(())
}

impl Postern {
    /// Parse a RON configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid configuration.
    pub fn from_ron(text: &str) -> anyhow::Result<Self> {
        ron::from_str(text).context("Invalid configuration")
    }

    #[must_use]
    pub fn listeners(&self) -> &[SmtpServer] {
        &self.listeners
    }

    #[must_use]
    pub const fn delivery(&self) -> &DeliveryConfig {
        &self.delivery
    }

    /// Wire the configured services against the system resolver.
    ///
    /// # Errors
    ///
    /// Returns an error if the resolver cannot be created or the outbound
    /// rules are invalid.
    pub fn services(self) -> anyhow::Result<Services> {
        let lookup =
            HickoryLookup::new(&self.delivery.dns).context("Unable to create DNS resolver")?;
        self.services_with(Arc::new(lookup))
    }

    /// Wire the configured services against `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if the outbound rules are invalid.
    pub fn services_with(self, lookup: Arc<dyn MxLookup>) -> anyhow::Result<Services> {
        let store = self
            .queue_capacity
            .map_or_else(MemoryQueueStore::new, MemoryQueueStore::with_capacity);

        let local: Arc<dyn LocalDelivery> = match &self.local_drop {
            Some(root) => {
                internal!(level = INFO, "Local mail is dropped under {}", root.display());
                Arc::new(DirectoryMailDrop::new(root))
            }
            None => Arc::new(MemoryMailDrop::new()),
        };

        let listeners = self
            .listeners
            .iter()
            .map(|server| server.listener(Arc::new(store.clone()), Arc::clone(&local)))
            .collect();

        let engine = DeliveryEngine::new(
            self.delivery,
            Arc::new(store.clone()),
            lookup,
            Arc::new(StaticRules::new(self.rules)),
        )
        .context("Unable to start delivery")?;

        Ok(Services {
            listeners,
            engine: Arc::new(engine),
            store,
            local,
        })
    }

    /// Run this controller, and everything it controls, until shut down
    /// by a signal.
    ///
    /// # Errors
    ///
    /// This function will return an error if any service fails to start or
    /// stops with an error.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        let services = self.services()?;

        internal!(level = INFO, "Controller running");

        let ret = tokio::select! {
            r = services.serve(&SHUTDOWN_BROADCAST) => r,
            r = shutdown() => r,
        };

        internal!(level = INFO, "Shutting down...");

        ret
    }
}

/// The running parts of one postern instance, sharing one queue.
#[derive(Debug)]
pub struct Services {
    listeners: Vec<Listener>,
    engine: Arc<DeliveryEngine>,
    store: MemoryQueueStore,
    local: Arc<dyn LocalDelivery>,
}

impl Services {
    #[must_use]
    pub const fn store(&self) -> &MemoryQueueStore {
        &self.store
    }

    #[must_use]
    pub const fn engine(&self) -> &Arc<DeliveryEngine> {
        &self.engine
    }

    #[must_use]
    pub fn local(&self) -> &Arc<dyn LocalDelivery> {
        &self.local
    }

    /// Serve every listener and the delivery engine until `signals` carries
    /// [`Signal::Shutdown`]. Once all of them have stopped,
    /// [`Signal::Finalised`] is sent.
    ///
    /// # Errors
    ///
    /// Returns the first error any listener or the engine stopped with.
    pub async fn serve(self, signals: &broadcast::Sender<Signal>) -> anyhow::Result<()> {
        let listeners = join_all(
            self.listeners
                .iter()
                .map(|listener| listener.serve(signals.subscribe())),
        );
        let delivery = Arc::clone(&self.engine).serve(signals.subscribe());

        let (listeners, delivery) = tokio::join!(listeners, delivery);

        internal!(level = INFO, "All services stopped");
        // Nobody may be waiting on this
        let _ = signals.send(Signal::Finalised);

        listeners
            .into_iter()
            .collect::<Result<Vec<()>, _>>()
            .context("SMTP listener failed")?;
        delivery.context("Delivery failed")?;

        Ok(())
    }
}
