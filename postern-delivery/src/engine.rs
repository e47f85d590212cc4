//! The queue drain: pick up due messages, deliver each one over a pooled
//! connection, and record what happened.

use std::{
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use postern_common::{Signal, internal, tracing};
use postern_spool::{QueueStore, QueuedMessage};
use serde::Deserialize;
use tokio::{
    sync::{broadcast::error::RecvError, watch},
    task::JoinSet,
};

use crate::{
    connection::{ConnectionSettings, StepOutcome},
    dns::{DnsConfig, MxLookup, MxRecord, MxResolver},
    error::DeliveryError,
    hourly::HourlyCounter,
    pool::{Acquire, ConnectionPool, PooledHandle},
    retry::RetryPolicy,
    rules::{Limits, OutboundRulesEngine, RuleSource},
    unavailable::ServiceUnavailableTracker,
    vmta::{GroupConfig, SendingEndpoint, VirtualMtaGroups},
};

mod defaults {
    pub const fn workers() -> usize {
        4
    }

    pub const fn batch_size() -> usize {
        16
    }

    pub const fn poll_interval_ms() -> u64 {
        1000
    }

    pub const fn max_residence_secs() -> u64 {
        5 * 24 * 60 * 60
    }

    pub const fn connect_timeout_secs() -> u64 {
        30
    }

    pub const fn command_timeout_secs() -> u64 {
        60
    }

    pub const fn data_timeout_secs() -> u64 {
        600
    }

    pub const fn idle_timeout_secs() -> u64 {
        30
    }

    pub const fn max_messages_per_connection() -> u64 {
        100
    }

    pub const fn smtp_port() -> u16 {
        25
    }

    pub const fn unavailable_window_secs() -> u64 {
        60
    }

    pub fn hostname() -> String {
        std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Concurrent queue workers
    #[serde(default = "defaults::workers")]
    pub workers: usize,

    /// Messages picked up per worker per poll
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    /// Pause between polls of an empty queue
    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Messages older than this fail without another attempt
    #[serde(default = "defaults::max_residence_secs")]
    pub max_residence_secs: u64,

    #[serde(default = "defaults::connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "defaults::command_timeout_secs")]
    pub command_timeout_secs: u64,

    #[serde(default = "defaults::data_timeout_secs")]
    pub data_timeout_secs: u64,

    /// Pooled connections unused for this long are closed
    #[serde(default = "defaults::idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Messages sent over one connection before it quits; 0 is unlimited
    #[serde(default = "defaults::max_messages_per_connection")]
    pub max_messages_per_connection: u64,

    #[serde(default = "defaults::smtp_port")]
    pub smtp_port: u16,

    #[serde(default)]
    pub dns: DnsConfig,

    /// How long a 421 blocks a (sending IP, MX host) pair
    #[serde(default = "defaults::unavailable_window_secs")]
    pub unavailable_window_secs: u64,

    /// Name given in EHLO by the default group
    #[serde(default = "defaults::hostname")]
    pub hostname: String,

    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: defaults::workers(),
            batch_size: defaults::batch_size(),
            poll_interval_ms: defaults::poll_interval_ms(),
            retry: RetryPolicy::default(),
            max_residence_secs: defaults::max_residence_secs(),
            connect_timeout_secs: defaults::connect_timeout_secs(),
            command_timeout_secs: defaults::command_timeout_secs(),
            data_timeout_secs: defaults::data_timeout_secs(),
            idle_timeout_secs: defaults::idle_timeout_secs(),
            max_messages_per_connection: defaults::max_messages_per_connection(),
            smtp_port: defaults::smtp_port(),
            dns: DnsConfig::default(),
            unavailable_window_secs: defaults::unavailable_window_secs(),
            hostname: defaults::hostname(),
            groups: Vec::new(),
        }
    }
}

impl DeliveryConfig {
    #[must_use]
    pub const fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            data_timeout: Duration::from_secs(self.data_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }

    const fn max_residence(&self) -> Duration {
        Duration::from_secs(self.max_residence_secs)
    }
}

/// What one delivery attempt decided for a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Retry later; `retry_at` overrides the backoff schedule when set
    Deferred {
        reason: String,
        retry_at: Option<SystemTime>,
    },
    Failed(String),
}

impl DeliveryOutcome {
    fn deferred(reason: impl Into<String>) -> Self {
        Self::Deferred {
            reason: reason.into(),
            retry_at: None,
        }
    }
}

#[derive(Debug)]
pub struct DeliveryEngine {
    config: DeliveryConfig,
    store: Arc<dyn QueueStore>,
    resolver: MxResolver,
    rules: OutboundRulesEngine,
    groups: VirtualMtaGroups,
    pool: ConnectionPool,
    hourly: HourlyCounter,
}

impl DeliveryEngine {
    /// Wire the engine's components together.
    ///
    /// # Errors
    ///
    /// Returns a system error when the outbound rules are unusable.
    pub fn new(
        config: DeliveryConfig,
        store: Arc<dyn QueueStore>,
        lookup: Arc<dyn MxLookup>,
        rules: Arc<dyn RuleSource>,
    ) -> Result<Self, DeliveryError> {
        let rules = OutboundRulesEngine::new(rules)?;
        let tracker = Arc::new(ServiceUnavailableTracker::new(Duration::from_secs(
            config.unavailable_window_secs,
        )));
        let pool = ConnectionPool::new(
            Arc::clone(&lookup),
            tracker,
            config.connection_settings(),
            config.smtp_port,
        );

        internal!(
            "Delivery engine: {} workers, batch {}, residence {}s, {} sending groups",
            config.workers,
            config.batch_size,
            config.max_residence_secs,
            config.groups.len()
        );

        Ok(Self {
            resolver: MxResolver::new(lookup, config.dns.clone()),
            groups: VirtualMtaGroups::new(config.groups.clone(), &config.hostname),
            hourly: HourlyCounter::new(),
            config,
            store,
            rules,
            pool,
        })
    }

    #[must_use]
    pub const fn resolver(&self) -> &MxResolver {
        &self.resolver
    }

    #[must_use]
    pub const fn rules(&self) -> &OutboundRulesEngine {
        &self.rules
    }

    #[must_use]
    pub const fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<ServiceUnavailableTracker> {
        self.pool.tracker()
    }

    #[must_use]
    pub const fn hourly(&self) -> &HourlyCounter {
        &self.hourly
    }

    /// Run the workers until `shutdown` delivers [`Signal::Shutdown`] or a
    /// system error halts delivery. In-flight attempts finish and record
    /// their outcome first; pooled connections are then closed.
    ///
    /// # Errors
    ///
    /// Returns the system error that halted delivery.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn serve(
        self: Arc<Self>,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), DeliveryError> {
        internal!(level = INFO, "Delivery engine starting");

        let (stop, stopped) = watch::channel(false);
        let mut workers = JoinSet::new();
        for worker in 0..self.config.workers.max(1) {
            let engine = Arc::clone(&self);
            let stopped = stopped.clone();
            workers.spawn(async move { engine.work(worker, stopped).await });
        }

        let mut result = Ok(());
        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(RecvError::Closed)) {
                        internal!(level = INFO, "Delivery engine received shutdown signal, finishing attempts ...");
                        break;
                    }
                }

                finished = workers.join_next() => {
                    match finished {
                        None => break,
                        Some(Ok(Ok(()))) => {}
                        Some(Ok(Err(err))) => {
                            internal!(level = ERROR, "Delivery halted: {err}");
                            result = Err(err);
                            break;
                        }
                        Some(Err(err)) => {
                            internal!(level = ERROR, "Delivery worker died: {err}");
                        }
                    }
                }
            }
        }

        let _ = stop.send(true);
        while let Some(finished) = workers.join_next().await {
            if let Ok(Err(err)) = finished
                && result.is_ok()
            {
                result = Err(err);
            }
        }

        self.pool.dispose_all().await;
        internal!(level = INFO, "Delivery engine stopped");

        result
    }

    async fn work(
        self: Arc<Self>,
        worker: usize,
        mut stopped: watch::Receiver<bool>,
    ) -> Result<(), DeliveryError> {
        internal!("Delivery worker {worker} started");
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        while !*stopped.borrow() {
            if self.run_once().await? == 0 {
                tokio::select! {
                    _ = stopped.changed() => {}
                    () = tokio::time::sleep(poll) => {}
                }
            }
        }

        internal!("Delivery worker {worker} stopped");
        Ok(())
    }

    /// Pick up one batch and deliver all of it, returning how many messages
    /// were processed.
    ///
    /// Each attempt runs as its own task, so a panic defers only the
    /// message it happened on.
    ///
    /// # Errors
    ///
    /// Returns a system error after every message of the batch has had its
    /// outcome recorded.
    pub async fn run_once(self: &Arc<Self>) -> Result<usize, DeliveryError> {
        self.tracker().purge_expired(Instant::now());

        let batch = match self
            .store
            .pickup_batch(self.config.batch_size, SystemTime::now())
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                internal!(level = ERROR, "Queue pickup failed: {err}");
                return Ok(0);
            }
        };

        let attempts: Vec<_> = batch
            .into_iter()
            .map(|message| {
                let engine = Arc::clone(self);
                let attempt = message.clone();
                (
                    message,
                    tokio::spawn(async move { engine.deliver(&attempt).await }),
                )
            })
            .collect();

        let processed = attempts.len();
        let mut halt = None;
        for (message, attempt) in attempts {
            let outcome = match attempt.await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) => {
                    let outcome = DeliveryOutcome::deferred(err.reason());
                    halt.get_or_insert(err);
                    outcome
                }
                Err(err) => {
                    internal!(level = ERROR, "{}: delivery attempt died: {err}", message.id);
                    DeliveryOutcome::deferred("Delivery attempt aborted")
                }
            };

            self.record(&message, outcome).await;
        }

        halt.map_or(Ok(processed), Err)
    }

    /// Store `outcome` for a picked up message, releasing its lock.
    async fn record(&self, message: &QueuedMessage, outcome: DeliveryOutcome) {
        let id = &message.id;
        let result = match outcome {
            DeliveryOutcome::Delivered => {
                internal!(level = INFO, "{id}: delivered");
                self.store.mark_delivered(id).await
            }
            DeliveryOutcome::Failed(reason) => {
                internal!(level = WARN, "{id}: failed: {reason}");
                self.store.mark_failed(id, &reason).await
            }
            DeliveryOutcome::Deferred { reason, retry_at } => {
                let now = SystemTime::now();
                let next = retry_at.unwrap_or_else(|| {
                    self.config.retry.next_attempt(
                        message.attempts.saturating_add(1),
                        now,
                        message.queued_at + self.config.max_residence(),
                    )
                });
                internal!(level = INFO, "{id}: deferred: {reason}");
                self.store.mark_deferred(id, next, &reason).await
            }
        };

        if let Err(err) = result {
            internal!(level = ERROR, "{id}: recording outcome failed: {err}");
        }
    }

    /// Attempt delivery of one message without touching the queue store.
    ///
    /// # Errors
    ///
    /// Only system errors are returned; permanent and temporary failures
    /// become [`DeliveryOutcome::Failed`] and [`DeliveryOutcome::Deferred`].
    #[tracing::instrument(level = "debug", skip_all, fields(id = %message.id))]
    pub async fn deliver(&self, message: &QueuedMessage) -> Result<DeliveryOutcome, DeliveryError> {
        let residence = message.residence(SystemTime::now());
        if residence > self.config.max_residence() {
            return Ok(DeliveryOutcome::Failed(format!(
                "Message expired after {}s in the queue",
                residence.as_secs()
            )));
        }

        match self.attempt(message).await {
            Ok(outcome) => Ok(outcome),
            Err(DeliveryError::Permanent(reason)) => Ok(DeliveryOutcome::Failed(reason)),
            Err(DeliveryError::Temporary(reason)) => Ok(DeliveryOutcome::deferred(reason)),
            Err(err) => Err(err),
        }
    }

    async fn attempt(&self, message: &QueuedMessage) -> Result<DeliveryOutcome, DeliveryError> {
        let domain = message
            .envelope
            .recipient_domain()
            .ok_or_else(|| DeliveryError::Permanent("Message has no recipients".to_string()))?;

        let records = self.resolver.resolve(&domain).await?;
        let primary = records
            .first()
            .ok_or_else(|| DeliveryError::Permanent(format!("No mail servers for {domain}")))?;

        let group = self.groups.group(&message.group);
        let endpoint = group.select_endpoint(&primary.host).ok_or_else(|| {
            DeliveryError::Temporary(format!(
                "Sending group {} has no outbound endpoints",
                group.name()
            ))
        })?;

        let candidates = records
            .iter()
            .map(|mx| Ok((mx.clone(), self.rules.get_rules(&mx.host, &endpoint)?)))
            .collect::<Result<Vec<_>, DeliveryError>>()?;

        // Skip the connect when the first choice is already over its hourly limit
        if let Some((mx, limits)) = candidates.first()
            && let Some(limit) = limits.max_messages_per_hour
            && let Some(until) = self
                .hourly
                .exhausted_until(endpoint.ip, &mx.host, limit, Instant::now())
        {
            return Ok(Self::hourly_deferral(&mx.host, limit, &endpoint, until));
        }

        let handle = self.ready(&endpoint, &candidates).await?;

        let host = handle.key().host.clone();
        let limits = *handle.limits();

        if let Some(limit) = limits.max_messages_per_hour
            && let Err(until) = self.hourly.try_take(endpoint.ip, &host, limit, Instant::now())
        {
            handle.release();
            return Ok(Self::hourly_deferral(&host, limit, &endpoint, until));
        }

        let cap = [
            Some(self.config.max_messages_per_connection).filter(|cap| *cap > 0),
            limits.max_messages_per_connection,
        ]
        .into_iter()
        .flatten()
        .min();

        match Self::transaction(&handle, message, cap).await {
            Ok(()) => {
                handle.release();
                Ok(DeliveryOutcome::Delivered)
            }
            Err(err) => {
                if limits.max_messages_per_hour.is_some() {
                    self.hourly.give_back(endpoint.ip, &host);
                }
                handle.close().await;
                Err(err)
            }
        }
    }

    /// Acquire a connection and greet or reset it. A reused connection
    /// whose transport is gone by the reset is replaced once.
    async fn ready(
        &self,
        endpoint: &SendingEndpoint,
        candidates: &[(MxRecord, Limits)],
    ) -> Result<PooledHandle, DeliveryError> {
        let mut replaced = false;

        loop {
            let handle = match self.pool.try_acquire(endpoint, candidates).await {
                Acquire::Connection(handle) => handle,
                Acquire::Deferred(reason) => return Err(DeliveryError::Temporary(reason)),
            };

            let reused = handle.is_helloed().await;
            let outcome = handle.hello_or_reset(&endpoint.hostname).await;

            if matches!(outcome, StepOutcome::NotConnected) && reused && !replaced {
                internal!(level = DEBUG, "{} went away while pooled, reconnecting", handle.key());
                handle.close().await;
                replaced = true;
                continue;
            }

            return match outcome.into_result() {
                Ok(_) => Ok(handle),
                Err(err) => {
                    handle.close().await;
                    Err(err)
                }
            };
        }
    }

    fn hourly_deferral(
        host: &str,
        limit: u64,
        endpoint: &SendingEndpoint,
        until: Instant,
    ) -> DeliveryOutcome {
        DeliveryOutcome::Deferred {
            reason: format!("{host} reached {limit} messages this hour from {}", endpoint.ip),
            retry_at: Some(SystemTime::now() + until.saturating_duration_since(Instant::now())),
        }
    }

    /// One mail transaction on a ready connection; the first failing step
    /// ends it.
    async fn transaction(
        connection: &PooledHandle,
        message: &QueuedMessage,
        cap: Option<u64>,
    ) -> Result<(), DeliveryError> {
        let sender = message.envelope.sender.as_ref().map(ToString::to_string);
        let eight_bit = !message.data.is_ascii();
        connection
            .mail_from(sender.as_deref(), eight_bit)
            .await
            .into_result()?;

        for recipient in &message.envelope.recipients {
            connection
                .rcpt_to(&recipient.to_string())
                .await
                .into_result()?;
        }

        connection.data(&message.data, cap).await.into_result()?;
        Ok(())
    }
}
