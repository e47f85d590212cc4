//! Pool of outbound connections keyed by (sending IP, MX host).
//!
//! The pool hands out [`PooledHandle`]s. A handle returns its connection
//! for reuse only through [`PooledHandle::release`]; dropped any other way
//! it closes the connection. Idle connections may be closed by their idle
//! timer while pooled, so every pop re-checks the connection before use.
//!
//! Open connections per key are counted through [`OpenPermit`]s held by
//! each connection, which is how `MaxConnections` is enforced.

use std::{
    collections::VecDeque,
    net::{IpAddr, SocketAddr},
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::DashMap;
use futures_util::future::join_all;
use postern_common::internal;

use crate::{
    connection::{ConnectionKey, ConnectionSettings, OutboundConnection},
    dns::{MxLookup, MxRecord},
    rules::Limits,
    unavailable::ServiceUnavailableTracker,
    vmta::SendingEndpoint,
};

type OpenCounts = Arc<DashMap<ConnectionKey, usize>>;

/// Counts one open connection against its key until dropped.
#[derive(Debug)]
pub struct OpenPermit {
    counts: OpenCounts,
    key: ConnectionKey,
}

impl Drop for OpenPermit {
    fn drop(&mut self) {
        if let Some(mut count) = self.counts.get_mut(&self.key) {
            *count = count.saturating_sub(1);
        }
        self.counts.remove_if(&self.key, |_, count| *count == 0);
    }
}

/// The result of [`ConnectionPool::try_acquire`].
#[derive(Debug)]
pub enum Acquire {
    Connection(PooledHandle),
    /// Nothing usable right now; try the message again later
    Deferred(String),
}

#[derive(Debug)]
struct PoolInner {
    idle: DashMap<ConnectionKey, VecDeque<OutboundConnection>>,
    open: OpenCounts,
    tracker: Arc<ServiceUnavailableTracker>,
    lookup: Arc<dyn MxLookup>,
    settings: ConnectionSettings,
    port: u16,
    closed: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(
        lookup: Arc<dyn MxLookup>,
        tracker: Arc<ServiceUnavailableTracker>,
        settings: ConnectionSettings,
        port: u16,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: DashMap::new(),
                open: Arc::new(DashMap::new()),
                tracker,
                lookup,
                settings,
                port,
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<ServiceUnavailableTracker> {
        &self.inner.tracker
    }

    /// Connections currently open for the pair, pooled or in use.
    #[must_use]
    pub fn open_count(&self, ip: IpAddr, host: &str) -> usize {
        self.inner
            .open
            .get(&ConnectionKey::new(ip, host))
            .map_or(0, |count| *count)
    }

    /// Connections waiting in the pool for the pair.
    #[must_use]
    pub fn idle_count(&self, ip: IpAddr, host: &str) -> usize {
        self.inner
            .idle
            .get(&ConnectionKey::new(ip, host))
            .map_or(0, |idle| idle.len())
    }

    /// Find a connection from `endpoint` to one of `candidates`, tried in
    /// order. Each candidate carries the limits that apply to it.
    ///
    /// - A candidate blocked by the service-unavailable tracker defers the
    ///   message without trying the rest
    /// - A pooled idle connection is reused when one is still open
    /// - Otherwise a new connection is opened, within `max_connections`
    /// - A failed connect moves on to the next candidate; failing on the
    ///   last one defers
    pub async fn try_acquire(
        &self,
        endpoint: &SendingEndpoint,
        candidates: &[(MxRecord, Limits)],
    ) -> Acquire {
        if self.inner.closed.load(Ordering::Acquire) {
            return Acquire::Deferred("Connection pool is shutting down".to_string());
        }

        let mut last_failure = String::from("No mail exchangers to try");

        for (mx, limits) in candidates {
            let key = ConnectionKey::new(endpoint.ip, &mx.host);

            if self.inner.tracker.is_blocked(key.ip, &key.host) {
                internal!(level = DEBUG, "{key} is blocked, deferring");
                return Acquire::Deferred(format!("{key} answered 421 recently"));
            }

            if let Some(connection) = self.pop_idle(&key) {
                internal!("Reusing pooled connection {key}");
                return Acquire::Connection(self.handle(connection, *limits));
            }

            let Some(permit) = self.reserve(&key, limits.max_connections) else {
                internal!(level = DEBUG, "{key} is at its connection limit");
                return Acquire::Deferred(format!("{key} is at its connection limit"));
            };

            let address = match self.address_of(&mx.host, endpoint.ip).await {
                Ok(address) => address,
                Err(reason) => {
                    internal!(level = DEBUG, "{reason}");
                    last_failure = reason;
                    continue;
                }
            };

            match OutboundConnection::connect(
                key.clone(),
                address,
                self.inner.settings,
                Arc::clone(&self.inner.tracker),
                Some(permit),
            )
            .await
            {
                Ok(connection) if connection.claim() => {
                    return Acquire::Connection(self.handle(connection, *limits));
                }
                Ok(connection) => {
                    connection.close_in_background();
                    last_failure = format!("{key} closed before use");
                }
                Err(err) => {
                    internal!(level = DEBUG, "Connecting {key} failed: {err}");
                    last_failure = format!("{key}: {err}");
                }
            }
        }

        Acquire::Deferred(last_failure)
    }

    fn handle(&self, connection: OutboundConnection, limits: Limits) -> PooledHandle {
        PooledHandle {
            connection,
            pool: self.clone(),
            limits,
            released: false,
        }
    }

    fn pop_idle(&self, key: &ConnectionKey) -> Option<OutboundConnection> {
        let mut idle = self.inner.idle.get_mut(key)?;
        while let Some(connection) = idle.pop_front() {
            if connection.claim() {
                return Some(connection);
            }
        }
        None
    }

    fn reserve(&self, key: &ConnectionKey, max: Option<u64>) -> Option<OpenPermit> {
        let mut count = self.inner.open.entry(key.clone()).or_insert(0);
        if max.is_some_and(|max| u64::try_from(*count).unwrap_or(u64::MAX) >= max) {
            return None;
        }
        *count += 1;

        Some(OpenPermit {
            counts: Arc::clone(&self.inner.open),
            key: key.clone(),
        })
    }

    /// An address for `host` reachable from `local`.
    async fn address_of(&self, host: &str, local: IpAddr) -> Result<SocketAddr, String> {
        let port = self.inner.port;
        if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        let addresses = self
            .inner
            .lookup
            .addresses(host)
            .await
            .map_err(|err| format!("{host}: {err}"))?;

        addresses
            .into_iter()
            .find(|address| local.is_unspecified() || address.is_ipv4() == local.is_ipv4())
            .map(|address| SocketAddr::new(address, port))
            .ok_or_else(|| format!("{host} has no usable address from {local}"))
    }

    fn put_back(&self, connection: OutboundConnection) {
        let key = connection.key().clone();
        if self.inner.closed.load(Ordering::Acquire) || !connection.unclaim() {
            connection.close_in_background();
            return;
        }

        internal!("Returning {key} to the pool");
        self.inner.idle.entry(key).or_default().push_back(connection);
    }

    /// Stop pooling and quit every idle connection.
    pub async fn dispose_all(&self) {
        self.inner.closed.store(true, Ordering::Release);

        let connections: Vec<OutboundConnection> = self
            .inner
            .idle
            .iter_mut()
            .flat_map(|mut idle| idle.drain(..).collect::<Vec<_>>())
            .filter(OutboundConnection::claim)
            .collect();
        self.inner.idle.clear();

        internal!(level = DEBUG, "Closing {} pooled connections", connections.len());
        join_all(connections.iter().map(OutboundConnection::quit)).await;
    }
}

/// A connection on loan from the pool. Closed on drop unless released.
#[derive(Debug)]
pub struct PooledHandle {
    connection: OutboundConnection,
    pool: ConnectionPool,
    limits: Limits,
    released: bool,
}

impl PooledHandle {
    /// Limits of the rule the connection's MX matched.
    #[must_use]
    pub const fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Give the connection back for reuse. A closed connection is dropped
    /// instead.
    pub fn release(mut self) {
        self.released = true;
        if self.connection.is_connected() {
            self.pool.put_back(self.connection.clone());
        }
    }

    /// Quit the connection rather than pool it.
    pub async fn close(mut self) {
        self.released = true;
        self.connection.quit().await;
    }
}

impl Deref for PooledHandle {
    type Target = OutboundConnection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        if !self.released {
            self.connection.close_in_background();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn permits_count_open_connections() {
        let pool = ConnectionPool::new(
            Arc::new(crate::dns::StaticLookup::new()),
            Arc::default(),
            ConnectionSettings::default(),
            25,
        );
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        let key = ConnectionKey::new(ip, "mx.test");

        let first = pool.reserve(&key, Some(2)).unwrap();
        let second = pool.reserve(&key, Some(2)).unwrap();
        assert!(pool.reserve(&key, Some(2)).is_none());
        assert_eq!(pool.open_count(ip, "MX.test"), 2);

        drop(first);
        assert_eq!(pool.open_count(ip, "mx.test"), 1);
        assert!(pool.reserve(&key, None).is_some());

        drop(second);
        assert_eq!(pool.open_count(ip, "mx.test"), 0);
    }

    #[tokio::test]
    async fn ip_literal_hosts_skip_lookup() {
        let pool = ConnectionPool::new(
            Arc::new(crate::dns::StaticLookup::new()),
            Arc::default(),
            ConnectionSettings::default(),
            2525,
        );
        let local: IpAddr = "0.0.0.0".parse().unwrap();

        assert_eq!(
            pool.address_of("127.0.0.1", local).await.unwrap(),
            "127.0.0.1:2525".parse().unwrap()
        );
        assert_eq!(
            pool.address_of("[::1]", local).await.unwrap(),
            "[::1]:2525".parse().unwrap()
        );
        assert!(pool.address_of("unknown.test", local).await.is_err());
    }

    #[tokio::test]
    async fn blocked_first_candidate_defers_without_fallback() {
        let tracker = Arc::new(ServiceUnavailableTracker::default());
        let pool = ConnectionPool::new(
            Arc::new(crate::dns::StaticLookup::new()),
            Arc::clone(&tracker),
            ConnectionSettings::default(),
            25,
        );
        let endpoint = SendingEndpoint::unbound("out.test");
        tracker.record(endpoint.ip, "mx1.test", std::time::Instant::now());

        let now = std::time::Instant::now();
        let candidates = vec![
            (
                MxRecord {
                    host: "mx1.test".to_string(),
                    preference: 10,
                    ttl: std::time::Duration::from_secs(60),
                    looked_up_at: now,
                },
                Limits::default(),
            ),
            (
                MxRecord {
                    host: "127.0.0.1".to_string(),
                    preference: 20,
                    ttl: std::time::Duration::from_secs(60),
                    looked_up_at: now,
                },
                Limits::default(),
            ),
        ];

        assert!(matches!(
            pool.try_acquire(&endpoint, &candidates).await,
            Acquire::Deferred(_)
        ));
        assert_eq!(pool.open_count(endpoint.ip, "127.0.0.1"), 0);
    }
}
