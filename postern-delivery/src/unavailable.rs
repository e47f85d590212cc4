//! Short-lived blocks on (sending IP, MX host) pairs that answered 421.
//!
//! A remote MX replying "service not available" usually means it is
//! throttling our sending IP. Recording the refusal lets subsequent
//! attempts through the same pair defer without opening a connection until
//! the window passes.

use std::{
    net::IpAddr,
    time::{Duration, Instant},
};

use dashmap::{DashMap, mapref::entry::Entry};
use postern_common::internal;

/// Default length of a block.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct ServiceUnavailableTracker {
    entries: DashMap<(IpAddr, String), Instant>,
    window: Duration,
}

impl Default for ServiceUnavailableTracker {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl ServiceUnavailableTracker {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            window,
        }
    }

    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    fn key(ip: IpAddr, host: &str) -> (IpAddr, String) {
        (ip.to_canonical(), host.to_ascii_lowercase())
    }

    /// Note that `host` refused `ip` at `at`. An older timestamp never
    /// replaces a newer one.
    pub fn record(&self, ip: IpAddr, host: &str, at: Instant) {
        match self.entries.entry(Self::key(ip, host)) {
            Entry::Occupied(mut entry) => {
                if at > *entry.get() {
                    entry.insert(at);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(at);
            }
        }

        internal!(level = DEBUG, "Blocking {ip} -> {host} for {:?}", self.window);
    }

    /// The last recorded refusal for the pair.
    #[must_use]
    pub fn last_failure(&self, ip: IpAddr, host: &str) -> Option<Instant> {
        self.entries.get(&Self::key(ip, host)).map(|at| *at)
    }

    #[must_use]
    pub fn is_blocked(&self, ip: IpAddr, host: &str) -> bool {
        self.is_blocked_at(ip, host, Instant::now())
    }

    #[must_use]
    pub fn is_blocked_at(&self, ip: IpAddr, host: &str, now: Instant) -> bool {
        self.last_failure(ip, host)
            .is_some_and(|at| now.saturating_duration_since(at) < self.window)
    }

    /// Drop entries whose window has passed, returning how many went.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, at| now.saturating_duration_since(*at) < self.window);
        before.saturating_sub(self.entries.len())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
