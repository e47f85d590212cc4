//! MX resolution for mail delivery.
//!
//! Lookups go through the [`MxLookup`] trait so the live resolver
//! ([`HickoryLookup`]) can be swapped for a fixed table ([`StaticLookup`]).
//! [`MxResolver`] layers a per-domain cache on top.
//!
//! # Caching
//!
//! - Keyed by the lowercased domain, held in a `DashMap`
//! - Each record carries its own lookup time and TTL; an entry is only
//!   served while none of its records is dead
//! - Record TTLs are clamped to the configured min/max bounds
//! - A fresh lookup replaces the entry wholesale, it never merges
//! - [`MxResolver::invalidate`] and [`MxResolver::clear`] drop entries on demand

use std::{
    collections::HashMap,
    fmt,
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::{
    ResolveError, TokioResolver, config::ResolverOpts, name_server::TokioConnectionProvider,
    proto::rr::Record,
};
use postern_common::internal;
use serde::Deserialize;
use thiserror::Error;

/// Preference given to an implicit MX (RFC 5321 section 5.1).
const IMPLICIT_MX_PREFERENCE: u16 = 10;

/// TTL given to an implicit MX.
const IMPLICIT_MX_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DnsError {
    /// The domain exists but publishes neither MX nor address records.
    #[error("No mail servers found for domain: {0}")]
    NoMailServers(String),

    /// NXDOMAIN
    #[error("Domain does not exist: {0}")]
    DomainNotFound(String),

    /// The resolver itself failed (timeout, SERVFAIL, network).
    #[error("DNS lookup failed: {0}")]
    ResolutionError(String),
}

impl DnsError {
    /// Returns `true` if this error is temporary and should be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::ResolutionError(_))
    }
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_min_ttl_secs() -> u64 {
    60
}

const fn default_max_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    /// DNS query timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Lower bound applied to record TTLs
    #[serde(default = "default_min_ttl_secs")]
    pub min_ttl_secs: u64,

    /// Upper bound applied to record TTLs
    #[serde(default = "default_max_ttl_secs")]
    pub max_ttl_secs: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            min_ttl_secs: default_min_ttl_secs(),
            max_ttl_secs: default_max_ttl_secs(),
        }
    }
}

impl DnsConfig {
    fn clamp(&self, ttl: Duration) -> Duration {
        let min = Duration::from_secs(self.min_ttl_secs);
        let max = Duration::from_secs(self.max_ttl_secs.max(self.min_ttl_secs));
        ttl.clamp(min, max)
    }
}

/// A mail exchanger as returned by a lookup, before caching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchanger {
    pub host: String,
    pub preference: u16,
    pub ttl: Duration,
}

impl Exchanger {
    pub fn new(host: impl Into<String>, preference: u16, ttl: Duration) -> Self {
        Self {
            host: host.into(),
            preference,
            ttl,
        }
    }
}

/// The DNS queries delivery needs.
#[async_trait]
pub trait MxLookup: Send + Sync + fmt::Debug {
    /// MX records for `domain`. An empty list means the domain exists but
    /// publishes no MX.
    ///
    /// # Errors
    ///
    /// [`DnsError::DomainNotFound`] for NXDOMAIN, [`DnsError::ResolutionError`]
    /// when the resolver fails.
    async fn mx(&self, domain: &str) -> Result<Vec<Exchanger>, DnsError>;

    /// Addresses for `host`. An empty list means the name exists without
    /// address records.
    ///
    /// # Errors
    ///
    /// As for [`MxLookup::mx`].
    async fn addresses(&self, host: &str) -> Result<Vec<IpAddr>, DnsError>;
}

/// Live DNS through hickory, using the system resolver configuration.
#[derive(Debug)]
pub struct HickoryLookup {
    resolver: TokioResolver,
}

impl HickoryLookup {
    /// # Errors
    ///
    /// Returns an error if the system DNS configuration cannot be loaded.
    pub fn new(config: &DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())
            .map_err(|err| DnsError::ResolutionError(err.to_string()))?
            .with_options(opts)
            .build();

        Ok(Self { resolver })
    }

    fn classify(domain: &str, err: &ResolveError) -> Option<DnsError> {
        if err.is_nx_domain() {
            Some(DnsError::DomainNotFound(domain.to_string()))
        } else if err.is_no_records_found() {
            None
        } else {
            Some(DnsError::ResolutionError(format!("{domain}: {err}")))
        }
    }
}

#[async_trait]
impl MxLookup for HickoryLookup {
    async fn mx(&self, domain: &str) -> Result<Vec<Exchanger>, DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let ttl = lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(Record::ttl)
                    .min()
                    .unwrap_or(300);

                Ok(lookup
                    .iter()
                    .map(|mx| {
                        Exchanger::new(
                            mx.exchange().to_utf8().trim_end_matches('.'),
                            mx.preference(),
                            Duration::from_secs(u64::from(ttl)),
                        )
                    })
                    .collect())
            }
            Err(err) => Self::classify(domain, &err).map_or_else(|| Ok(Vec::new()), Err),
        }
    }

    async fn addresses(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => Ok(lookup.iter().collect()),
            Err(err) => Self::classify(host, &err).map_or_else(|| Ok(Vec::new()), Err),
        }
    }
}

/// A fixed table of answers, for tests and closed networks.
#[derive(Debug, Clone, Default)]
pub struct StaticLookup {
    mx: HashMap<String, Vec<Exchanger>>,
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticLookup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an MX for `domain`.
    #[must_use]
    pub fn with_mx(mut self, domain: &str, host: &str, preference: u16, ttl: Duration) -> Self {
        self.mx
            .entry(domain.to_ascii_lowercase())
            .or_default()
            .push(Exchanger::new(host, preference, ttl));
        self
    }

    /// Publish an address record for `host`.
    #[must_use]
    pub fn with_host(mut self, host: &str, address: IpAddr) -> Self {
        self.hosts
            .entry(host.to_ascii_lowercase())
            .or_default()
            .push(address);
        self
    }

    fn exists(&self, name: &str) -> bool {
        self.mx.contains_key(name) || self.hosts.contains_key(name)
    }
}

#[async_trait]
impl MxLookup for StaticLookup {
    async fn mx(&self, domain: &str) -> Result<Vec<Exchanger>, DnsError> {
        let domain = domain.to_ascii_lowercase();
        match self.mx.get(&domain) {
            Some(records) => Ok(records.clone()),
            None if self.exists(&domain) => Ok(Vec::new()),
            None => Err(DnsError::DomainNotFound(domain)),
        }
    }

    async fn addresses(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        let host = host.to_ascii_lowercase();
        match self.hosts.get(&host) {
            Some(addresses) => Ok(addresses.clone()),
            None if self.exists(&host) => Ok(Vec::new()),
            None => Err(DnsError::DomainNotFound(host)),
        }
    }
}

/// One cached MX record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub host: String,
    /// Lower is tried first
    pub preference: u16,
    pub ttl: Duration,
    pub looked_up_at: Instant,
}

impl MxRecord {
    /// Whether the record has outlived its TTL at `now`.
    #[must_use]
    pub fn is_dead(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.looked_up_at) > self.ttl
    }
}

/// Resolves domains to preference-ordered MX records, caching by TTL.
#[derive(Debug)]
pub struct MxResolver {
    lookup: Arc<dyn MxLookup>,
    cache: DashMap<String, Arc<[MxRecord]>>,
    config: DnsConfig,
}

impl MxResolver {
    #[must_use]
    pub fn new(lookup: Arc<dyn MxLookup>, config: DnsConfig) -> Self {
        Self {
            lookup,
            cache: DashMap::new(),
            config,
        }
    }

    #[must_use]
    pub fn lookup(&self) -> &Arc<dyn MxLookup> {
        &self.lookup
    }

    /// Resolve `domain` to its mail exchangers, most preferred first.
    ///
    /// Without MX records, a domain that itself has addresses gets an
    /// implicit MX pointing at the domain.
    ///
    /// # Errors
    ///
    /// - [`DnsError::DomainNotFound`] when the domain does not exist
    /// - [`DnsError::NoMailServers`] when it exists without MX or addresses
    /// - [`DnsError::ResolutionError`] when the resolver fails
    pub async fn resolve(&self, domain: &str) -> Result<Arc<[MxRecord]>, DnsError> {
        self.resolve_at(domain, Instant::now()).await
    }

    /// As [`MxResolver::resolve`], judging cache liveness at `now`.
    ///
    /// # Errors
    ///
    /// As for [`MxResolver::resolve`].
    pub async fn resolve_at(&self, domain: &str, now: Instant) -> Result<Arc<[MxRecord]>, DnsError> {
        let key = domain.trim_end_matches('.').to_ascii_lowercase();

        if let Some(cached) = self.cache.get(&key)
            && !cached.iter().any(|record| record.is_dead(now))
        {
            return Ok(Arc::clone(&*cached));
        }

        let records: Arc<[MxRecord]> = self.resolve_uncached(&key, now).await?.into();
        internal!(
            level = DEBUG,
            "Resolved {key} to {}",
            records
                .iter()
                .map(|record| format!("{}({})", record.host, record.preference))
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.cache.insert(key, Arc::clone(&records));
        Ok(records)
    }

    async fn resolve_uncached(&self, domain: &str, now: Instant) -> Result<Vec<MxRecord>, DnsError> {
        let mut exchangers = self.lookup.mx(domain).await?;

        if exchangers.is_empty() {
            if self.lookup.addresses(domain).await?.is_empty() {
                return Err(DnsError::NoMailServers(domain.to_string()));
            }
            internal!(level = DEBUG, "No MX for {domain}, using implicit MX");
            exchangers.push(Exchanger::new(domain, IMPLICIT_MX_PREFERENCE, IMPLICIT_MX_TTL));
        }

        exchangers.sort_by_key(|exchanger| exchanger.preference);

        Ok(exchangers
            .into_iter()
            .map(|exchanger| MxRecord {
                host: exchanger.host.to_ascii_lowercase(),
                preference: exchanger.preference,
                ttl: self.config.clamp(exchanger.ttl),
                looked_up_at: now,
            })
            .collect())
    }

    /// Forget the cached answer for `domain`.
    pub fn invalidate(&self, domain: &str) {
        self.cache
            .remove(&domain.trim_end_matches('.').to_ascii_lowercase());
    }

    /// Forget every cached answer.
    pub fn clear(&self) {
        self.cache.clear();
    }

    #[must_use]
    pub fn cached(&self, domain: &str) -> Option<Arc<[MxRecord]>> {
        self.cache
            .get(&domain.to_ascii_lowercase())
            .map(|records| Arc::clone(&*records))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn config() -> DnsConfig {
        DnsConfig {
            min_ttl_secs: 0,
            ..DnsConfig::default()
        }
    }

    /// Counts lookups and serves answers that can change between calls.
    #[derive(Debug, Default)]
    struct Scripted {
        calls: AtomicUsize,
        answers: parking_lot::Mutex<Vec<Vec<Exchanger>>>,
    }

    #[async_trait]
    impl MxLookup for Scripted {
        async fn mx(&self, _domain: &str) -> Result<Vec<Exchanger>, DnsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut answers = self.answers.lock();
            if answers.len() > 1 {
                Ok(answers.remove(0))
            } else {
                Ok(answers[0].clone())
            }
        }

        async fn addresses(&self, _host: &str) -> Result<Vec<IpAddr>, DnsError> {
            Ok(vec!["192.0.2.1".parse().unwrap()])
        }
    }

    #[tokio::test]
    async fn records_are_sorted_by_preference() {
        let lookup = StaticLookup::new()
            .with_mx("example.test", "mx30.example.test", 30, MINUTE)
            .with_mx("example.test", "mx10.example.test", 10, MINUTE)
            .with_mx("example.test", "mx20.example.test", 20, MINUTE);
        let resolver = MxResolver::new(Arc::new(lookup), config());

        let records = resolver.resolve("Example.TEST").await.unwrap();
        let preferences: Vec<_> = records.iter().map(|r| r.preference).collect();
        assert_eq!(preferences, vec![10, 20, 30]);
        assert!(resolver.cached("example.test").is_some());
    }

    #[tokio::test]
    async fn implicit_mx_when_domain_resolves() {
        let lookup =
            StaticLookup::new().with_host("bare.test", "192.0.2.25".parse().unwrap());
        let resolver = MxResolver::new(Arc::new(lookup), config());

        let records = resolver.resolve("bare.test").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].host, "bare.test");
        assert_eq!(records[0].preference, 10);
        assert_eq!(records[0].ttl, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn missing_domain_is_not_found() {
        let resolver = MxResolver::new(Arc::new(StaticLookup::new()), config());
        assert_eq!(
            resolver.resolve("nowhere.test").await,
            Err(DnsError::DomainNotFound("nowhere.test".to_string()))
        );
        assert!(resolver.cached("nowhere.test").is_none());
    }

    #[tokio::test]
    async fn cache_hit_until_a_record_dies_then_replaced() {
        let lookup = Arc::new(Scripted::default());
        *lookup.answers.lock() = vec![
            vec![
                Exchanger::new("a.test", 10, MINUTE),
                Exchanger::new("b.test", 20, Duration::from_secs(10)),
            ],
            vec![Exchanger::new("c.test", 5, MINUTE)],
        ];
        let resolver = MxResolver::new(Arc::clone(&lookup) as Arc<dyn MxLookup>, config());
        let start = Instant::now();

        let first = resolver.resolve_at("example.test", start).await.unwrap();
        assert_eq!(first.len(), 2);

        let again = resolver
            .resolve_at("example.test", start + Duration::from_secs(5))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);

        // b.test died after 10s, so the whole entry is refreshed and replaced
        let refreshed = resolver
            .resolve_at("example.test", start + Duration::from_secs(11))
            .await
            .unwrap();
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
        assert_eq!(refreshed.len(), 1);
        assert_eq!(refreshed[0].host, "c.test");
    }

    #[tokio::test]
    async fn invalidate_forces_lookup() {
        let lookup = Arc::new(Scripted::default());
        *lookup.answers.lock() = vec![vec![Exchanger::new("a.test", 10, MINUTE)]];
        let resolver = MxResolver::new(Arc::clone(&lookup) as Arc<dyn MxLookup>, config());

        resolver.resolve("example.test").await.unwrap();
        resolver.invalidate("EXAMPLE.test");
        resolver.resolve("example.test").await.unwrap();
        resolver.clear();
        resolver.resolve("example.test").await.unwrap();
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn ttls_are_clamped() {
        let config = DnsConfig::default();
        assert_eq!(config.clamp(Duration::from_secs(5)), Duration::from_secs(60));
        assert_eq!(config.clamp(Duration::from_secs(86400)), Duration::from_secs(3600));
        assert_eq!(config.clamp(Duration::from_secs(600)), Duration::from_secs(600));
    }

    #[test]
    fn dead_records() {
        let now = Instant::now();
        let record = MxRecord {
            host: "mx.test".to_string(),
            preference: 10,
            ttl: MINUTE,
            looked_up_at: now,
        };
        assert!(!record.is_dead(now + MINUTE));
        assert!(record.is_dead(now + MINUTE + Duration::from_secs(1)));
    }

    #[test]
    fn dns_error_is_temporary() {
        assert!(DnsError::ResolutionError("example.com".to_string()).is_temporary());
        assert!(!DnsError::NoMailServers("example.com".to_string()).is_temporary());
        assert!(!DnsError::DomainNotFound("example.com".to_string()).is_temporary());
    }

    #[tokio::test]
    #[ignore = "Requires network access"]
    async fn live_lookup() {
        let lookup = HickoryLookup::new(&DnsConfig::default()).unwrap();
        let resolver = MxResolver::new(Arc::new(lookup), DnsConfig::default());
        let records = resolver.resolve("gmail.com").await.unwrap();
        assert!(records.windows(2).all(|w| w[0].preference <= w[1].preference));
    }
}
