//! Outbound rules: admission-control limits chosen by matching the MX host
//! against configured patterns.
//!
//! # Matching
//!
//! Patterns are tried in configured order, with catch-all patterns moved to
//! the end so they only apply when nothing more specific did. A pattern
//! scoped to a sending IP is skipped for every other IP. The first match
//! wins and its rules make up the returned [`Limits`].
//!
//! - `List` patterns are comma separated host names, compared exactly and
//!   case-insensitively
//! - `Regex` patterns are matched case-insensitively
//!
//! A rule set without an unscoped catch-all pattern is rejected when
//! loaded, and a host that matches nothing is an error rather than an
//! unlimited default.
//!
//! # Reloading
//!
//! The compiled rules are an immutable snapshot behind an `Arc`.
//! [`OutboundRulesEngine::reload`] builds a new snapshot from the
//! [`RuleSource`] and swaps it in; lookups in progress keep the snapshot
//! they started with.

use std::{fmt, net::IpAddr, sync::Arc};

use parking_lot::RwLock;
use postern_common::internal;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use thiserror::Error;

use crate::vmta::SendingEndpoint;

/// Host names used to recognise a regex pattern that matches anything.
const CATCH_ALL_SAMPLES: [&str; 4] = ["a", "mx.example.com", "192.0.2.1", "[::1]"];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RulesError {
    #[error("No outbound rule pattern matches {0}")]
    NoMatchingPattern(String),

    #[error("Outbound rules have no unscoped catch-all pattern")]
    MissingDefault,

    #[error("Invalid regex in outbound rule pattern {id}: {reason}")]
    InvalidRegex { id: u32, reason: String },

    #[error("Outbound rule refers to unknown pattern {0}")]
    UnknownPattern(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum PatternKind {
    /// Comma separated host names
    List,
    Regex,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutboundRulePattern {
    pub id: u32,
    pub kind: PatternKind,
    pub pattern: String,
    /// Only applies to connections from this sending IP
    #[serde(default)]
    pub ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RuleType {
    MaxConnections,
    MaxMessagesPerConnection,
    MaxMessagesPerHour,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct OutboundRule {
    pub pattern_id: u32,
    pub rule_type: RuleType,
    /// Negative means unlimited
    pub value: i64,
}

/// The raw configuration a [`OutboundRulesEngine`] compiles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub patterns: Vec<OutboundRulePattern>,
    #[serde(default)]
    pub rules: Vec<OutboundRule>,
}

impl RuleSet {
    /// A single catch-all pattern with no limits.
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            patterns: vec![OutboundRulePattern {
                id: 0,
                kind: PatternKind::Regex,
                pattern: ".*".to_string(),
                ip: None,
            }],
            rules: Vec::new(),
        }
    }
}

/// Where rule sets are loaded from.
pub trait RuleSource: Send + Sync + fmt::Debug {
    /// # Errors
    ///
    /// Returns an error when the rules cannot be read.
    fn load(&self) -> Result<RuleSet, RulesError>;
}

/// Rules held in memory, replaceable for administrative edits.
#[derive(Debug, Default)]
pub struct StaticRules {
    rules: RwLock<RuleSet>,
}

impl StaticRules {
    #[must_use]
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    /// Replace the stored rules. Takes effect on the engine's next reload.
    pub fn set(&self, rules: RuleSet) {
        *self.rules.write() = rules;
    }
}

impl RuleSource for StaticRules {
    fn load(&self) -> Result<RuleSet, RulesError> {
        Ok(self.rules.read().clone())
    }
}

/// Limits for one (MX host, sending IP) pair. `None` is unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limits {
    pub max_connections: Option<u64>,
    pub max_messages_per_connection: Option<u64>,
    pub max_messages_per_hour: Option<u64>,
}

impl Limits {
    fn apply(&mut self, rule: &OutboundRule) {
        let value = u64::try_from(rule.value).ok();
        match rule.rule_type {
            RuleType::MaxConnections => self.max_connections = value,
            RuleType::MaxMessagesPerConnection => self.max_messages_per_connection = value,
            RuleType::MaxMessagesPerHour => self.max_messages_per_hour = value,
        }
    }
}

#[derive(Debug)]
enum Matcher {
    List(Vec<String>),
    Regex(Regex),
}

impl Matcher {
    fn matches(&self, host: &str) -> bool {
        match self {
            Self::List(hosts) => hosts.iter().any(|entry| entry.eq_ignore_ascii_case(host)),
            Self::Regex(regex) => regex.is_match(host),
        }
    }
}

#[derive(Debug)]
struct CompiledPattern {
    id: u32,
    ip: Option<IpAddr>,
    matcher: Matcher,
    limits: Limits,
}

#[derive(Debug, Default)]
struct Snapshot {
    patterns: Vec<CompiledPattern>,
}

impl Snapshot {
    fn compile(set: RuleSet) -> Result<Self, RulesError> {
        let mut patterns = set
            .patterns
            .into_iter()
            .map(|pattern| {
                let matcher = match pattern.kind {
                    PatternKind::List => Matcher::List(
                        pattern
                            .pattern
                            .split(',')
                            .map(str::trim)
                            .filter(|host| !host.is_empty())
                            .map(str::to_string)
                            .collect(),
                    ),
                    PatternKind::Regex => Matcher::Regex(
                        RegexBuilder::new(&pattern.pattern)
                            .case_insensitive(true)
                            .build()
                            .map_err(|err| RulesError::InvalidRegex {
                                id: pattern.id,
                                reason: err.to_string(),
                            })?,
                    ),
                };

                Ok(CompiledPattern {
                    id: pattern.id,
                    ip: pattern.ip,
                    matcher,
                    limits: Limits::default(),
                })
            })
            .collect::<Result<Vec<_>, RulesError>>()?;

        for rule in &set.rules {
            patterns
                .iter_mut()
                .find(|pattern| pattern.id == rule.pattern_id)
                .ok_or(RulesError::UnknownPattern(rule.pattern_id))?
                .limits
                .apply(rule);
        }

        // Stable, so configured order holds within each half
        patterns.sort_by_key(CompiledPattern::is_catch_all);

        if !patterns.iter().any(CompiledPattern::is_catch_all) {
            return Err(RulesError::MissingDefault);
        }

        Ok(Self { patterns })
    }

    fn lookup(&self, host: &str, ip: IpAddr) -> Option<&CompiledPattern> {
        let ip = ip.to_canonical();
        self.patterns
            .iter()
            .filter(|pattern| pattern.ip.is_none_or(|scoped| scoped.to_canonical() == ip))
            .find(|pattern| pattern.matcher.matches(host))
    }
}

impl CompiledPattern {
    fn is_catch_all(&self) -> bool {
        self.ip.is_none()
            && CATCH_ALL_SAMPLES
                .iter()
                .all(|host| self.matcher.matches(host))
    }
}

/// Resolves MX hosts to [`Limits`].
#[derive(Debug)]
pub struct OutboundRulesEngine {
    source: Arc<dyn RuleSource>,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl OutboundRulesEngine {
    /// Load and compile the initial rules.
    ///
    /// # Errors
    ///
    /// Returns an error when the rules cannot be loaded, a regex does not
    /// compile, a rule names an unknown pattern, or no catch-all exists.
    pub fn new(source: Arc<dyn RuleSource>) -> Result<Self, RulesError> {
        let snapshot = Snapshot::compile(source.load()?)?;
        Ok(Self {
            source,
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Rebuild from the source and swap the result in. On error the
    /// previous rules stay active.
    ///
    /// # Errors
    ///
    /// As for [`OutboundRulesEngine::new`].
    pub fn reload(&self) -> Result<(), RulesError> {
        let snapshot = Arc::new(Snapshot::compile(self.source.load()?)?);
        internal!(
            level = INFO,
            "Reloaded {} outbound rule patterns",
            snapshot.patterns.len()
        );
        *self.snapshot.write() = snapshot;
        Ok(())
    }

    /// Limits for delivering to `mx_host` from `endpoint`.
    ///
    /// # Errors
    ///
    /// [`RulesError::NoMatchingPattern`] when no pattern matches, which can
    /// only happen if the rules are misconfigured.
    pub fn get_rules(&self, mx_host: &str, endpoint: &SendingEndpoint) -> Result<Limits, RulesError> {
        let snapshot = Arc::clone(&*self.snapshot.read());

        snapshot
            .lookup(mx_host, endpoint.ip)
            .map(|pattern| {
                internal!("{mx_host} via {} matched pattern {}", endpoint.ip, pattern.id);
                pattern.limits
            })
            .ok_or_else(|| RulesError::NoMatchingPattern(mx_host.to_string()))
    }
}
