//! Outbound delivery for postern
//!
//! Drains the queue store and hands each message to a remote mail
//! exchanger:
//! - MX resolution with a TTL cache ([`MxResolver`])
//! - Sending IP selection per destination ([`VirtualMtaGroups`])
//! - Admission limits from outbound rules ([`OutboundRulesEngine`])
//! - Pooled connections per (sending IP, MX host) ([`ConnectionPool`])
//! - Backoff on 421 refusals ([`ServiceUnavailableTracker`])
//! - The worker loop and retry scheduling ([`DeliveryEngine`])

pub mod connection;
pub mod dns;
pub mod engine;
pub mod error;
pub mod hourly;
pub mod pool;
pub mod retry;
pub mod rules;
pub mod unavailable;
pub mod vmta;

pub use connection::{ConnectionKey, ConnectionSettings, ConnectionState, OutboundConnection, StepOutcome};
pub use dns::{DnsConfig, DnsError, HickoryLookup, MxLookup, MxRecord, MxResolver, StaticLookup};
pub use engine::{DeliveryConfig, DeliveryEngine, DeliveryOutcome};
pub use error::DeliveryError;
pub use pool::{Acquire, ConnectionPool, PooledHandle};
pub use retry::RetryPolicy;
pub use rules::{
    Limits, OutboundRule, OutboundRulePattern, OutboundRulesEngine, PatternKind, RuleSet,
    RuleSource, RuleType, RulesError, StaticRules,
};
pub use unavailable::ServiceUnavailableTracker;
pub use vmta::{GroupConfig, SendingEndpoint, SendingGroup, VirtualMtaGroups};
