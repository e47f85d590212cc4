//! Typed error handling for delivery operations.
//!
//! Every failed attempt lands in one of three buckets:
//! - Permanent failures (5xx replies, unknown domains) fail the message
//! - Temporary failures (4xx replies, connection trouble, DNS hiccups,
//!   throttling) defer it with backoff
//! - System errors (configuration faults) stop the engine

use postern_smtp::client::ClientError;
use thiserror::Error;

use crate::{dns::DnsError, rules::RulesError};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Permanent failure that should not be retried.
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// Temporary failure that is retried with backoff.
    #[error("Temporary failure: {0}")]
    Temporary(String),

    /// The engine cannot safely continue.
    #[error("System error: {0}")]
    System(String),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }

    /// The reason without the classification prefix.
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::Permanent(reason) | Self::Temporary(reason) | Self::System(reason) => reason,
        }
    }
}

impl From<DnsError> for DeliveryError {
    fn from(error: DnsError) -> Self {
        match error {
            DnsError::NoMailServers(_) | DnsError::DomainNotFound(_) => {
                Self::Permanent(error.to_string())
            }
            DnsError::ResolutionError(_) => Self::Temporary(error.to_string()),
        }
    }
}

impl From<RulesError> for DeliveryError {
    fn from(error: RulesError) -> Self {
        Self::System(error.to_string())
    }
}

/// Classify a transport error by reply code: 4xx temporary, 5xx permanent,
/// anything else (I/O, timeouts, garbage) temporary.
impl From<ClientError> for DeliveryError {
    fn from(error: ClientError) -> Self {
        match error.code() {
            Some(code) if (500..600).contains(&code) => Self::Permanent(error.to_string()),
            _ => Self::Temporary(error.to_string()),
        }
    }
}
