//! SMTP mailbox parsing for `MAIL FROM` and `RCPT TO` arguments.
//!
//! Accepts the RFC 5321 `Path` form (`<local@domain>`), tolerating a bare
//! mailbox without angle brackets since enough clients send one. Source
//! routes (`<@a,@b:user@c>`) are accepted and the route is discarded.

use std::{
    fmt::{self, Display},
    net::{Ipv4Addr, Ipv6Addr},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_PATH: usize = 256;
const MAX_LOCAL_PART: usize = 64;
const MAX_DOMAIN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Empty address")]
    Empty,
    #[error("Path exceeds 256 octets")]
    PathTooLong,
    #[error("Local-part exceeds 64 octets")]
    LocalPartTooLong,
    #[error("Domain exceeds 255 octets")]
    DomainTooLong,
    #[error("Unbalanced angle brackets")]
    UnbalancedBrackets,
    #[error("Missing '@' separator in mailbox")]
    MissingAtSign,
    #[error("Invalid local-part: {0}")]
    InvalidLocalPart(String),
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),
}

/// A parsed `local-part@domain` mailbox.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub local_part: String,
    pub domain: String,
}

impl Address {
    /// Parse a forward-path (`RCPT TO` argument). The null path is not allowed.
    ///
    /// # Errors
    ///
    /// Returns an [`AddressError`] describing the first syntax problem found.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let mailbox = strip_path(input)?;
        if mailbox.is_empty() {
            return Err(AddressError::Empty);
        }
        parse_mailbox(mailbox)
    }

    /// Parse a reverse-path (`MAIL FROM` argument), where `<>` is the null sender.
    ///
    /// # Errors
    ///
    /// Returns an [`AddressError`] describing the first syntax problem found.
    pub fn parse_reverse(input: &str) -> Result<Option<Self>, AddressError> {
        let mailbox = strip_path(input)?;
        if mailbox.is_empty() {
            if input.trim().starts_with('<') {
                return Ok(None);
            }
            return Err(AddressError::Empty);
        }
        parse_mailbox(mailbox).map(Some)
    }

    /// The domain in lowercase, which is how every lookup keys it.
    #[must_use]
    pub fn domain_key(&self) -> String {
        self.domain.to_ascii_lowercase()
    }

    /// Whether the mailbox carries any byte outside 7-bit ASCII.
    #[must_use]
    pub fn is_ascii(&self) -> bool {
        self.local_part.is_ascii() && self.domain.is_ascii()
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

fn strip_path(input: &str) -> Result<&str, AddressError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AddressError::Empty);
    }
    if trimmed.len() > MAX_PATH {
        return Err(AddressError::PathTooLong);
    }

    let inner = match (trimmed.starts_with('<'), trimmed.ends_with('>')) {
        (true, true) => &trimmed[1..trimmed.len() - 1],
        (false, false) => trimmed,
        _ => return Err(AddressError::UnbalancedBrackets),
    };

    // Source route, obsolete but still legal
    if inner.starts_with('@') {
        return inner
            .split_once(':')
            .map(|(_, mailbox)| mailbox)
            .ok_or(AddressError::MissingAtSign);
    }

    Ok(inner)
}

fn parse_mailbox(mailbox: &str) -> Result<Address, AddressError> {
    let (local_part, domain) = mailbox
        .rsplit_once('@')
        .ok_or(AddressError::MissingAtSign)?;

    validate_local_part(local_part)?;
    validate_domain(domain)?;

    Ok(Address {
        local_part: local_part.to_string(),
        domain: domain.to_string(),
    })
}

const fn is_atext(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '-'
                | '/'
                | '='
                | '?'
                | '^'
                | '_'
                | '`'
                | '{'
                | '|'
                | '}'
                | '~'
        )
}

fn validate_local_part(local: &str) -> Result<(), AddressError> {
    if local.is_empty() {
        return Err(AddressError::InvalidLocalPart("empty".to_string()));
    }
    if local.len() > MAX_LOCAL_PART {
        return Err(AddressError::LocalPartTooLong);
    }

    if let Some(quoted) = local.strip_prefix('"') {
        let body = quoted
            .strip_suffix('"')
            .ok_or_else(|| AddressError::InvalidLocalPart("unclosed quoted string".to_string()))?;
        let mut escaped = false;
        for c in body.chars() {
            match (escaped, c) {
                (true, ' '..='~') => escaped = false,
                (false, '\\') => escaped = true,
                (false, '"') => {
                    return Err(AddressError::InvalidLocalPart(
                        "unescaped quote".to_string(),
                    ));
                }
                (false, ' '..='~') => {}
                _ => return Err(AddressError::InvalidLocalPart(format!("character {c:?}"))),
            }
        }
        return if escaped {
            Err(AddressError::InvalidLocalPart(
                "dangling escape".to_string(),
            ))
        } else {
            Ok(())
        };
    }

    if local.split('.').any(str::is_empty) {
        return Err(AddressError::InvalidLocalPart(
            "empty atom in dot-string".to_string(),
        ));
    }

    // Non-ASCII is tolerated so SMTPUTF8 style mailboxes survive
    match local.chars().find(|&c| c != '.' && !is_atext(c) && c.is_ascii()) {
        Some(c) => Err(AddressError::InvalidLocalPart(format!("character {c:?}"))),
        None => Ok(()),
    }
}

fn validate_domain(domain: &str) -> Result<(), AddressError> {
    if domain.is_empty() {
        return Err(AddressError::InvalidDomain("empty".to_string()));
    }
    if domain.len() > MAX_DOMAIN {
        return Err(AddressError::DomainTooLong);
    }

    if let Some(literal) = domain.strip_prefix('[') {
        let literal = literal
            .strip_suffix(']')
            .ok_or_else(|| AddressError::InvalidDomain(domain.to_string()))?;
        let valid = literal
            .strip_prefix("IPv6:")
            .map_or_else(|| literal.parse::<Ipv4Addr>().is_ok(), |v6| {
                v6.parse::<Ipv6Addr>().is_ok()
            });
        return if valid {
            Ok(())
        } else {
            Err(AddressError::InvalidDomain(domain.to_string()))
        };
    }

    let domain = domain.strip_suffix('.').unwrap_or(domain);
    for label in domain.split('.') {
        let bytes = label.as_bytes();
        let valid = !bytes.is_empty()
            && bytes.len() <= 63
            && label
                .chars()
                .all(|c| c.is_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-');
        if !valid {
            return Err(AddressError::InvalidDomain(domain.to_string()));
        }
    }

    Ok(())
}
