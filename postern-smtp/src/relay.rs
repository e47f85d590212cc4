//! Local-or-relay routing for inbound recipients.

use std::net::IpAddr;

use ahash::AHashSet;
use postern_common::address::Address;

/// Where an accepted recipient is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Addressed to one of our own domains; goes to the local drop.
    Local,
    /// Forwarded onward through the outbound queue.
    Relay,
}

/// Decides, per recipient, whether mail is ours to keep or ours to forward,
/// and whether the connecting peer may ask us to forward at all.
#[derive(Debug, Clone, Default)]
pub struct RelayPolicy {
    local_domains: AHashSet<String>,
    relay_allow: Vec<IpAddr>,
}

impl RelayPolicy {
    pub fn new<D, S>(local_domains: D, relay_allow: Vec<IpAddr>) -> Self
    where
        D: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            local_domains: local_domains
                .into_iter()
                .map(|domain| domain.as_ref().trim().to_ascii_lowercase())
                .filter(|domain| !domain.is_empty())
                .collect(),
            relay_allow,
        }
    }

    #[must_use]
    pub fn is_local(&self, domain: &str) -> bool {
        self.local_domains.contains(&domain.to_ascii_lowercase())
    }

    #[must_use]
    pub fn may_relay(&self, peer: IpAddr) -> bool {
        let peer = peer.to_canonical();
        self.relay_allow
            .iter()
            .any(|allowed| allowed.to_canonical() == peer)
    }

    /// Route `recipient` for a connection from `peer`. `None` means the
    /// recipient needs relaying and `peer` is not allowed to relay.
    #[must_use]
    pub fn classify(&self, recipient: &Address, peer: IpAddr) -> Option<Route> {
        if self.is_local(&recipient.domain) {
            Some(Route::Local)
        } else if self.may_relay(peer) {
            Some(Route::Relay)
        } else {
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn policy() -> RelayPolicy {
        RelayPolicy::new(["LocalDomain", " example.test "], vec!["10.0.0.5".parse().unwrap()])
    }

    #[test]
    fn local_domains_are_case_insensitive() {
        let policy = policy();
        assert!(policy.is_local("localdomain"));
        assert!(policy.is_local("EXAMPLE.TEST"));
        assert!(!policy.is_local("elsewhere.test"));
    }

    #[test]
    fn classify_routes_by_domain_then_peer() {
        let policy = policy();
        let local = Address::parse("z@localdomain").unwrap();
        let remote = Address::parse("z@remote.test").unwrap();
        let allowed: IpAddr = "10.0.0.5".parse().unwrap();
        let stranger: IpAddr = "192.0.2.1".parse().unwrap();

        assert_eq!(policy.classify(&local, stranger), Some(Route::Local));
        assert_eq!(policy.classify(&remote, allowed), Some(Route::Relay));
        assert_eq!(policy.classify(&remote, stranger), None);
    }

    #[test]
    fn mapped_ipv4_peers_match() {
        let policy = policy();
        let mapped: IpAddr = "::ffff:10.0.0.5".parse().unwrap();
        assert!(policy.may_relay(mapped));
    }
}
