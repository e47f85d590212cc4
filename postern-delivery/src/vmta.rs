//! Virtual MTAs: the sending IPs outbound mail can leave from, grouped so
//! a message's group decides which IPs may carry it.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};

use parking_lot::Mutex;
use postern_common::internal;
use rand::seq::IndexedRandom;
use serde::Deserialize;

/// Name of the group used when a message's group is not configured.
pub const DEFAULT_GROUP: &str = "default";

const fn default_true() -> bool {
    true
}

/// One sending IP and the name it introduces itself with.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SendingEndpoint {
    pub id: u32,
    /// Name given in EHLO/HELO
    pub hostname: String,
    pub ip: IpAddr,
    #[serde(default = "default_true")]
    pub inbound: bool,
    #[serde(default = "default_true")]
    pub outbound: bool,
}

impl SendingEndpoint {
    /// An endpoint that lets the OS pick the source address.
    #[must_use]
    pub fn unbound(hostname: impl Into<String>) -> Self {
        Self {
            id: 0,
            hostname: hostname.into(),
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            inbound: true,
            outbound: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub endpoints: Vec<SendingEndpoint>,
}

/// A named pool of endpoints, balanced per destination.
///
/// Each endpoint keeps a per-MX-host counter of how often it was picked.
/// Selection takes the lowest counter for the destination and bumps it;
/// ties are broken at random. Counters live in memory only.
#[derive(Debug)]
pub struct SendingGroup {
    name: String,
    endpoints: Vec<SendingEndpoint>,
    counters: Mutex<HashMap<String, Vec<u64>>>,
}

impl SendingGroup {
    #[must_use]
    pub fn new(name: impl Into<String>, endpoints: Vec<SendingEndpoint>) -> Self {
        Self {
            name: name.into(),
            endpoints,
            counters: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn endpoints(&self) -> &[SendingEndpoint] {
        &self.endpoints
    }

    /// Pick the least used outbound endpoint for `mx_host`, or `None` when
    /// the group has no outbound endpoints.
    pub fn select_endpoint(&self, mx_host: &str) -> Option<SendingEndpoint> {
        let mut counters = self.counters.lock();
        let counts = counters
            .entry(mx_host.to_ascii_lowercase())
            .or_insert_with(|| vec![0; self.endpoints.len()]);

        let lowest = self
            .endpoints
            .iter()
            .zip(counts.iter())
            .filter(|(endpoint, _)| endpoint.outbound)
            .map(|(_, count)| *count)
            .min()?;

        let candidates: Vec<usize> = self
            .endpoints
            .iter()
            .enumerate()
            .filter(|(index, endpoint)| endpoint.outbound && counts[*index] == lowest)
            .map(|(index, _)| index)
            .collect();

        let chosen = *candidates.choose(&mut rand::rng())?;
        counts[chosen] = counts[chosen].saturating_add(1);

        Some(self.endpoints[chosen].clone())
    }

    /// How often each endpoint was picked for `mx_host`, in endpoint order.
    #[must_use]
    pub fn usage(&self, mx_host: &str) -> Vec<u64> {
        self.counters
            .lock()
            .get(&mx_host.to_ascii_lowercase())
            .cloned()
            .unwrap_or_else(|| vec![0; self.endpoints.len()])
    }
}

/// All configured sending groups.
#[derive(Debug)]
pub struct VirtualMtaGroups {
    groups: HashMap<String, Arc<SendingGroup>>,
    fallback: Arc<SendingGroup>,
}

impl VirtualMtaGroups {
    /// Build the registry. Without a group named [`DEFAULT_GROUP`], one is
    /// added holding a single unbound endpoint named `hostname`.
    #[must_use]
    pub fn new(groups: Vec<GroupConfig>, hostname: &str) -> Self {
        let mut groups: HashMap<String, Arc<SendingGroup>> = groups
            .into_iter()
            .map(|group| {
                (
                    group.name.clone(),
                    Arc::new(SendingGroup::new(group.name, group.endpoints)),
                )
            })
            .collect();

        let fallback = Arc::clone(groups.entry(DEFAULT_GROUP.to_string()).or_insert_with(|| {
            Arc::new(SendingGroup::new(
                DEFAULT_GROUP,
                vec![SendingEndpoint::unbound(hostname)],
            ))
        }));

        Self { groups, fallback }
    }

    /// The named group, or the default group when it is unknown.
    #[must_use]
    pub fn group(&self, name: &str) -> Arc<SendingGroup> {
        self.groups.get(name).map_or_else(
            || {
                internal!(level = DEBUG, "Unknown sending group {name}, using {DEFAULT_GROUP}");
                Arc::clone(&self.fallback)
            },
            Arc::clone,
        )
    }
}
