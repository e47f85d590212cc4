//! SMTP for postern: the inbound server (command parsing, per-connection
//! state machine, relay routing) and the outbound wire client.

pub mod client;
pub mod command;
pub mod listener;
pub mod relay;
pub mod session;
pub mod state;

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use postern_spool::{LocalDelivery, QueueStore};
use serde::Deserialize;

pub use crate::{
    listener::Listener,
    relay::{RelayPolicy, Route},
    session::{Session, SessionConfig},
    state::State,
};

const fn default_receive_timeout_secs() -> u64 {
    300
}

const fn default_send_timeout_secs() -> u64 {
    60
}

const fn default_max_message_size() -> usize {
    25 * 1024 * 1024
}

fn default_banner() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_group() -> String {
    "default".to_string()
}

/// Inbound server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpServer {
    pub socket: SocketAddr,
    /// Hostname used in greetings and Received headers
    #[serde(default = "default_banner")]
    pub banner: String,
    /// Domains whose mail is delivered to the local drop
    #[serde(default)]
    pub local_domains: Vec<String>,
    /// Peers allowed to relay to non-local domains
    #[serde(default)]
    pub relay_allow: Vec<IpAddr>,
    #[serde(default = "default_receive_timeout_secs")]
    pub receive_timeout_secs: u64,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    /// 0 disables the limit
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Sending group relayed messages are queued under
    #[serde(default = "default_group")]
    pub group: String,
}

impl SmtpServer {
    #[must_use]
    pub fn new(socket: SocketAddr) -> Self {
        Self {
            socket,
            banner: default_banner(),
            local_domains: Vec::new(),
            relay_allow: Vec::new(),
            receive_timeout_secs: default_receive_timeout_secs(),
            send_timeout_secs: default_send_timeout_secs(),
            max_message_size: default_max_message_size(),
            group: default_group(),
        }
    }

    #[must_use]
    pub fn policy(&self) -> RelayPolicy {
        RelayPolicy::new(&self.local_domains, self.relay_allow.clone())
    }

    /// Build the listener, wiring sessions to the queue and local drop.
    #[must_use]
    pub fn listener(
        &self,
        queue: Arc<dyn QueueStore>,
        local: Arc<dyn LocalDelivery>,
    ) -> Listener {
        Listener::new(
            self.socket,
            Arc::new(SessionConfig {
                banner: Arc::from(self.banner.as_str()),
                policy: Arc::new(self.policy()),
                queue,
                local,
                receive_timeout: Duration::from_secs(self.receive_timeout_secs),
                send_timeout: Duration::from_secs(self.send_timeout_secs),
                max_message_size: self.max_message_size,
                group: self.group.clone(),
            }),
        )
    }
}
