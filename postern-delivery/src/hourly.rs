//! Fixed one-hour message windows per (sending IP, MX host), backing the
//! `MaxMessagesPerHour` rule.

use std::{
    net::IpAddr,
    time::{Duration, Instant},
};

use dashmap::DashMap;

pub const WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    sent: u64,
}

#[derive(Debug, Default)]
pub struct HourlyCounter {
    windows: DashMap<(IpAddr, String), Window>,
}

impl HourlyCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one message against the pair's current window if `limit`
    /// allows it. When the window is full, returns when it ends.
    ///
    /// # Errors
    ///
    /// Returns the end of the current window when `limit` is reached.
    pub fn try_take(&self, ip: IpAddr, host: &str, limit: u64, now: Instant) -> Result<(), Instant> {
        let mut window = self
            .windows
            .entry((ip.to_canonical(), host.to_ascii_lowercase()))
            .or_insert(Window {
                started: now,
                sent: 0,
            });

        if now.saturating_duration_since(window.started) >= WINDOW {
            *window = Window {
                started: now,
                sent: 0,
            };
        }

        if window.sent >= limit {
            return Err(window.started + WINDOW);
        }

        window.sent += 1;
        Ok(())
    }

    /// When the pair's current window is already full, when it ends.
    /// Counts nothing.
    #[must_use]
    pub fn exhausted_until(&self, ip: IpAddr, host: &str, limit: u64, now: Instant) -> Option<Instant> {
        let window = *self
            .windows
            .get(&(ip.to_canonical(), host.to_ascii_lowercase()))?;

        (now.saturating_duration_since(window.started) < WINDOW && window.sent >= limit)
            .then_some(window.started + WINDOW)
    }

    /// Hand back a message taken by [`HourlyCounter::try_take`] that never
    /// reached the wire.
    pub fn give_back(&self, ip: IpAddr, host: &str) {
        if let Some(mut window) = self
            .windows
            .get_mut(&(ip.to_canonical(), host.to_ascii_lowercase()))
        {
            window.sent = window.sent.saturating_sub(1);
        }
    }

    #[must_use]
    pub fn sent(&self, ip: IpAddr, host: &str) -> u64 {
        self.windows
            .get(&(ip.to_canonical(), host.to_ascii_lowercase()))
            .map_or(0, |window| window.sent)
    }
}
