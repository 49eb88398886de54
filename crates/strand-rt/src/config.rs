// SPDX-License-Identifier: (MIT OR Apache-2.0)

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Readiness events fetched per reactor poll.
    pub max_events: usize,
    /// Task polls between non-blocking reactor checks while tasks are runnable.
    pub event_interval: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_events: 64,
            event_interval: 61,
        }
    }
}

/// The single address family a connector resolves and connects with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddressFamily {
    #[default]
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::Ipv4 => addr.is_ipv4(),
            AddressFamily::Ipv6 => addr.is_ipv6(),
        }
    }

    /// Wildcard address with port 0, for an OS-chosen source port.
    pub fn wildcard(self) -> SocketAddr {
        match self {
            AddressFamily::Ipv4 => (Ipv4Addr::UNSPECIFIED, 0).into(),
            AddressFamily::Ipv6 => (Ipv6Addr::UNSPECIFIED, 0).into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectorConfig {
    pub family: AddressFamily,
    /// Seed for candidate selection. `None` seeds from OS entropy.
    pub rng_seed: Option<u64>,
}
