// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Address resolution and candidate selection.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use rand::Rng;

/// Resolves a host and port to candidate addresses. Runs synchronously on
/// the scheduler thread.
pub trait Resolve {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// The OS resolver (`getaddrinfo` through `ToSocketAddrs`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok((host, port).to_socket_addrs()?.collect())
    }
}

/// Fixed host table. Unknown hosts resolve to no addresses.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<SocketAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `host` to `addrs`. The port of each address is replaced by the
    /// port passed to `resolve`.
    pub fn with_host(mut self, host: impl Into<String>, addrs: Vec<SocketAddr>) -> Self {
        self.hosts.insert(host.into(), addrs);
        self
    }
}

impl Resolve for StaticResolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok(self
            .hosts
            .get(host)
            .map(|addrs| {
                addrs
                    .iter()
                    .map(|addr| SocketAddr::new(addr.ip(), port))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Pick one candidate uniformly at random. `None` if there are none.
pub fn choose_address<R: Rng + ?Sized>(candidates: &[SocketAddr], rng: &mut R) -> Option<SocketAddr> {
    if candidates.is_empty() {
        return None;
    }
    Some(candidates[rng.gen_range(0..candidates.len())])
}
