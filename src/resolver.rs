// src/resolver.rs
//! Local relay host resolution

use std::net::IpAddr;
use std::sync::Arc;

use tracing::debug;

use crate::config::BindingConfig;
use crate::error::{BindingError, BindingResult};

/// Resolves the local address relay endpoints are bound to
pub trait HostResolver: Send + Sync {
    /// Address of the local relay host
    fn resolve_local_host(&self) -> BindingResult<IpAddr>;
}

/// Always resolves to a configured address
#[derive(Debug, Clone, Copy)]
pub struct StaticResolver {
    host: IpAddr,
}

impl StaticResolver {
    /// Resolve to `host`
    pub fn new(host: IpAddr) -> Self {
        Self { host }
    }
}

impl HostResolver for StaticResolver {
    fn resolve_local_host(&self) -> BindingResult<IpAddr> {
        Ok(self.host)
    }
}

/// Picks the first usable address of the host's network interfaces.
///
/// IPv4 addresses are preferred over IPv6. Loopback addresses are only used
/// when `allow_loopback` is set.
#[cfg(feature = "interface-resolver")]
#[derive(Debug, Clone, Copy, Default)]
pub struct InterfaceResolver {
    allow_loopback: bool,
}

#[cfg(feature = "interface-resolver")]
impl InterfaceResolver {
    /// Resolver that skips loopback interfaces
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a loopback address when no other interface is up
    pub fn allow_loopback(mut self, allow: bool) -> Self {
        self.allow_loopback = allow;
        self
    }

    fn pick(&self, candidates: &[(IpAddr, bool)]) -> Option<IpAddr> {
        let rank = |&(ip, loopback): &(IpAddr, bool)| match (loopback, ip.is_ipv4()) {
            (false, true) => 0,
            (false, false) => 1,
            (true, true) => 2,
            (true, false) => 3,
        };

        candidates
            .iter()
            .filter(|(_, loopback)| self.allow_loopback || !loopback)
            .min_by_key(|candidate| rank(*candidate))
            .map(|(ip, _)| *ip)
    }
}

#[cfg(feature = "interface-resolver")]
impl HostResolver for InterfaceResolver {
    fn resolve_local_host(&self) -> BindingResult<IpAddr> {
        let interfaces = if_addrs::get_if_addrs().map_err(|e| {
            BindingError::HostResolutionFailed(format!("failed to enumerate interfaces: {}", e))
        })?;

        let candidates: Vec<(IpAddr, bool)> = interfaces
            .iter()
            .map(|iface| (iface.ip(), iface.is_loopback()))
            .collect();

        let host = self.pick(&candidates).ok_or_else(|| {
            BindingError::HostResolutionFailed("no usable network interface".to_string())
        })?;

        debug!("Resolved local relay host to {}", host);
        Ok(host)
    }
}

/// Build the resolver described by `config`
pub fn resolver_from_config(config: &BindingConfig) -> Arc<dyn HostResolver> {
    match config.relay_host {
        Some(host) => Arc::new(StaticResolver::new(host)),
        #[cfg(feature = "interface-resolver")]
        None => Arc::new(InterfaceResolver::new()),
        #[cfg(not(feature = "interface-resolver"))]
        None => Arc::new(StaticResolver::new(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))),
    }
}
