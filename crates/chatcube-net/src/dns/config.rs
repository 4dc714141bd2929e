//! Resolver settings, the `[dns]` table of the service configuration.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the backend hostname is looked up.
///
/// ```toml
/// [dns]
/// nameservers = ["9.9.9.9:53", "149.112.112.112:53"]
/// ip_strategy = "ipv6_then_ipv4"
/// timeout_ms = 1500
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Servers to query over UDP and TCP. Empty means the platform's own
    /// configuration.
    pub nameservers: Vec<SocketAddr>,
    /// Address families to ask for.
    pub ip_strategy: IpStrategy,
    /// Answer from the hosts file before asking any server.
    pub use_hosts_file: bool,
    /// Queries per lookup.
    pub attempts: usize,
    /// Time allowed for each query.
    #[serde(rename = "timeout_ms", with = "crate::config::millis")]
    pub timeout: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            nameservers: Vec::new(),
            ip_strategy: IpStrategy::default(),
            use_hosts_file: true,
            attempts: 2,
            timeout: Duration::from_secs(3),
        }
    }
}

impl DnsConfig {
    /// Whether lookups follow the platform configuration.
    pub fn uses_system_config(&self) -> bool {
        self.nameservers.is_empty()
    }

    /// Query `addr` in addition to any nameserver already set.
    pub fn nameserver(mut self, addr: SocketAddr) -> Self {
        self.nameservers.push(addr);
        self
    }

    /// Set the address families to ask for.
    pub fn ip_strategy(mut self, strategy: IpStrategy) -> Self {
        self.ip_strategy = strategy;
        self
    }

    /// Set whether the hosts file is consulted.
    pub fn use_hosts_file(mut self, use_hosts: bool) -> Self {
        self.use_hosts_file = use_hosts;
        self
    }

    /// Set the number of queries per lookup.
    pub fn attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts;
        self
    }

    /// Set the per-query timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Address families requested from the resolver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpStrategy {
    /// A records only.
    Ipv4Only,
    /// AAAA records only.
    Ipv6Only,
    /// Both, IPv4 first.
    #[default]
    Ipv4ThenIpv6,
    /// Both, IPv6 first.
    Ipv6ThenIpv4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_table() {
        let config: DnsConfig = toml::from_str(
            r#"
            nameservers = ["9.9.9.9:53"]
            ip_strategy = "ipv6_only"
            timeout_ms = 1500
            "#,
        )
        .unwrap();

        assert!(!config.uses_system_config());
        assert_eq!(config.ip_strategy, IpStrategy::Ipv6Only);
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.attempts, 2);
    }
}
