//! Production hostname lookup backed by hickory-resolver.

use std::net::IpAddr;
use std::task::Poll;

use hickory_resolver::config::{
    LookupIpStrategy, NameServerConfig, ResolveHosts, ResolverConfig, ResolverOpts,
};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::system_conf::read_system_conf;
use hickory_resolver::{Resolver, TokioResolver};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::dns::HostLookup;
use crate::dns::config::{DnsConfig, IpStrategy};
use crate::error::{NetworkError, Result};

/// A lookup running on the service runtime.
struct InProgress {
    host: String,
    answer: oneshot::Receiver<Result<Vec<IpAddr>>>,
}

/// DNS lookup on top of the service runtime.
///
/// Each lookup runs as a task; [`poll_lookup`](HostLookup::poll_lookup) only
/// checks whether its answer has arrived. hickory keeps its own record cache,
/// so repeated lookups of the backend host after an outage are cheap.
pub struct DnsResolver {
    resolver: TokioResolver,
    runtime: Handle,
    in_progress: Option<InProgress>,
}

impl std::fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsResolver")
            .field("resolving", &self.in_progress.as_ref().map(|lookup| &lookup.host))
            .finish_non_exhaustive()
    }
}

impl DnsResolver {
    /// Create a resolver whose lookups run on `runtime`.
    pub fn new(config: &DnsConfig, runtime: Handle) -> Result<Self> {
        let (resolver_config, resolver_opts) = build_resolver_config(config)?;

        let resolver = {
            let _guard = runtime.enter();
            Resolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
                .with_options(resolver_opts)
                .build()
        };

        Ok(Self {
            resolver,
            runtime,
            in_progress: None,
        })
    }

    fn spawn(&self, host: &str) -> InProgress {
        let (tx, answer) = oneshot::channel();
        let resolver = self.resolver.clone();
        let hostname = host.to_string();
        self.runtime.spawn(async move {
            let _ = tx.send(resolve_hostname(&resolver, &hostname).await);
        });
        InProgress {
            host: host.to_string(),
            answer,
        }
    }
}

impl HostLookup for DnsResolver {
    fn poll_lookup(&mut self, host: &str) -> Poll<Result<Vec<IpAddr>>> {
        let mut lookup = match self.in_progress.take() {
            Some(lookup) if lookup.host == host => lookup,
            // A lookup for a previous backend is abandoned.
            _ => self.spawn(host),
        };

        match lookup.answer.try_recv() {
            Ok(outcome) => Poll::Ready(outcome),
            Err(TryRecvError::Empty) => {
                self.in_progress = Some(lookup);
                Poll::Pending
            }
            Err(TryRecvError::Closed) => Poll::Ready(Err(NetworkError::Resolution {
                host: host.to_string(),
                message: "lookup task ended without an answer".to_string(),
            })),
        }
    }
}

fn build_resolver_config(config: &DnsConfig) -> Result<(ResolverConfig, ResolverOpts)> {
    let (resolver_config, mut opts) = if config.uses_system_config() {
        read_system_conf().map_err(|e| {
            NetworkError::Setup(format!("cannot read system DNS configuration: {e}"))
        })?
    } else {
        let mut resolver_config = ResolverConfig::new();
        for addr in &config.nameservers {
            resolver_config.add_name_server(NameServerConfig::new(*addr, Protocol::Udp));
            resolver_config.add_name_server(NameServerConfig::new(*addr, Protocol::Tcp));
        }
        (resolver_config, ResolverOpts::default())
    };

    // Only the backend host is ever looked up.
    opts.cache_size = 8;
    opts.use_hosts_file = if config.use_hosts_file {
        ResolveHosts::Auto
    } else {
        ResolveHosts::Never
    };
    opts.attempts = config.attempts.max(1);
    opts.timeout = config.timeout;
    opts.ip_strategy = match config.ip_strategy {
        IpStrategy::Ipv4Only => LookupIpStrategy::Ipv4Only,
        IpStrategy::Ipv6Only => LookupIpStrategy::Ipv6Only,
        IpStrategy::Ipv4ThenIpv6 => LookupIpStrategy::Ipv4thenIpv6,
        IpStrategy::Ipv6ThenIpv4 => LookupIpStrategy::Ipv6thenIpv4,
    };

    Ok((resolver_config, opts))
}

async fn resolve_hostname(resolver: &TokioResolver, hostname: &str) -> Result<Vec<IpAddr>> {
    let response = resolver
        .lookup_ip(hostname)
        .await
        .map_err(|e| NetworkError::Resolution {
            host: hostname.to_string(),
            message: e.to_string(),
        })?;

    let addresses: Vec<IpAddr> = response.iter().collect();
    if addresses.is_empty() {
        return Err(NetworkError::Resolution {
            host: hostname.to_string(),
            message: "no addresses found".to_string(),
        });
    }
    Ok(addresses)
}
