//! The online gate: backend hostname resolution and the address cache.

use std::collections::HashMap;
use std::net::IpAddr;
use std::task::Poll;

use crate::error::{NetworkError, Result};

/// A way to turn a hostname into addresses without blocking the caller.
///
/// [`DnsResolver`](super::DnsResolver) is the production implementation. Any
/// `FnMut(&str) -> Result<Vec<IpAddr>>` closure also qualifies and answers on
/// the first poll, which is how tests script resolution outcomes.
pub trait HostLookup: Send {
    /// Start resolving `host`, or check on a lookup already started for it.
    ///
    /// Must return promptly; `Poll::Pending` means the answer is not in yet
    /// and the caller will ask again on its next tick.
    fn poll_lookup(&mut self, host: &str) -> Poll<Result<Vec<IpAddr>>>;
}

impl<F> HostLookup for F
where
    F: FnMut(&str) -> Result<Vec<IpAddr>> + Send,
{
    fn poll_lookup(&mut self, host: &str) -> Poll<Result<Vec<IpAddr>>> {
        Poll::Ready(self(host))
    }
}

/// Resolves the backend host and decides whether traffic may flow.
///
/// A successful resolution stores the first address in the cache and flips
/// the service online; a failure flips it offline. A lookup still in progress
/// leaves both untouched. There are no internal retries: the service asks
/// again on its next tick.
pub struct HostResolver {
    lookup: Box<dyn HostLookup>,
    cache: HashMap<String, IpAddr>,
    online: bool,
    resolving: Option<String>,
}

impl std::fmt::Debug for HostResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostResolver")
            .field("cache", &self.cache)
            .field("online", &self.online)
            .field("resolving", &self.resolving)
            .finish_non_exhaustive()
    }
}

impl HostResolver {
    /// Create an offline resolver with an empty cache.
    pub fn new(lookup: impl HostLookup + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
            cache: HashMap::new(),
            online: false,
            resolving: None,
        }
    }

    /// Create an offline resolver backed by a closure.
    pub fn from_fn<F>(lookup: F) -> Self
    where
        F: FnMut(&str) -> Result<Vec<IpAddr>> + Send + 'static,
    {
        Self::new(lookup)
    }

    /// Resolve `host`, or check on the lookup started by an earlier call, and
    /// update the online flag once an answer is in.
    ///
    /// IP literals are accepted without a lookup.
    pub fn resolve(&mut self, host: &str) -> Poll<Result<IpAddr>> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            self.resolving = None;
            self.cache.insert(host.to_string(), ip);
            self.online = true;
            return Poll::Ready(Ok(ip));
        }

        let outcome = match self.lookup.poll_lookup(host) {
            Poll::Pending => {
                if self.resolving.as_deref() != Some(host) {
                    tracing::debug!(target: "chatcube_net::dns", host, "resolving hostname");
                    self.resolving = Some(host.to_string());
                }
                return Poll::Pending;
            }
            Poll::Ready(outcome) => outcome,
        };
        self.resolving = None;

        let outcome = outcome.and_then(|addresses| {
            addresses
                .into_iter()
                .next()
                .ok_or_else(|| NetworkError::Resolution {
                    host: host.to_string(),
                    message: "no addresses found".to_string(),
                })
        });

        match outcome {
            Ok(ip) => {
                tracing::debug!(
                    target: "chatcube_net::dns",
                    host,
                    %ip,
                    "hostname resolved"
                );
                self.cache.insert(host.to_string(), ip);
                self.online = true;
                Poll::Ready(Ok(ip))
            }
            Err(err) => {
                tracing::error!(
                    target: "chatcube_net::dns",
                    host,
                    error = %err,
                    "cannot resolve hostname"
                );
                self.cache.remove(host);
                self.online = false;
                Poll::Ready(Err(err))
            }
        }
    }

    /// Whether a lookup has been started and has not answered yet.
    pub fn is_resolving(&self) -> bool {
        self.resolving.is_some()
    }

    /// The cached address for `host`, if resolved and not invalidated.
    pub fn cached(&self, host: &str) -> Option<IpAddr> {
        self.cache.get(host).copied()
    }

    /// Forget the cached address for `host`.
    pub fn invalidate(&mut self, host: &str) {
        self.cache.remove(host);
    }

    /// Declare the link down; the next tick must resolve again before any
    /// traffic is allowed.
    pub fn mark_offline(&mut self, host: &str) {
        if self.online {
            tracing::debug!(target: "chatcube_net::dns", host, "link marked offline");
        }
        self.invalidate(host);
        self.online = false;
    }

    /// Whether the last resolution succeeded.
    pub fn is_online(&self) -> bool {
        self.online
    }
}
