//! Backend hostname resolution.
//!
//! [`HostResolver`] is the gate every request passes: until it has resolved
//! the backend host, the service keeps requests queued and the event stream
//! disarmed. The actual lookup is pluggable through [`HostLookup`];
//! [`DnsResolver`] provides it with hickory-resolver.

mod config;
mod host;
mod resolver;

pub use config::{DnsConfig, IpStrategy};
pub use host::{HostLookup, HostResolver};
pub use resolver::DnsResolver;
