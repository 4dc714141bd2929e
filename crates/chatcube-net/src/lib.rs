//! Network transport core for the ChatCube chat client.
//!
//! This crate moves every byte between the client and the ChatCube backend:
//!
//! - **Requests**: one-shot HTTP exchanges with success/fail/finally callbacks
//! - **Event stream**: a long-lived Server-Sent Events subscription that
//!   resumes from the last seen message after a reconnect
//! - **Online gate**: nothing is sent until the backend host resolves
//!
//! Everything is driven by [`HttpService::process`], called periodically from
//! the host's main loop. The transfers themselves run on a small private tokio
//! runtime, but their results are only observed, and callbacks only fire,
//! inside `process` on the caller's thread.
//!
//! # Example
//!
//! ```ignore
//! use chatcube_net::{HttpService, Request, ServiceConfig};
//!
//! let config = ServiceConfig::load("chatcube.toml")?;
//! let mut service = HttpService::new(config)?;
//! service.set_auth_token(Some("t0k3n".into()));
//!
//! service.set_events_handler(|record| {
//!     println!("message {} at {}: {:?}", record.id, record.time, record.text());
//! });
//! service.start_event_stream("42", None);
//!
//! service.submit(
//!     Request::post("/messages")
//!         .field("channel", "42")
//!         .field("text", "hello")
//!         .on_success(|response| println!("sent ({})", response.status())),
//! );
//!
//! loop {
//!     service.process();
//!     std::thread::sleep(std::time::Duration::from_millis(50));
//! }
//! ```
//!
//! # Testing
//!
//! [`HttpService::with_parts`] accepts any [`Multiplexer`](transport::Multiplexer)
//! and a [`HostResolver`](dns::HostResolver) over any lookup function.
//! [`ScriptedMultiplexer`](transport::ScriptedMultiplexer) lets a test decide
//! the outcome of every transfer without touching the network.

pub mod config;
pub mod dns;
mod error;
pub mod http;
pub mod runtime;
pub mod sse;
pub mod thread_check;
pub mod tls;
pub mod transport;

pub use config::{ConfigError, ServiceConfig};
pub use error::{NetworkError, Result, TransportError};

// Re-export commonly used types at the crate root
pub use http::{
    Failure, HttpMethod, HttpService, Request, Response, RetryPolicy, ServiceHandle, UploadFile,
};
pub use sse::StreamRecord;
pub use transport::{CancelFlag, TransferProgress};
