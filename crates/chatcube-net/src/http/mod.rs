//! Requests, responses, and the service that runs them.
//!
//! # Example
//!
//! ```ignore
//! use chatcube_net::http::{HttpService, Request};
//! use chatcube_net::ServiceConfig;
//!
//! let mut service = HttpService::new(ServiceConfig::new().with_auth_token("t0k3n"))?;
//!
//! service.submit(
//!     Request::post("/ping")
//!         .on_success(|response| println!("pong: {:?}", response.json()))
//!         .on_fail(|failure| eprintln!("ping failed: {failure}"))
//!         .on_finally(|| println!("done")),
//! );
//!
//! // Callbacks run from inside process(), on this thread.
//! loop {
//!     service.process();
//!     std::thread::sleep(std::time::Duration::from_millis(50));
//! }
//! ```

mod request;
mod response;
mod retry;
mod service;

pub use request::{HttpMethod, Request, UploadFile, append_extension, expand_url};
pub use response::{Failure, Response};
pub use retry::RetryPolicy;
pub use service::{HttpService, ServiceHandle};
