//! The private async runtime transfers and DNS lookups run on.
//!
//! The service itself is synchronous and poll-driven; the runtime only hosts
//! socket I/O. Two worker threads are plenty for a chat client's handful of
//! concurrent transfers.

use tokio::runtime::{Builder, Runtime};

/// Build the transport runtime.
pub fn build() -> std::io::Result<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("chatcube-net")
        .enable_all()
        .build()
}
