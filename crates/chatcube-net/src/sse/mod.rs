//! Server-Sent Events: framing, record validation, and subscription state.
//!
//! The wire format is the usual `data: <json>` lines terminated by a blank
//! line. Each JSON document must carry an integer `id` and a string `time`;
//! the latest `time` is sent back as `?time=` when reconnecting so that no
//! message is lost across a dropped connection.

mod parser;
mod record;
mod stream;

pub use parser::SseParser;
pub use record::{MalformedRecord, StreamRecord};
pub use stream::EventStream;
