//! Validated event-stream records.

use std::fmt;

use serde_json::Value;

/// One message delivered over the event stream.
///
/// A payload only becomes a record when it is a JSON object with an integer
/// `id` and a string `time`; the `time` is what the stream resumes from after
/// a reconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    /// Server-assigned identifier.
    pub id: i64,
    /// Server timestamp, used as the resume cursor.
    pub time: String,
    /// The whole document.
    pub document: Value,
}

impl StreamRecord {
    /// Validate a raw payload.
    pub fn parse(raw: &str) -> Result<Self, MalformedRecord> {
        let document: Value =
            serde_json::from_str(raw).map_err(|e| MalformedRecord::Json(e.to_string()))?;

        let id = document
            .get("id")
            .and_then(Value::as_i64)
            .ok_or(MalformedRecord::MissingId)?;
        let time = document
            .get("time")
            .and_then(Value::as_str)
            .ok_or(MalformedRecord::MissingTime)?
            .to_string();

        Ok(Self { id, time, document })
    }

    /// The message body, if the record carries one.
    pub fn text(&self) -> Option<&Value> {
        self.document.get("text")
    }

    /// The message body as a string, if it is one.
    pub fn text_str(&self) -> Option<&str> {
        self.text().and_then(Value::as_str)
    }
}

/// Why a payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedRecord {
    /// The payload is not JSON.
    Json(String),
    /// No integer `id`.
    MissingId,
    /// No string `time`.
    MissingTime,
}

impl fmt::Display for MalformedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(msg) => write!(f, "not JSON: {msg}"),
            Self::MissingId => write!(f, "missing integer 'id'"),
            Self::MissingTime => write!(f, "missing string 'time'"),
        }
    }
}

impl std::error::Error for MalformedRecord {}
