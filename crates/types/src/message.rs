//! Wire message contract.
//!
//! The core runs over in-process channels, but the externally visible
//! message shape is fixed here so a socket-backed transport (length-prefixed
//! JSON over TCP) can be layered on without touching the pipeline.

use crate::{Request, RequestKind, Response};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A message as it would appear on the wire.
///
/// `ts` is seconds since the Unix epoch; the in-process pipeline keeps
/// monotonic [`std::time::Instant`]s instead and only stamps wall-clock
/// time at the serialization boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Request {
        id: u64,
        kind: RequestKind,
        origin: String,
        attempt: u32,
        ts: f64,
    },
    Response {
        id: u64,
        producer_kind: RequestKind,
        ok: bool,
        ts: f64,
    },
}

impl Message {
    pub fn request(request: &Request) -> Self {
        Message::Request {
            id: request.id.0,
            kind: request.kind,
            origin: request.origin.to_string(),
            attempt: request.attempt,
            ts: epoch_seconds(),
        }
    }

    pub fn response(response: &Response) -> Self {
        Message::Response {
            id: response.request_id.0,
            producer_kind: response.producer_kind,
            ok: response.ok,
            ts: epoch_seconds(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Request { .. } => "request",
            Message::Response { .. } => "response",
        }
    }
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
