//! Shared types for the qnet pipeline.
//!
//! Identifiers, request kinds, and the request/response payloads exchanged
//! between clients, queues, and processors. The serde-backed wire contract
//! lives in [`message`].

mod message;

pub use message::Message;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Request kinds, totally ordered by priority: `Z1 < Z2 < Z3`
/// (Z3 is served first).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Z1,
    Z2,
    Z3,
}

impl RequestKind {
    /// All kinds in ascending priority order.
    pub const ALL: [RequestKind; 3] = [RequestKind::Z1, RequestKind::Z2, RequestKind::Z3];

    /// Kinds in dispatch order (highest priority first).
    pub const PRIORITY_ORDER: [RequestKind; 3] =
        [RequestKind::Z3, RequestKind::Z2, RequestKind::Z1];

    /// Stable index into per-kind arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Numeric priority; larger means more urgent.
    pub fn priority(self) -> u8 {
        self as u8 + 1
    }

    pub fn label(self) -> &'static str {
        match self {
            RequestKind::Z1 => "z1",
            RequestKind::Z2 => "z2",
            RequestKind::Z3 => "z3",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Globally unique, monotonically assigned request identifier.
///
/// Ids are handed out from a single shared counter so that every attempt of
/// every client gets a fresh id, and retries are distinguishable from their
/// originals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a simulation node (K1, Q1, P11, P21, D, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        NodeId(id.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        NodeId(id)
    }
}

/// A request travelling through the pipeline. Immutable after creation;
/// a retry is a fresh `Request` with a new id and a bumped `attempt`.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub kind: RequestKind,
    /// Client that originated the request; stage-2 responses are addressed
    /// back to this node.
    pub origin: NodeId,
    /// Monotonic creation timestamp of this attempt.
    pub created_at: Instant,
    /// Retry counter, 0 for the first attempt.
    pub attempt: u32,
}

impl Request {
    /// The stage-2 responses a client must collect for this request to
    /// succeed. Always all three kinds, regardless of the request's own kind.
    pub fn legs_required(&self) -> [RequestKind; 3] {
        RequestKind::ALL
    }
}

/// A stage-2 processor's reply for one leg of a request.
#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: RequestId,
    /// Which stage-2 processor produced this leg.
    pub producer_kind: RequestKind,
    pub ok: bool,
    pub completed_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_order_by_priority() {
        assert!(RequestKind::Z1 < RequestKind::Z2);
        assert!(RequestKind::Z2 < RequestKind::Z3);
        assert_eq!(RequestKind::PRIORITY_ORDER[0], RequestKind::Z3);
        assert_eq!(RequestKind::Z3.priority(), 3);
    }

    #[test]
    fn kind_indices_are_stable() {
        for (i, kind) in RequestKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn every_request_needs_all_three_legs() {
        let request = Request {
            id: RequestId(7),
            kind: RequestKind::Z2,
            origin: NodeId::from("K1"),
            created_at: Instant::now(),
            attempt: 0,
        };
        assert_eq!(request.legs_required(), RequestKind::ALL);
    }
}
