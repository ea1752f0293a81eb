//! Stream channel naming and heartbeat payloads shared by both peers.
//!
//! A subscription served over a broker uses two subjects:
//! - `{id}-stream`: results, published by the server
//! - `{id}-stream-heartbeat`: liveness probes in both directions

use bytes::Bytes;

/// Probe payload.
pub const PING: &[u8] = b"ping";

/// Probe reply.
pub const PONG: &[u8] = b"pong";

/// Published by either side when it tears the stream down.
pub const CLOSE: &[u8] = b"close";

/// Result extension carrying the delivery subject in a subscribe reply.
pub const STREAM_EXTENSION: &str = "stream";

/// Delivery subject for a stream id.
pub fn stream_subject(id: &str) -> String {
    format!("{id}-stream")
}

/// Heartbeat subject paired with a delivery subject.
pub fn heartbeat_subject(stream: &str) -> String {
    format!("{stream}-heartbeat")
}

/// Subject on which subscriptions to `subject` are requested.
pub fn subscribe_subject(subject: &str) -> String {
    format!("{subject}.subscribe")
}

pub fn ping() -> Bytes {
    Bytes::from_static(PING)
}

pub fn pong() -> Bytes {
    Bytes::from_static(PONG)
}

pub fn close() -> Bytes {
    Bytes::from_static(CLOSE)
}
