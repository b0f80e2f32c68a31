/*
 * Copyright 2025 Aegis Safety Contributors
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Shared vocabulary of the aegis signaling protocol: stream/room
//! identifiers, the session descriptor published to the fallback store,
//! and the wire message union exchanged between streamer and viewer.
//!
//! This crate is deliberately I/O free so that the server and both client
//! roles agree on one source of truth for the protocol.

pub mod signal;

pub use signal::{IceCandidate, SignalMessage};

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Prefix shared by every emergency stream id. An emergency stream id is
/// `emergency_<alert_id>` so the originating alert can be recovered from
/// the id alone.
pub const EMERGENCY_STREAM_PREFIX: &str = "emergency_";

/// Prefix of every emergency room key, applied on top of the stream id,
/// so alert `42` lands in room `emergency_room_emergency_42`.
pub const EMERGENCY_ROOM_PREFIX: &str = "emergency_room_";

/// Opaque per-session identifier. Generated ids are time-ordered
/// (millisecond timestamp first) with a random suffix; collisions are a
/// correctness bug, not merely unlikely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Generate a fresh ad hoc stream id: `<unix_millis>-<48-bit hex>`.
    pub fn generate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let suffix: u64 = rand::thread_rng().gen_range(0..(1u64 << 48));
        StreamId(format!("{millis}-{suffix:012x}"))
    }

    /// The stream id of the emergency session correlated to `alert_id`.
    pub fn for_alert(alert_id: &str) -> Self {
        StreamId(format!("{EMERGENCY_STREAM_PREFIX}{alert_id}"))
    }

    pub fn from_string(raw: impl Into<String>) -> Self {
        StreamId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id names an emergency session.
    pub fn is_emergency(&self) -> bool {
        self.0.starts_with(EMERGENCY_STREAM_PREFIX)
    }

    /// The alert id encoded in an emergency stream id, if any.
    pub fn alert_id(&self) -> Option<&str> {
        self.0.strip_prefix(EMERGENCY_STREAM_PREFIX)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical namespace scoping which signaling messages belong to which
/// stream session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Derive the room key for a stream. Emergency streams get the
    /// `emergency_room_` prefix; ad hoc streams use the stream id itself.
    pub fn for_stream(stream_id: &StreamId) -> Self {
        if stream_id.is_emergency() {
            RoomId(format!("{EMERGENCY_ROOM_PREFIX}{stream_id}"))
        } else {
            RoomId(stream_id.as_str().to_owned())
        }
    }

    pub fn from_string(raw: impl Into<String>) -> Self {
        RoomId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of the offer/answer exchange a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Streamer,
    Viewer,
}

/// Session descriptor published by the streamer under
/// [`stream_key`] so viewers can discover the stream even when the
/// realtime channel is down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub stream_id: StreamId,
    pub active: bool,
    pub emergency: bool,
    pub started_at_ms: u64,
    #[serde(default)]
    pub viewer_count: u32,
}

impl StreamDescriptor {
    pub fn new(stream_id: StreamId, emergency: bool) -> Self {
        let started_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        StreamDescriptor {
            stream_id,
            active: true,
            emergency,
            started_at_ms,
            viewer_count: 0,
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("descriptors always serialize")
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Fallback store key holding the [`StreamDescriptor`].
pub fn stream_key(id: &StreamId) -> String {
    format!("webrtc_stream_{id}")
}

/// Fallback store key holding the streamer's full (non-trickle) SDP offer.
pub fn offer_key(id: &StreamId) -> String {
    format!("webrtc_offer_{id}")
}

/// Fallback store key holding the viewer's full SDP answer.
pub fn answer_key(id: &StreamId) -> String {
    format!("webrtc_answer_{id}")
}

/// Viewer-facing path for a stream: `/emergency-watch/<id>` when the id
/// encodes an alert, `/watch/<id>` otherwise.
pub fn watch_path(id: &StreamId) -> String {
    if id.is_emergency() {
        format!("/emergency-watch/{id}")
    } else {
        format!("/watch/{id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn generated_ids_are_distinct_under_concurrency() {
        let handles: Vec<_> = (0..8)
            .map(|_| thread::spawn(|| (0..256).map(|_| StreamId::generate()).collect::<Vec<_>>()))
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id.as_str().to_owned()), "stream id collision");
            }
        }
    }

    #[test]
    fn emergency_room_derivation_matches_alert_id() {
        let id = StreamId::for_alert("42");
        assert_eq!(id.as_str(), "emergency_42");
        assert_eq!(
            RoomId::for_stream(&id).as_str(),
            "emergency_room_emergency_42"
        );
        assert_eq!(id.alert_id(), Some("42"));
    }

    #[test]
    fn ad_hoc_room_is_the_stream_id() {
        let id = StreamId::from_string("1700000000000-00deadbeef00");
        assert!(!id.is_emergency());
        assert_eq!(RoomId::for_stream(&id).as_str(), id.as_str());
    }

    #[test]
    fn fallback_keys_and_links() {
        let id = StreamId::for_alert("7");
        assert_eq!(stream_key(&id), "webrtc_stream_emergency_7");
        assert_eq!(offer_key(&id), "webrtc_offer_emergency_7");
        assert_eq!(answer_key(&id), "webrtc_answer_emergency_7");
        assert_eq!(watch_path(&id), "/emergency-watch/emergency_7");

        let plain = StreamId::from_string("abc");
        assert_eq!(watch_path(&plain), "/watch/abc");
    }

    #[test]
    fn descriptor_round_trips_as_json() {
        let desc = StreamDescriptor::new(StreamId::for_alert("9"), true);
        let json = serde_json::to_string(&desc).unwrap();
        let back: StreamDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(desc, back);
        assert!(back.active);
        assert!(back.emergency);
    }
}
