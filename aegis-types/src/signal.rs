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

//! Signaling wire messages.
//!
//! Every control message travelling over the realtime channel is one of
//! these variants, JSON-encoded with a `type` tag. Decoding happens at the
//! transport boundary so malformed frames are rejected at the edge instead
//! of surfacing as missing-field errors deeper in a session.

use crate::{RoomId, StreamId};
use serde::{Deserialize, Serialize};

/// An ICE candidate as exchanged on the wire, mirroring the fields of
/// `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// The tagged union of every signaling message.
///
/// Each variant carries its correlation key (`stream_id` or `room_id`);
/// consumers must ignore messages whose key does not match an active
/// local session. The streamer creates the offer for both emergency and
/// ad hoc rooms; the viewer always answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Announce membership in a room. Sent by both roles right after the
    /// socket opens.
    JoinRoom { room_id: RoomId, emergency: bool },
    /// Streamer's SDP offer.
    Offer { stream_id: StreamId, sdp: String },
    /// Viewer's SDP answer.
    Answer { stream_id: StreamId, sdp: String },
    /// Trickled ICE candidate, either direction. One message per
    /// candidate, never batched.
    IceCandidate {
        stream_id: StreamId,
        candidate: IceCandidate,
    },
    /// A viewer completed negotiation with the streamer.
    ViewerConnected { stream_id: StreamId },
    /// A previously connected viewer went away.
    ViewerDisconnected { stream_id: StreamId },
    /// Best-effort end-of-stream broadcast from the streamer.
    StreamEnded { stream_id: StreamId },
}

impl SignalMessage {
    /// The stream this message correlates to, when it carries one.
    pub fn stream_id(&self) -> Option<&StreamId> {
        match self {
            SignalMessage::JoinRoom { .. } => None,
            SignalMessage::Offer { stream_id, .. }
            | SignalMessage::Answer { stream_id, .. }
            | SignalMessage::IceCandidate { stream_id, .. }
            | SignalMessage::ViewerConnected { stream_id }
            | SignalMessage::ViewerDisconnected { stream_id }
            | SignalMessage::StreamEnded { stream_id } => Some(stream_id),
        }
    }

    /// Decode a frame received at the transport boundary.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("signal messages always serialize")
    }
}
