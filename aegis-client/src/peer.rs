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

//! Lifecycle of one negotiated media connection.
//!
//! One manager per stream session, wrapping a single webrtc-rs peer
//! connection. The state machine is strictly forward:
//! `new → connecting → connected → disconnected/failed → closed`. There
//! is no re-entry into `connecting`; a lost connection requires a fresh
//! manager bound to a fresh stream id.
//!
//! Remote ICE candidates arriving before the remote description are
//! queued and drained afterwards, so delivery order never matters.
//! Candidates arriving after establishment are a no-op, not an error.

use crate::error::{negotiation, SessionError};
use crate::media::MediaSink;

use aegis_types::IceCandidate;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Public STUN servers used for address discovery. No TURN: NAT
/// traversal beyond STUN is out of scope.
pub const DEFAULT_STUN_SERVERS: &[&str] = &["stun:stun.l.google.com:19302"];

/// Negotiation states surfaced to the owning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// `disconnected` and `failed` are terminal for the session: the
    /// owning side surfaces "connection lost" and waits for the user.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Disconnected | PeerState::Failed | PeerState::Closed)
    }
}

impl From<RTCPeerConnectionState> for PeerState {
    fn from(s: RTCPeerConnectionState) -> Self {
        match s {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => PeerState::New,
            RTCPeerConnectionState::Connecting => PeerState::Connecting,
            RTCPeerConnectionState::Connected => PeerState::Connected,
            RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
            RTCPeerConnectionState::Failed => PeerState::Failed,
            RTCPeerConnectionState::Closed => PeerState::Closed,
        }
    }
}

/// Owns one peer connection. Clones share the connection, so sessions
/// can hand a handle to their relay task.
#[derive(Clone)]
pub struct PeerConnectionManager {
    pc: Arc<RTCPeerConnection>,
    pending: Arc<Mutex<Vec<IceCandidate>>>,
    answered: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    states: watch::Receiver<PeerState>,
}

impl PeerConnectionManager {
    /// Build a connection with default codecs and interceptors. Pass an
    /// empty list for loopback-only operation (tests).
    pub async fn new(stun_servers: Vec<String>) -> Result<Self, SessionError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(negotiation)?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media).map_err(negotiation)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if stun_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: stun_servers,
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(negotiation)?);

        let (state_tx, states) = watch::channel(PeerState::New);
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let _ = state_tx.send(s.into());
            Box::pin(async {})
        }));

        Ok(PeerConnectionManager {
            pc,
            pending: Arc::new(Mutex::new(Vec::new())),
            answered: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            states,
        })
    }

    /// A VP8 sample track for the streamer's outgoing video.
    pub fn new_video_track(stream_id: &str) -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: webrtc::api::media_engine::MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            stream_id.to_owned(),
        ))
    }

    /// Attach a local track. Must happen before [`create_offer`].
    ///
    /// [`create_offer`]: Self::create_offer
    pub async fn attach_track(
        &self,
        track: Arc<TrackLocalStaticSample>,
    ) -> Result<(), SessionError> {
        let sender = self
            .pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(negotiation)?;
        // Drain RTCP so the interceptor chain keeps flowing.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    /// Streamer side: produce the SDP offer and set it locally.
    /// Precondition: local media is already attached.
    pub async fn create_offer(&self) -> Result<String, SessionError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation)?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await.map_err(negotiation)?;
        Ok(sdp)
    }

    /// Viewer side: apply the remote offer, produce and set the answer.
    pub async fn accept_offer(&self, offer_sdp: String) -> Result<String, SessionError> {
        let offer = RTCSessionDescription::offer(offer_sdp).map_err(negotiation)?;
        self.pc.set_remote_description(offer).await.map_err(negotiation)?;
        self.drain_pending().await;
        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await.map_err(negotiation)?;
        Ok(sdp)
    }

    /// Streamer side: apply the viewer's answer. A second answer for the
    /// same session is ignored.
    pub async fn apply_answer(&self, answer_sdp: String) -> Result<(), SessionError> {
        if self.answered.load(Ordering::SeqCst) {
            debug!("duplicate answer ignored");
            return Ok(());
        }
        let answer = RTCSessionDescription::answer(answer_sdp).map_err(negotiation)?;
        self.pc.set_remote_description(answer).await.map_err(negotiation)?;
        self.answered.store(true, Ordering::SeqCst);
        self.drain_pending().await;
        Ok(())
    }

    /// Add a remote candidate, queueing it while the remote description
    /// is not yet set. Late or unusable candidates are logged and
    /// swallowed: by the time they arrive the connection either exists
    /// or a terminal state was already surfaced.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) {
        if self.pc.remote_description().await.is_none() {
            self.pending.lock().await.push(candidate);
            return;
        }
        Self::add_now(&self.pc, candidate).await;
    }

    /// Whether a remote description has been applied yet. The viewer
    /// uses this to drop re-published offers after it already answered.
    pub async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_now(pc: &RTCPeerConnection, candidate: IceCandidate) {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        if let Err(e) = pc.add_ice_candidate(init).await {
            warn!("ignoring unusable remote candidate: {e}");
        }
    }

    async fn drain_pending(&self) {
        let queued: Vec<IceCandidate> = self.pending.lock().await.drain(..).collect();
        if !queued.is_empty() {
            debug!("applying {} queued remote candidate(s)", queued.len());
        }
        for candidate in queued {
            Self::add_now(&self.pc, candidate).await;
        }
    }

    /// Register a callback for locally gathered candidates. Each
    /// candidate is delivered individually, never batched.
    pub fn on_local_candidate(&self, handler: impl Fn(IceCandidate) + Send + Sync + 'static) {
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => handler(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }),
                    Err(e) => warn!("local candidate not serializable: {e}"),
                }
            }
            Box::pin(async {})
        }));
    }

    /// Viewer side: route inbound media into the sink. One reader task
    /// per remote track.
    pub fn on_track(&self, sink: Arc<dyn MediaSink>) {
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let sink = sink.clone();
            Box::pin(async move {
                let kind = track.kind().to_string();
                debug!("inbound {kind} track {}", track.id());
                while let Ok((packet, _)) = track.read_rtp().await {
                    sink.on_sample(&kind, &packet.payload);
                }
                debug!("inbound {kind} track ended");
            })
        }));
    }

    /// Wait until ICE gathering completes, so the local description
    /// carries every candidate (the non-trickle fallback path).
    pub async fn wait_ice_complete(&self, timeout: Duration) -> Result<(), SessionError> {
        let mut done = self.pc.gathering_complete_promise().await;
        tokio::time::timeout(timeout, done.recv())
            .await
            .map_err(|_| SessionError::Negotiation("ICE gathering timed out".into()))?;
        Ok(())
    }

    /// The current full local description, if one has been set.
    pub async fn local_description(&self) -> Option<String> {
        self.pc.local_description().await.map(|d| d.sdp)
    }

    pub fn state(&self) -> PeerState {
        self.pc.connection_state().into()
    }

    /// Stream of state transitions, for the owning session to observe
    /// `connected` and the terminal `disconnected`/`failed` states.
    pub fn states(&self) -> watch::Receiver<PeerState> {
        self.states.clone()
    }

    /// Close the connection. Idempotent; further calls are no-ops.
    pub async fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            if let Err(e) = self.pc.close().await {
                debug!("peer connection close: {e}");
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn pending_candidates(&self) -> usize {
        self.pending.lock().await.len()
    }
}
