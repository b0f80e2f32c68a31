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

//! Incoming stream session (the watch side).
//!
//! Discovery reads the descriptor under `webrtc_stream_<id>`; a missing
//! or inactive descriptor is terminal and is never retried on its own.
//! The streamer initiates the offer for both room types, so the viewer's
//! job is: join, wait for the offer, answer, render. `StreamEnded` and
//! transport closure land in the terminal `Ended` state; recovery is the
//! user-initiated [`ViewerSession::retry`].

use crate::error::SessionError;
use crate::media::MediaSink;
use crate::peer::{PeerConnectionManager, PeerState};
use crate::retry::RetryPolicy;
use crate::transport::store::SignalStore;
use crate::transport::SignalingTransport;
use crate::ClientContext;

use aegis_types::{
    answer_key, offer_key, stream_key, RoomId, SignalMessage, StreamDescriptor, StreamId,
};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_DELAY: Duration = Duration::from_secs(1);
/// Realtime path: how long to wait for the streamer's offer before the
/// session goes terminal instead of sitting in `Connecting` forever.
const OFFER_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// What the watch UI shows. `Ended` and `Failed` are terminal; the
/// session never leaves them on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerState {
    Connecting,
    Connected,
    Ended,
    Failed(String),
}

impl ViewerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ViewerState::Ended | ViewerState::Failed(_))
    }
}

/// A live watch session for one stream.
pub struct ViewerSession {
    stream_id: StreamId,
    descriptor: StreamDescriptor,
    peer: PeerConnectionManager,
    transport: Option<SignalingTransport>,
    states: watch::Receiver<ViewerState>,
    stopped: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ViewerSession {
    /// Discover and join `stream_id`. Terminal [`SessionError::NotFound`]
    /// when the stream does not exist, has ended, or (fallback path) no
    /// offer appears within the bounded polling window.
    pub async fn watch(
        ctx: &ClientContext,
        store: Arc<dyn SignalStore>,
        stream_id: StreamId,
        sink: Arc<dyn MediaSink>,
    ) -> Result<Self, SessionError> {
        let descriptor = match store.get(&stream_key(&stream_id)).await? {
            Some(raw) => StreamDescriptor::decode(&raw).map_err(|e| {
                warn!("unreadable descriptor for {stream_id}: {e}");
                SessionError::NotFound
            })?,
            None => return Err(SessionError::NotFound),
        };
        if !descriptor.active {
            return Err(SessionError::NotFound);
        }
        let room_id = RoomId::for_stream(&stream_id);
        info!("watching stream {stream_id} in room {room_id}");

        let peer = PeerConnectionManager::new(ctx.stun_servers.clone()).await?;
        peer.on_track(sink);

        let (state_tx, states) = watch::channel(ViewerState::Connecting);
        let mut tasks = Vec::new();

        let transport = match SignalingTransport::connect(&ctx.ws_url(&room_id)).await {
            Ok((transport, inbound)) => {
                transport
                    .send(&SignalMessage::JoinRoom {
                        room_id: room_id.clone(),
                        emergency: descriptor.emergency,
                    })
                    .await;
                Self::relay_local_candidates(&peer, &transport, &stream_id);
                tasks.push(Self::spawn_inbound_relay(
                    inbound,
                    peer.clone(),
                    transport.clone(),
                    stream_id.clone(),
                    state_tx.clone(),
                ));
                tasks.push(Self::spawn_offer_deadline(peer.clone(), state_tx.clone()));
                Some(transport)
            }
            Err(e) if e.is_recoverable() => {
                warn!("realtime signaling unavailable ({e}), polling for the offer");
                Self::answer_via_store(&peer, store.clone(), &stream_id).await?;
                None
            }
            Err(e) => return Err(e),
        };

        tasks.push(Self::spawn_state_watch(
            peer.states(),
            transport.clone(),
            stream_id.clone(),
            state_tx,
        ));

        Ok(ViewerSession {
            stream_id,
            descriptor,
            peer,
            transport,
            states,
            stopped: Arc::new(AtomicBool::new(false)),
            tasks,
        })
    }

    /// Fallback negotiation: poll the streamer's stored offer, answer
    /// with a fully gathered (non-trickle) SDP.
    async fn answer_via_store(
        peer: &PeerConnectionManager,
        store: Arc<dyn SignalStore>,
        stream_id: &StreamId,
    ) -> Result<(), SessionError> {
        let key = offer_key(stream_id);
        let offer = RetryPolicy::FALLBACK_POLL
            .poll_until(|| {
                let store = store.clone();
                let key = key.clone();
                async move { store.get(&key).await.ok().flatten() }
            })
            .await
            .ok_or(SessionError::NotFound)?;
        peer.accept_offer(offer).await?;
        peer.wait_ice_complete(ICE_GATHER_TIMEOUT).await?;
        let answer = peer.local_description().await.ok_or_else(|| {
            SessionError::Negotiation("no local description after gathering".into())
        })?;
        store.put(&answer_key(stream_id), answer).await?;
        Ok(())
    }

    fn relay_local_candidates(
        peer: &PeerConnectionManager,
        transport: &SignalingTransport,
        stream_id: &StreamId,
    ) {
        let transport = transport.clone();
        let stream_id = stream_id.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        peer.on_local_candidate(move |candidate| {
            let _ = tx.send(candidate);
        });
        tokio::spawn(async move {
            while let Some(candidate) = rx.recv().await {
                transport
                    .send(&SignalMessage::IceCandidate {
                        stream_id: stream_id.clone(),
                        candidate,
                    })
                    .await;
            }
        });
    }

    fn spawn_inbound_relay(
        mut inbound: mpsc::Receiver<SignalMessage>,
        peer: PeerConnectionManager,
        transport: SignalingTransport,
        stream_id: StreamId,
        state_tx: watch::Sender<ViewerState>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                Self::handle_signal(msg, &peer, Some(&transport), &stream_id, &state_tx).await;
                if state_tx.borrow().is_terminal() {
                    break;
                }
            }
            // Channel closure with no prior terminal state means the
            // server went away mid-stream.
            if !state_tx.borrow().is_terminal() {
                let _ = state_tx.send(ViewerState::Ended);
            }
            debug!("viewer inbound relay ended");
        })
    }

    /// One inbound message against the viewer state machine.
    async fn handle_signal(
        msg: SignalMessage,
        peer: &PeerConnectionManager,
        transport: Option<&SignalingTransport>,
        stream_id: &StreamId,
        state_tx: &watch::Sender<ViewerState>,
    ) {
        if let Some(id) = msg.stream_id() {
            if id != stream_id {
                debug!("ignoring signal for foreign stream {id}");
                return;
            }
        }
        match msg {
            SignalMessage::Offer { sdp, .. } => {
                // Join announcements make the streamer re-publish, so a
                // second copy of the offer can arrive after we answered.
                if peer.has_remote_description().await {
                    debug!("duplicate offer ignored");
                    return;
                }
                match peer.accept_offer(sdp).await {
                    Ok(answer) => {
                        if let Some(transport) = transport {
                            transport
                                .send(&SignalMessage::Answer {
                                    stream_id: stream_id.clone(),
                                    sdp: answer,
                                })
                                .await;
                        }
                    }
                    Err(e) => {
                        warn!("offer rejected: {e}");
                        let _ = state_tx.send(ViewerState::Failed(e.to_string()));
                    }
                }
            }
            SignalMessage::IceCandidate { candidate, .. } => {
                peer.add_remote_candidate(candidate).await;
            }
            SignalMessage::StreamEnded { .. } => {
                info!("stream {stream_id} ended by the streamer");
                let _ = state_tx.send(ViewerState::Ended);
                peer.close().await;
            }
            other => debug!("viewer ignoring {other:?}"),
        }
    }

    /// No offer inside the bounded window means the streamer is gone or
    /// never announced; surface `Failed` instead of an endless spinner.
    fn spawn_offer_deadline(
        peer: PeerConnectionManager,
        state_tx: watch::Sender<ViewerState>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(OFFER_WAIT_TIMEOUT).await;
            if !peer.has_remote_description().await && !state_tx.borrow().is_terminal() {
                warn!("no offer within the bounded window");
                let _ = state_tx.send(ViewerState::Failed(
                    "no offer within the bounded window".into(),
                ));
            }
        })
    }

    /// Mirror peer-connection transitions into the display state and
    /// announce ourselves to the streamer once media flows.
    fn spawn_state_watch(
        mut peer_states: watch::Receiver<PeerState>,
        transport: Option<SignalingTransport>,
        stream_id: StreamId,
        state_tx: watch::Sender<ViewerState>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while peer_states.changed().await.is_ok() {
                let state = *peer_states.borrow();
                match state {
                    PeerState::Connected => {
                        if !state_tx.borrow().is_terminal() {
                            let _ = state_tx.send(ViewerState::Connected);
                        }
                        if let Some(transport) = &transport {
                            transport
                                .send(&SignalMessage::ViewerConnected {
                                    stream_id: stream_id.clone(),
                                })
                                .await;
                        }
                    }
                    PeerState::Disconnected | PeerState::Failed => {
                        if !state_tx.borrow().is_terminal() {
                            let _ = state_tx
                                .send(ViewerState::Failed("connection lost".into()));
                        }
                        break;
                    }
                    _ => {}
                }
            }
        })
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ViewerState {
        self.states.borrow().clone()
    }

    /// Stream of display-state transitions.
    pub fn states(&self) -> watch::Receiver<ViewerState> {
        self.states.clone()
    }

    /// Tear down this session. Idempotent.
    pub async fn stop(&self) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        for task in &self.tasks {
            task.abort();
        }
        if let Some(transport) = &self.transport {
            transport
                .send(&SignalMessage::ViewerDisconnected {
                    stream_id: self.stream_id.clone(),
                })
                .await;
            transport.close().await;
        }
        self.peer.close().await;
    }

    /// User-initiated retry: dispose everything and start over after a
    /// fixed delay. The automatic paths never call this.
    pub async fn retry(
        self,
        ctx: &ClientContext,
        store: Arc<dyn SignalStore>,
        sink: Arc<dyn MediaSink>,
    ) -> Result<Self, SessionError> {
        let stream_id = self.stream_id.clone();
        self.stop().await;
        tokio::time::sleep(RETRY_DELAY).await;
        Self::watch(ctx, store, stream_id, sink).await
    }
}
