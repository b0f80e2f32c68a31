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

//! Outgoing stream session.
//!
//! The streamer initiates the offer for both emergency and ad hoc
//! rooms. Startup order: acquire media (a permission failure aborts
//! before anything else happens), derive the stream id, open signaling,
//! publish the descriptor, publish the offer, then relay candidates as
//! they gather. Join announcements from the room trigger a re-publish
//! of the current description, so viewers arriving after the first
//! offer still negotiate. If the realtime channel cannot be opened the session
//! degrades to the store path instead of aborting: the full
//! ICE-complete offer is written to `webrtc_offer_<id>` and the answer
//! is polled from `webrtc_answer_<id>`.

use crate::error::SessionError;
use crate::media::{LocalMedia, MediaConstraints, MediaDevices};
use crate::peer::{PeerConnectionManager, PeerState};
use crate::recorder::BackupRecorder;
use crate::retry::RetryPolicy;
use crate::transport::store::SignalStore;
use crate::transport::SignalingTransport;
use crate::ClientContext;

use aegis_types::{
    answer_key, offer_key, stream_key, watch_path, RoomId, SignalMessage, StreamDescriptor,
    StreamId,
};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Gathering bound for the non-trickle fallback offer.
const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(10);

/// What the caller asked for when starting a stream.
pub struct StreamOptions {
    pub constraints: MediaConstraints,
    /// Present for emergency streams; the stream id becomes
    /// `emergency_<alert_id>`.
    pub alert_id: Option<String>,
    /// Where backup segments land. `None` disables recording.
    pub recording_dir: Option<PathBuf>,
}

impl StreamOptions {
    pub fn ad_hoc() -> Self {
        StreamOptions {
            constraints: MediaConstraints::default(),
            alert_id: None,
            recording_dir: None,
        }
    }

    pub fn emergency(alert_id: impl Into<String>) -> Self {
        StreamOptions {
            constraints: MediaConstraints::default(),
            alert_id: Some(alert_id.into()),
            recording_dir: None,
        }
    }
}

/// Session lifecycle notifications for the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamerEvent {
    /// A viewer completed negotiation (current viewer count).
    ViewerJoined(u32),
    ViewerLeft(u32),
    /// The peer connection reached `connected`.
    Negotiated,
    /// Terminal: no viewer answered within the fallback window, or the
    /// answer could not be applied.
    NegotiationFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalingMode {
    Realtime,
    Fallback,
}

/// A live outgoing stream. Dropping the session without `stop()` leaks
/// the fallback keys until the server sweeps them; call `stop()`.
pub struct StreamerSession {
    stream_id: StreamId,
    room_id: RoomId,
    peer: PeerConnectionManager,
    media: LocalMedia,
    recorder: Option<BackupRecorder>,
    transport: Option<SignalingTransport>,
    store: Arc<dyn SignalStore>,
    mode: SignalingMode,
    viewer_count: Arc<AtomicU32>,
    stopped: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
    events: Option<mpsc::Receiver<StreamerEvent>>,
    share_base_url: String,
    upload_url: Option<String>,
    started_at_ms: u64,
    emergency: bool,
}

impl StreamerSession {
    pub async fn start(
        ctx: &ClientContext,
        devices: &dyn MediaDevices,
        store: Arc<dyn SignalStore>,
        options: StreamOptions,
    ) -> Result<Self, SessionError> {
        // Media first: a denied permission must abort before any
        // signaling artifact exists.
        let source = devices.acquire(options.constraints).await?;

        let stream_id = match &options.alert_id {
            Some(alert) => StreamId::for_alert(alert),
            None => StreamId::generate(),
        };
        let room_id = RoomId::for_stream(&stream_id);
        let emergency = options.alert_id.is_some();
        info!("starting {} stream {stream_id} in room {room_id}",
            if emergency { "emergency" } else { "ad hoc" });

        let (recorder, tap) = match &options.recording_dir {
            Some(dir) => {
                let (tx, rx) = mpsc::channel(256);
                (Some(BackupRecorder::start(dir, stream_id.as_str(), rx)?), Some(tx))
            }
            None => (None, None),
        };
        let media = LocalMedia::start(source, stream_id.as_str(), tap);

        let peer = PeerConnectionManager::new(ctx.stun_servers.clone()).await?;
        peer.attach_track(media.track()).await?;

        let descriptor = StreamDescriptor::new(stream_id.clone(), emergency);
        let started_at_ms = descriptor.started_at_ms;
        store
            .put(&stream_key(&stream_id), descriptor.encode())
            .await?;

        let (events_tx, events_rx) = mpsc::channel(16);
        let viewer_count = Arc::new(AtomicU32::new(0));
        let mut tasks = Vec::new();

        let (transport, mode) = match SignalingTransport::connect(&ctx.ws_url(&room_id)).await {
            Ok((transport, inbound)) => {
                transport
                    .send(&SignalMessage::JoinRoom {
                        room_id: room_id.clone(),
                        emergency,
                    })
                    .await;
                let offer_sdp = peer.create_offer().await?;
                transport
                    .send(&SignalMessage::Offer {
                        stream_id: stream_id.clone(),
                        sdp: offer_sdp,
                    })
                    .await;
                Self::relay_local_candidates(&peer, &transport, &stream_id);
                tasks.push(Self::spawn_inbound_relay(
                    inbound,
                    peer.clone(),
                    transport.clone(),
                    store.clone(),
                    stream_id.clone(),
                    emergency,
                    started_at_ms,
                    viewer_count.clone(),
                    events_tx.clone(),
                ));
                (Some(transport), SignalingMode::Realtime)
            }
            Err(e) if e.is_recoverable() => {
                warn!("realtime signaling unavailable ({e}), using store fallback");
                peer.create_offer().await?;
                peer.wait_ice_complete(ICE_GATHER_TIMEOUT).await?;
                let full_offer = peer.local_description().await.ok_or_else(|| {
                    SessionError::Negotiation("no local description after gathering".into())
                })?;
                store.put(&offer_key(&stream_id), full_offer).await?;
                tasks.push(Self::spawn_answer_poll(
                    peer.clone(),
                    store.clone(),
                    stream_id.clone(),
                    events_tx.clone(),
                ));
                (None, SignalingMode::Fallback)
            }
            Err(e) => return Err(e),
        };

        tasks.push(Self::spawn_state_watch(peer.states(), events_tx));

        Ok(StreamerSession {
            stream_id,
            room_id,
            peer,
            media,
            recorder,
            transport,
            store,
            mode,
            viewer_count,
            stopped: Arc::new(AtomicBool::new(false)),
            tasks,
            events: Some(events_rx),
            share_base_url: ctx.share_base_url.clone(),
            upload_url: ctx.upload_url.clone(),
            started_at_ms,
            emergency,
        })
    }

    /// Forward every locally gathered candidate as its own message.
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

    #[allow(clippy::too_many_arguments)]
    fn spawn_inbound_relay(
        mut inbound: mpsc::Receiver<SignalMessage>,
        peer: PeerConnectionManager,
        transport: SignalingTransport,
        store: Arc<dyn SignalStore>,
        stream_id: StreamId,
        emergency: bool,
        started_at_ms: u64,
        viewer_count: Arc<AtomicU32>,
        events: mpsc::Sender<StreamerEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                if let Some(id) = msg.stream_id() {
                    if id != &stream_id {
                        debug!("ignoring signal for foreign stream {id}");
                        continue;
                    }
                }
                match msg {
                    SignalMessage::JoinRoom { .. } => {
                        // The first offer went out when the room may
                        // have been empty. Re-publish the current local
                        // description for the new arrival; it carries
                        // every candidate gathered so far, and anything
                        // still trickling follows as usual.
                        match peer.local_description().await {
                            Some(sdp) => {
                                debug!("re-publishing offer for a late joiner");
                                transport
                                    .send(&SignalMessage::Offer {
                                        stream_id: stream_id.clone(),
                                        sdp,
                                    })
                                    .await;
                            }
                            None => warn!("join announcement before the local description"),
                        }
                    }
                    SignalMessage::Answer { sdp, .. } => {
                        if let Err(e) = peer.apply_answer(sdp).await {
                            warn!("viewer answer rejected: {e}");
                            let _ = events
                                .send(StreamerEvent::NegotiationFailed(e.to_string()))
                                .await;
                        }
                    }
                    SignalMessage::IceCandidate { candidate, .. } => {
                        peer.add_remote_candidate(candidate).await;
                    }
                    SignalMessage::ViewerConnected { .. } => {
                        let count = viewer_count.fetch_add(1, Ordering::SeqCst) + 1;
                        Self::publish_count(&store, &stream_id, emergency, started_at_ms, count)
                            .await;
                        let _ = events.send(StreamerEvent::ViewerJoined(count)).await;
                    }
                    SignalMessage::ViewerDisconnected { .. } => {
                        let count = viewer_count
                            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                                Some(c.saturating_sub(1))
                            })
                            .map(|c| c.saturating_sub(1))
                            .unwrap_or(0);
                        Self::publish_count(&store, &stream_id, emergency, started_at_ms, count)
                            .await;
                        let _ = events.send(StreamerEvent::ViewerLeft(count)).await;
                    }
                    other => debug!("streamer ignoring {other:?}"),
                }
            }
            debug!("streamer inbound relay ended");
        })
    }

    async fn publish_count(
        store: &Arc<dyn SignalStore>,
        stream_id: &StreamId,
        emergency: bool,
        started_at_ms: u64,
        count: u32,
    ) {
        let descriptor = StreamDescriptor {
            stream_id: stream_id.clone(),
            active: true,
            emergency,
            started_at_ms,
            viewer_count: count,
        };
        if let Err(e) = store.put(&stream_key(stream_id), descriptor.encode()).await {
            warn!("descriptor update failed: {e}");
        }
    }

    /// Fallback path: poll for the viewer's answer inside the bounded
    /// window. Coming up empty is terminal for this session.
    fn spawn_answer_poll(
        peer: PeerConnectionManager,
        store: Arc<dyn SignalStore>,
        stream_id: StreamId,
        events: mpsc::Sender<StreamerEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let key = answer_key(&stream_id);
            let answer = RetryPolicy::FALLBACK_POLL
                .poll_until(|| {
                    let store = store.clone();
                    let key = key.clone();
                    async move { store.get(&key).await.ok().flatten() }
                })
                .await;
            match answer {
                Some(sdp) => {
                    if let Err(e) = peer.apply_answer(sdp).await {
                        warn!("fallback answer rejected: {e}");
                        let _ = events
                            .send(StreamerEvent::NegotiationFailed(e.to_string()))
                            .await;
                    }
                }
                None => {
                    warn!("no viewer answer within the fallback window");
                    let _ = events
                        .send(StreamerEvent::NegotiationFailed(
                            "no answer within the fallback window".into(),
                        ))
                        .await;
                }
            }
        })
    }

    fn spawn_state_watch(
        mut states: tokio::sync::watch::Receiver<PeerState>,
        events: mpsc::Sender<StreamerEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow();
                if state == PeerState::Connected {
                    let _ = events.send(StreamerEvent::Negotiated).await;
                    break;
                }
                if state.is_terminal() {
                    break;
                }
            }
        })
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The link contacts open to watch this stream.
    pub fn watch_url(&self) -> String {
        format!(
            "{}{}",
            self.share_base_url.trim_end_matches('/'),
            watch_path(&self.stream_id)
        )
    }

    pub fn viewer_count(&self) -> u32 {
        self.viewer_count.load(Ordering::SeqCst)
    }

    pub fn is_fallback(&self) -> bool {
        self.mode == SignalingMode::Fallback
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency
    }

    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    pub fn connection_state(&self) -> PeerState {
        self.peer.state()
    }

    /// Take the event stream. Yields `None` after `stop()`.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<StreamerEvent>> {
        self.events.take()
    }

    /// End the stream. Idempotent. Tracks stop synchronously; the
    /// `StreamEnded` broadcast, key deletion and upload are best-effort.
    pub async fn stop(&self) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        info!("stopping stream {}", self.stream_id);
        self.media.stop();
        for task in &self.tasks {
            task.abort();
        }
        if let Some(transport) = &self.transport {
            transport
                .send(&SignalMessage::StreamEnded {
                    stream_id: self.stream_id.clone(),
                })
                .await;
            transport.close().await;
        }
        self.peer.close().await;
        for key in [
            stream_key(&self.stream_id),
            offer_key(&self.stream_id),
            answer_key(&self.stream_id),
        ] {
            if let Err(e) = self.store.delete(&key).await {
                debug!("fallback key {key} not deleted: {e}");
            }
        }
        if let Some(recorder) = &self.recorder {
            recorder.stop();
            if let Some(url) = &self.upload_url {
                if let Err(e) = recorder.upload(url, &reqwest::Client::new()).await {
                    warn!("{e}");
                }
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}
