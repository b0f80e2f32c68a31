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

//! Client library for the aegis emergency streaming service.
//!
//! The two session types are [`StreamerSession`] (broadcast) and
//! [`ViewerSession`] (watch). Both negotiate over the realtime
//! signaling channel when it is reachable and degrade to the shared
//! key/value store otherwise. [`TriggerCoordinator`] wires the streamer
//! side into the emergency pipeline: alert, stream, contact
//! notification.
//!
//! All configuration travels in an explicit [`ClientContext`]; there is
//! no process-global session state.

pub mod error;
pub mod media;
pub mod peer;
pub mod recorder;
pub mod retry;
pub mod streamer;
pub mod transport;
pub mod trigger;
pub mod viewer;

pub use error::SessionError;
pub use media::{
    DeniedCamera, FacingMode, MediaConstraints, MediaDevices, MediaSink, MediaSource, NullSink,
    TestPatternCamera,
};
pub use peer::{PeerConnectionManager, PeerState};
pub use recorder::BackupRecorder;
pub use retry::RetryPolicy;
pub use streamer::{StreamOptions, StreamerEvent, StreamerSession};
pub use transport::store::{HttpStoreClient, MemoryStore, SignalStore};
pub use transport::SignalingTransport;
pub use trigger::{
    AlertSink, Contact, ContactMessenger, EmergencyRecord, Location, LocationProvider,
    TriggerCoordinator, TriggerKind, TriggerOutcome,
};
pub use viewer::{ViewerSession, ViewerState};

use aegis_types::RoomId;

/// Everything a session needs to know about its environment, passed
/// explicitly instead of living in globals.
#[derive(Debug, Clone)]
pub struct ClientContext {
    /// Identifies this client on the signaling channel.
    pub user_id: String,
    /// Base URL of the realtime channel, e.g. `ws://localhost:8090`.
    pub signaling_url: String,
    /// Base URL of the fallback store, e.g. `http://localhost:8090`.
    pub store_url: String,
    /// Base URL watch links are built on.
    pub share_base_url: String,
    /// Where finished recordings are posted. `None` disables upload.
    pub upload_url: Option<String>,
    /// STUN servers handed to every peer connection. Empty means
    /// loopback-only (tests).
    pub stun_servers: Vec<String>,
}

impl ClientContext {
    pub fn new(
        user_id: impl Into<String>,
        signaling_url: impl Into<String>,
        store_url: impl Into<String>,
    ) -> Self {
        let store_url = store_url.into();
        ClientContext {
            user_id: user_id.into(),
            signaling_url: signaling_url.into(),
            share_base_url: store_url.clone(),
            store_url,
            upload_url: None,
            stun_servers: peer::DEFAULT_STUN_SERVERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn with_stun_servers(mut self, servers: Vec<String>) -> Self {
        self.stun_servers = servers;
        self
    }

    pub fn with_share_base(mut self, base: impl Into<String>) -> Self {
        self.share_base_url = base.into();
        self
    }

    pub fn with_upload_url(mut self, url: impl Into<String>) -> Self {
        self.upload_url = Some(url.into());
        self
    }

    /// The WebSocket endpoint for a room.
    pub fn ws_url(&self, room: &RoomId) -> String {
        format!(
            "{}/ws/{}/{}",
            self.signaling_url.trim_end_matches('/'),
            self.user_id,
            room
        )
    }
}
