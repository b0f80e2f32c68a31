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

//! Local media acquisition and inbound media consumption.
//!
//! Capture hardware sits behind [`MediaDevices`]; a denied or missing
//! device surfaces as [`SessionError::PermissionDenied`] and the session
//! never starts. The shipped [`TestPatternCamera`] produces a synthetic
//! encoded stream so the CLI and tests run without real hardware.

use crate::error::SessionError;
use crate::peer::PeerConnectionManager;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Which camera to prefer and how large a frame to ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub facing: FacingMode,
    pub max_height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacingMode {
    /// Front camera, the emergency default (streamer films themself).
    User,
    Environment,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        MediaConstraints {
            facing: FacingMode::User,
            max_height: 720,
        }
    }
}

/// Supplies encoded media samples, one at a time. `None` ends the feed.
#[async_trait]
pub trait MediaSource: Send {
    async fn next_sample(&mut self) -> Option<Sample>;
}

/// Acquisition point for capture devices. Failure here is fatal to the
/// calling session and is never retried silently.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Box<dyn MediaSource>, SessionError>;
}

/// Consumes inbound media on the viewer side.
pub trait MediaSink: Send + Sync {
    /// Called once per received RTP payload. `kind` is `"video"` or
    /// `"audio"`.
    fn on_sample(&self, kind: &str, payload: &[u8]);
}

/// Discards everything. For tests and headless probes.
#[derive(Default)]
pub struct NullSink {
    received: AtomicU64,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

impl MediaSink for NullSink {
    fn on_sample(&self, _kind: &str, _payload: &[u8]) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }
}

/// Synthetic camera: grants immediately and emits a deterministic
/// pattern at ~30 fps.
pub struct TestPatternCamera;

#[async_trait]
impl MediaDevices for TestPatternCamera {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Box<dyn MediaSource>, SessionError> {
        debug!("test pattern camera granted ({constraints:?})");
        Ok(Box::new(TestPatternSource::new()))
    }
}

/// Simulates a user who declined the camera/microphone prompt.
pub struct DeniedCamera;

#[async_trait]
impl MediaDevices for DeniedCamera {
    async fn acquire(
        &self,
        _constraints: MediaConstraints,
    ) -> Result<Box<dyn MediaSource>, SessionError> {
        Err(SessionError::PermissionDenied(
            "access to the camera was denied".into(),
        ))
    }
}

const FRAME_INTERVAL: Duration = Duration::from_millis(33);
const FRAME_BYTES: usize = 1200;

/// Deterministic frame generator: frame `n` is `FRAME_BYTES` copies of
/// `n as u8`, so tests can assert on content.
pub struct TestPatternSource {
    frame: u64,
}

impl TestPatternSource {
    pub fn new() -> Self {
        TestPatternSource { frame: 0 }
    }
}

impl Default for TestPatternSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for TestPatternSource {
    async fn next_sample(&mut self) -> Option<Sample> {
        tokio::time::sleep(FRAME_INTERVAL).await;
        let payload = vec![(self.frame & 0xff) as u8; FRAME_BYTES];
        self.frame += 1;
        Some(Sample {
            data: Bytes::from(payload),
            duration: FRAME_INTERVAL,
            ..Default::default()
        })
    }
}

/// A running local capture: the outgoing track plus the feeder task
/// pumping source samples into it. An optional tap receives a copy of
/// every payload for the backup recorder.
pub struct LocalMedia {
    track: Arc<TrackLocalStaticSample>,
    stopped: Arc<AtomicBool>,
    feeder: JoinHandle<()>,
}

impl LocalMedia {
    pub fn start(
        mut source: Box<dyn MediaSource>,
        stream_id: &str,
        tap: Option<mpsc::Sender<Bytes>>,
    ) -> Self {
        let track = PeerConnectionManager::new_video_track(stream_id);
        let stopped = Arc::new(AtomicBool::new(false));

        let feeder = {
            let track = track.clone();
            let stopped = stopped.clone();
            tokio::spawn(async move {
                while !stopped.load(Ordering::Relaxed) {
                    let Some(sample) = source.next_sample().await else {
                        debug!("media source exhausted");
                        break;
                    };
                    if let Some(tap) = &tap {
                        // Recorder lagging must never stall the live feed.
                        let _ = tap.try_send(sample.data.clone());
                    }
                    if let Err(e) = track.write_sample(&sample).await {
                        warn!("write_sample failed, stopping feed: {e}");
                        break;
                    }
                }
                debug!("media feeder ended");
            })
        };

        LocalMedia {
            track,
            stopped,
            feeder,
        }
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    /// Stop the capture. Idempotent; the feeder exits at most once.
    pub fn stop(&self) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.feeder.abort();
            debug!("local media stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.stop();
    }
}
