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

//! Local backup recording of the outgoing stream.
//!
//! Samples are buffered in memory and flushed to numbered segment files
//! every five seconds, so a crash loses at most one flush interval.
//! Upload is opportunistic: a failed upload is reported but never
//! touches the live session.

use crate::error::SessionError;

use bytes::Bytes;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

struct RecorderInner {
    dir: PathBuf,
    buffer: Vec<u8>,
    segments: u32,
}

impl RecorderInner {
    fn append(&mut self, payload: &[u8]) {
        self.buffer.extend_from_slice(payload);
    }

    /// Write the buffered bytes to the next segment file. Empty buffers
    /// produce no segment.
    fn flush(&mut self) -> std::io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let path = self.dir.join(format!("segment_{:05}.bin", self.segments));
        fs::write(&path, &self.buffer)?;
        debug!("flushed {} bytes to {}", self.buffer.len(), path.display());
        self.segments += 1;
        self.buffer.clear();
        Ok(())
    }

    fn segment_paths(&self) -> Vec<PathBuf> {
        (0..self.segments)
            .map(|n| self.dir.join(format!("segment_{n:05}.bin")))
            .collect()
    }
}

/// Records the streamer's outgoing payloads to disk in segments.
pub struct BackupRecorder {
    stream_id: String,
    inner: Arc<Mutex<RecorderInner>>,
    stopped: Arc<AtomicBool>,
    driver: JoinHandle<()>,
}

impl BackupRecorder {
    /// Start recording payloads arriving on `rx` into `dir`. The
    /// directory is created if missing.
    pub fn start(
        dir: impl AsRef<Path>,
        stream_id: &str,
        mut rx: mpsc::Receiver<Bytes>,
    ) -> Result<Self, SessionError> {
        let dir = dir.as_ref().join(stream_id);
        fs::create_dir_all(&dir)
            .map_err(|e| SessionError::Upload(format!("recording dir {}: {e}", dir.display())))?;

        let inner = Arc::new(Mutex::new(RecorderInner {
            dir,
            buffer: Vec::new(),
            segments: 0,
        }));
        let stopped = Arc::new(AtomicBool::new(false));

        let driver = {
            let inner = inner.clone();
            let stopped = stopped.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        payload = rx.recv() => {
                            match payload {
                                Some(bytes) => inner.lock().unwrap_or_else(|p| p.into_inner()).append(&bytes),
                                None => break,
                            }
                        }
                        _ = ticker.tick() => {
                            if stopped.load(Ordering::Relaxed) {
                                break;
                            }
                            if let Err(e) = inner.lock().unwrap_or_else(|p| p.into_inner()).flush() {
                                warn!("segment flush failed: {e}");
                            }
                        }
                    }
                }
                debug!("recorder driver ended");
            })
        };

        Ok(BackupRecorder {
            stream_id: stream_id.to_owned(),
            inner,
            stopped,
            driver,
        })
    }

    /// Final flush. Idempotent; after the first call the driver is gone
    /// and further payloads are dropped.
    pub fn stop(&self) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.driver.abort();
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(e) = inner.flush() {
                warn!("final segment flush failed: {e}");
            }
            info!(
                "recording for {} stopped ({} segment(s))",
                self.stream_id, inner.segments
            );
        }
    }

    /// Paths of every segment written so far, in order.
    pub fn segments(&self) -> Vec<PathBuf> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .segment_paths()
    }

    /// Concatenate the segments and POST them as a multipart form
    /// correlated by stream id. Non-fatal by contract: callers log the
    /// `Upload` error and move on.
    pub async fn upload(&self, url: &str, http: &reqwest::Client) -> Result<(), SessionError> {
        let mut recording = Vec::new();
        for path in self.segments() {
            let chunk = fs::read(&path)
                .map_err(|e| SessionError::Upload(format!("read {}: {e}", path.display())))?;
            recording.extend_from_slice(&chunk);
        }
        if recording.is_empty() {
            debug!("nothing recorded for {}, skipping upload", self.stream_id);
            return Ok(());
        }

        let form = reqwest::multipart::Form::new()
            .text("stream_id", self.stream_id.clone())
            .part(
                "recording",
                reqwest::multipart::Part::bytes(recording)
                    .file_name(format!("{}.bin", self.stream_id)),
            );
        let resp = http
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| SessionError::Upload(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SessionError::Upload(format!(
                "upload returned {}",
                resp.status()
            )));
        }
        info!("recording for {} uploaded", self.stream_id);
        Ok(())
    }
}

impl Drop for BackupRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("aegis-recorder-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[tokio::test]
    async fn stop_flushes_pending_buffer() {
        let dir = scratch_dir("flush");
        let (tx, rx) = mpsc::channel(8);
        let recorder = BackupRecorder::start(&dir, "s1", rx).unwrap();
        tx.send(Bytes::from_static(b"abc")).await.unwrap();
        tx.send(Bytes::from_static(b"def")).await.unwrap();
        // Let the driver drain the channel before stopping.
        tokio::time::sleep(Duration::from_millis(50)).await;
        recorder.stop();
        recorder.stop();
        let segments = recorder.segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(fs::read(&segments[0]).unwrap(), b"abcdef");
        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn empty_recording_writes_no_segments() {
        let dir = scratch_dir("empty");
        let (_tx, rx) = mpsc::channel::<Bytes>(1);
        let recorder = BackupRecorder::start(&dir, "s2", rx).unwrap();
        recorder.stop();
        assert!(recorder.segments().is_empty());
        let _ = fs::remove_dir_all(&dir);
    }
}
