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

//! Realtime signaling channel over WebSocket (`tokio-tungstenite`).
//!
//! Frames are JSON [`SignalMessage`]s decoded right here at the boundary;
//! anything that does not parse is logged and dropped. `send` is
//! fire-and-forget: there is no delivery acknowledgment and no ordering
//! guarantee beyond the socket's own. A connect failure is recoverable —
//! the caller degrades to the [`store`] polling path.

pub mod store;

use crate::error::SessionError;

use aegis_types::SignalMessage;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// How long a connect attempt may take before we fall back to polling.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A handle to an open signaling channel. Cheap to clone; all clones
/// share the underlying socket.
#[derive(Clone)]
pub struct SignalingTransport {
    writer: Arc<Mutex<SplitSink<WsStream, Message>>>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for SignalingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingTransport")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl SignalingTransport {
    /// Open the channel. Bounded: a connection that cannot be
    /// established within [`CONNECT_TIMEOUT`] is reported as a
    /// recoverable [`SessionError::Transport`].
    ///
    /// Returns the transport plus the inbound message stream. The
    /// receiver yielding `None` means the channel closed.
    pub async fn connect(
        url: &str,
    ) -> Result<(Self, mpsc::Receiver<SignalMessage>), SessionError> {
        info!("signaling transport connecting to {url}");
        let (ws_stream, response) =
            tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| {
                    SessionError::Transport(format!("connect to {url} timed out"))
                })?
                .map_err(|e| SessionError::Transport(format!("connect to {url} failed: {e}")))?;
        debug!("signaling transport open (HTTP {})", response.status());

        let (writer, mut reader) = ws_stream.split();
        let closed = Arc::new(AtomicBool::new(false));
        let transport = SignalingTransport {
            writer: Arc::new(Mutex::new(writer)),
            closed: closed.clone(),
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(item) = reader.next().await {
                if closed.load(Ordering::Relaxed) {
                    break;
                }
                match item {
                    Ok(Message::Text(raw)) => match SignalMessage::decode(&raw) {
                        Ok(msg) => {
                            if inbound_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("rejected malformed signaling frame: {e}"),
                    },
                    Ok(Message::Close(_)) => {
                        info!("signaling channel closed by server");
                        closed.store(true, Ordering::Relaxed);
                        break;
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                    Ok(other) => debug!("ignoring non-text frame: {other:?}"),
                    Err(e) => {
                        if !closed.load(Ordering::Relaxed) {
                            error!("signaling read error: {e}");
                        }
                        break;
                    }
                }
            }
            debug!("signaling reader loop ended");
        });

        Ok((transport, inbound_rx))
    }

    /// Fire-and-forget send. Failures are logged, never surfaced; the
    /// protocol tolerates lost control messages.
    pub async fn send(&self, msg: &SignalMessage) {
        if self.closed.load(Ordering::Relaxed) {
            debug!("dropping send on closed transport");
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send(Message::Text(msg.encode())).await {
            warn!("signaling send failed: {e}");
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Relaxed)
    }

    /// Close gracefully. Safe to call more than once.
    pub async fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.send(Message::Close(None)).await {
                debug!("close frame not delivered: {e}");
            }
        }
    }
}
