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

use thiserror::Error;

/// Error taxonomy for streamer/viewer sessions.
///
/// * `PermissionDenied` is fatal to the operation that needed the
///   permission and is never retried silently.
/// * `Transport` is recoverable: the session falls back to the polling
///   path automatically.
/// * `Negotiation` and `NotFound` are terminal; recovery is a
///   user-initiated retry that rebuilds transport and peer connection
///   from scratch.
/// * `Upload` is non-fatal and never affects the live session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("camera/microphone unavailable: {0}. Enable camera and microphone access and try again")]
    PermissionDenied(String),

    #[error("signaling transport unavailable: {0}")]
    Transport(String),

    #[error("unable to connect: {0}")]
    Negotiation(String),

    #[error("stream not found or has ended")]
    NotFound,

    #[error("recording upload failed: {0}")]
    Upload(String),
}

impl SessionError {
    /// Whether the caller may degrade to the fallback signaling path.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SessionError::Transport(_))
    }
}

pub(crate) fn transport<E: std::fmt::Display>(e: E) -> SessionError {
    SessionError::Transport(e.to_string())
}

pub(crate) fn negotiation<E: std::fmt::Display>(e: E) -> SessionError {
    SessionError::Negotiation(e.to_string())
}
