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

//! Bounded polling, in one place instead of nested timer chains.

use std::future::Future;
use std::time::Duration;

/// A fixed-interval, fixed-attempt polling policy. Dropping the returned
/// future cancels the loop; exhausting the attempts is the caller's
/// terminal-failure signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    /// The fallback signaling window: one probe per second for ten
    /// seconds, after which the stream is reported unavailable.
    pub const FALLBACK_POLL: RetryPolicy = RetryPolicy {
        max_attempts: 10,
        interval: Duration::from_secs(1),
    };

    /// Run `op` until it yields `Some`, sleeping `interval` between
    /// attempts. Returns `None` once `max_attempts` probes came up empty.
    pub async fn poll_until<T, F, Fut>(&self, mut op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        for attempt in 0..self.max_attempts {
            if let Some(value) = op().await {
                return Some(value);
            }
            if attempt + 1 < self.max_attempts {
                tokio::time::sleep(self.interval).await;
            }
        }
        None
    }
}
