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

//! Fallback signaling store client.
//!
//! When the realtime channel cannot be opened, offer/answer artifacts
//! move through a shared key/value store instead (`webrtc_stream_<id>`,
//! `webrtc_offer_<id>`, `webrtc_answer_<id>`). Last write wins per key;
//! there is no ordering across keys. Sessions poll with
//! [`RetryPolicy::FALLBACK_POLL`](crate::retry::RetryPolicy) and treat an
//! empty window as terminal.

use crate::error::{transport, SessionError};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// The store the fallback path reads and writes. A trait so sessions can
/// be exercised against [`MemoryStore`] without a server.
#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn put(&self, key: &str, value: String) -> Result<(), SessionError>;
    async fn get(&self, key: &str) -> Result<Option<String>, SessionError>;
    async fn delete(&self, key: &str) -> Result<(), SessionError>;
}

/// HTTP client for the signaling server's `/store/{key}` endpoints.
pub struct HttpStoreClient {
    base: String,
    http: reqwest::Client,
}

impl HttpStoreClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpStoreClient {
            base: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, key: &str) -> String {
        format!("{}/store/{key}", self.base.trim_end_matches('/'))
    }
}

#[async_trait]
impl SignalStore for HttpStoreClient {
    async fn put(&self, key: &str, value: String) -> Result<(), SessionError> {
        let resp = self
            .http
            .put(self.url(key))
            .body(value)
            .send()
            .await
            .map_err(transport)?;
        if !resp.status().is_success() {
            return Err(SessionError::Transport(format!(
                "store put {key} returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, SessionError> {
        let resp = self.http.get(self.url(key)).send().await.map_err(transport)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(SessionError::Transport(format!(
                "store get {key} returned {}",
                resp.status()
            )));
        }
        Ok(Some(resp.text().await.map_err(transport)?))
    }

    async fn delete(&self, key: &str) -> Result<(), SessionError> {
        self.http
            .delete(self.url(key))
            .send()
            .await
            .map_err(transport)?;
        Ok(())
    }
}

/// In-process store with the same last-write-wins semantics. Used by
/// tests and single-process demos where both roles share memory.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalStore for MemoryStore {
    async fn put(&self, key: &str, value: String) -> Result<(), SessionError> {
        self.entries.lock().unwrap().insert(key.to_owned(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, SessionError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), SessionError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_last_write_wins() {
        let store = MemoryStore::new();
        store.put("k", "first".into()).await.unwrap();
        store.put("k", "second".into()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("second"));
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
