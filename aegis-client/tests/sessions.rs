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

//! Session-level tests on the store fallback path: the signaling URL
//! points at a closed port, so both roles negotiate through a shared
//! in-memory store exactly as they would through the server's
//! `/store/{key}` endpoints.

use aegis_client::media::{NullSink, TestPatternCamera};
use aegis_client::streamer::{StreamOptions, StreamerEvent, StreamerSession};
use aegis_client::transport::store::{MemoryStore, SignalStore};
use aegis_client::viewer::{ViewerSession, ViewerState};
use aegis_client::{ClientContext, SessionError};
use aegis_types::{answer_key, offer_key, stream_key, StreamDescriptor, StreamId};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(20);

/// Nothing listens on port 9, so the transport connect fails fast and
/// every session degrades to the store path.
fn offline_ctx() -> ClientContext {
    ClientContext::new("tester", "ws://127.0.0.1:9", "http://127.0.0.1:9")
        .with_share_base("https://aegis.example")
        .with_stun_servers(vec![])
}

#[tokio::test]
async fn emergency_fallback_negotiates_end_to_end() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = offline_ctx();
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());

    let mut streamer = StreamerSession::start(
        &ctx,
        &TestPatternCamera,
        store.clone(),
        StreamOptions::emergency("42"),
    )
    .await
    .unwrap();

    // Alert 42 must land in exactly this room, and the link must use
    // the emergency path.
    assert!(streamer.is_fallback());
    assert!(streamer.is_emergency());
    assert_eq!(streamer.room_id().as_str(), "emergency_room_emergency_42");
    assert_eq!(
        streamer.watch_url(),
        "https://aegis.example/emergency-watch/emergency_42"
    );

    let id = StreamId::for_alert("42");
    assert!(store.get(&stream_key(&id)).await.unwrap().is_some());
    assert!(store.get(&offer_key(&id)).await.unwrap().is_some());

    let viewer = ViewerSession::watch(&ctx, store.clone(), id.clone(), Arc::new(NullSink::new()))
        .await
        .unwrap();
    assert!(store.get(&answer_key(&id)).await.unwrap().is_some());

    let mut events = streamer.take_events().unwrap();
    timeout(ESTABLISH_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            if event == StreamerEvent::Negotiated {
                return;
            }
        }
        panic!("event stream ended before negotiation");
    })
    .await
    .expect("streamer never negotiated");

    let mut states = viewer.states();
    timeout(ESTABLISH_TIMEOUT, async {
        loop {
            if *states.borrow() == ViewerState::Connected {
                return;
            }
            states.changed().await.unwrap();
        }
    })
    .await
    .expect("viewer never connected");

    viewer.stop().await;
    streamer.stop().await;
}

#[tokio::test]
async fn watch_unknown_stream_is_terminal_not_found() {
    let ctx = offline_ctx();
    let store = Arc::new(MemoryStore::new());
    let started = tokio::time::Instant::now();
    let result = ViewerSession::watch(
        &ctx,
        store,
        StreamId::from_string("never-existed"),
        Arc::new(NullSink::new()),
    )
    .await;
    assert!(matches!(result, Err(SessionError::NotFound)));
    // Discovery is one read, not a polling loop.
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn watch_ended_stream_is_terminal_not_found() {
    let ctx = offline_ctx();
    let store = Arc::new(MemoryStore::new());
    let id = StreamId::from_string("old-stream");
    let mut descriptor = StreamDescriptor::new(id.clone(), false);
    descriptor.active = false;
    store
        .put(&stream_key(&id), descriptor.encode())
        .await
        .unwrap();

    let result = ViewerSession::watch(&ctx, store, id, Arc::new(NullSink::new())).await;
    assert!(matches!(result, Err(SessionError::NotFound)));
}

#[tokio::test]
async fn missing_offer_gives_up_after_the_bounded_window() {
    let ctx = offline_ctx();
    let store = Arc::new(MemoryStore::new());
    let id = StreamId::from_string("published-but-silent");
    // Descriptor exists but the streamer never wrote an offer.
    store
        .put(&stream_key(&id), StreamDescriptor::new(id.clone(), false).encode())
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let result = ViewerSession::watch(&ctx, store, id, Arc::new(NullSink::new())).await;
    assert!(matches!(result, Err(SessionError::NotFound)));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(8), "gave up too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(15), "poll window unbounded: {elapsed:?}");
}

#[tokio::test]
async fn stop_is_idempotent_and_deletes_fallback_keys() {
    let ctx = offline_ctx();
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());

    let streamer = StreamerSession::start(
        &ctx,
        &TestPatternCamera,
        store.clone(),
        StreamOptions::ad_hoc(),
    )
    .await
    .unwrap();
    let id = streamer.stream_id().clone();
    assert!(!id.is_emergency());
    assert_eq!(streamer.room_id().as_str(), id.as_str());

    streamer.stop().await;
    streamer.stop().await;
    assert!(streamer.is_stopped());

    assert!(store.get(&stream_key(&id)).await.unwrap().is_none());
    assert!(store.get(&offer_key(&id)).await.unwrap().is_none());
    assert!(store.get(&answer_key(&id)).await.unwrap().is_none());
}
