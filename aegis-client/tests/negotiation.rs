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

//! Loopback negotiation: two peer connection managers in one process,
//! candidates piped directly between them, no server and no STUN.

use aegis_client::media::{LocalMedia, NullSink, TestPatternSource};
use aegis_client::peer::{PeerConnectionManager, PeerState};
use aegis_types::IceCandidate;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(15);

/// Forward every candidate one side gathers to the other side, the way
/// the signaling channel would.
fn pipe_candidates(from: &PeerConnectionManager, to: PeerConnectionManager) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    from.on_local_candidate(move |candidate| {
        let _ = tx.send(candidate);
    });
    tokio::spawn(async move {
        while let Some(candidate) = rx.recv().await {
            to.add_remote_candidate(candidate).await;
        }
    });
}

async fn wait_for(peer: &PeerConnectionManager, wanted: PeerState) {
    let mut states = peer.states();
    timeout(ESTABLISH_TIMEOUT, async {
        loop {
            if *states.borrow() == wanted {
                return;
            }
            states
                .changed()
                .await
                .expect("state channel closed before reaching target state");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("peer never reached {wanted:?}"));
}

#[tokio::test]
async fn offer_answer_round_trip_connects_both_peers() {
    let _ = env_logger::builder().is_test(true).try_init();
    let streamer = PeerConnectionManager::new(vec![]).await.unwrap();
    let viewer = PeerConnectionManager::new(vec![]).await.unwrap();

    let media = LocalMedia::start(Box::new(TestPatternSource::new()), "loopback", None);
    streamer.attach_track(media.track()).await.unwrap();

    let sink = Arc::new(NullSink::new());
    viewer.on_track(sink.clone());

    pipe_candidates(&streamer, viewer.clone());
    pipe_candidates(&viewer, streamer.clone());

    let offer = streamer.create_offer().await.unwrap();
    let answer = viewer.accept_offer(offer).await.unwrap();
    streamer.apply_answer(answer).await.unwrap();

    wait_for(&streamer, PeerState::Connected).await;
    wait_for(&viewer, PeerState::Connected).await;

    // Media must actually flow, not just signal.
    timeout(ESTABLISH_TIMEOUT, async {
        while sink.received() == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("no media reached the viewer sink");

    media.stop();
    streamer.close().await;
    viewer.close().await;
}

/// Candidate arrival order must not matter. The streamer's candidates
/// are held back until gathering finishes, then delivered to the viewer
/// in reverse; the pair still has to connect.
#[tokio::test]
async fn reversed_candidate_delivery_still_connects() {
    let _ = env_logger::builder().is_test(true).try_init();
    let streamer = PeerConnectionManager::new(vec![]).await.unwrap();
    let viewer = PeerConnectionManager::new(vec![]).await.unwrap();

    let media = LocalMedia::start(Box::new(TestPatternSource::new()), "reversed", None);
    streamer.attach_track(media.track()).await.unwrap();
    viewer.on_track(Arc::new(NullSink::new()));

    let gathered: Arc<Mutex<Vec<IceCandidate>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let gathered = gathered.clone();
        streamer.on_local_candidate(move |candidate| {
            gathered.lock().unwrap().push(candidate);
        });
    }
    // The viewer's own candidates flow live; only the streamer's are
    // reordered.
    pipe_candidates(&viewer, streamer.clone());

    let offer = streamer.create_offer().await.unwrap();
    let answer = viewer.accept_offer(offer).await.unwrap();
    streamer.apply_answer(answer).await.unwrap();
    streamer
        .wait_ice_complete(Duration::from_secs(10))
        .await
        .unwrap();

    let mut held: Vec<IceCandidate> = {
        let mut gathered = gathered.lock().unwrap();
        gathered.drain(..).collect()
    };
    assert!(!held.is_empty(), "loopback gathering produced no candidates");
    held.reverse();
    for candidate in held {
        viewer.add_remote_candidate(candidate).await;
    }

    wait_for(&streamer, PeerState::Connected).await;
    wait_for(&viewer, PeerState::Connected).await;

    media.stop();
    streamer.close().await;
    viewer.close().await;
}

#[tokio::test]
async fn duplicate_answer_is_tolerated() {
    let streamer = PeerConnectionManager::new(vec![]).await.unwrap();
    let viewer = PeerConnectionManager::new(vec![]).await.unwrap();

    let media = LocalMedia::start(Box::new(TestPatternSource::new()), "dup", None);
    streamer.attach_track(media.track()).await.unwrap();
    viewer.on_track(Arc::new(NullSink::new()));

    pipe_candidates(&streamer, viewer.clone());
    pipe_candidates(&viewer, streamer.clone());

    let offer = streamer.create_offer().await.unwrap();
    let answer = viewer.accept_offer(offer).await.unwrap();
    streamer.apply_answer(answer.clone()).await.unwrap();
    // A re-delivered answer must be a no-op, not a failure.
    streamer.apply_answer(answer).await.unwrap();

    wait_for(&streamer, PeerState::Connected).await;

    media.stop();
    streamer.close().await;
    viewer.close().await;
}
