//! Room registry and fan-out.
//!
//! One `SignalServer` actor owns the mapping of sessions to rooms and
//! relays each signaling message to every other member of the sender's
//! room. Rooms are plain in-process state; a session belongs to at most
//! one room at a time and re-joining moves it.

use crate::messages::{Broadcast, Connect, Disconnect, JoinRoom, RoomKey, RoomMessage, SessionId};

use actix::{Actor, Context, Handler, MessageResult, Recipient};
use aegis_types::{RoomId, SignalMessage, EMERGENCY_ROOM_PREFIX};
use log::{debug, info, trace, warn};
use std::collections::{HashMap, HashSet};

#[derive(Default)]
pub struct SignalServer {
    sessions: HashMap<SessionId, Recipient<RoomMessage>>,
    rooms: HashMap<RoomKey, HashSet<SessionId>>,
    membership: HashMap<SessionId, RoomKey>,
}

impl SignalServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn leave_room(&mut self, session: &SessionId) {
        if let Some(room) = self.membership.remove(session) {
            if let Some(members) = self.rooms.get_mut(&room) {
                members.remove(session);
                if members.is_empty() {
                    self.rooms.remove(&room);
                }
            }
        }
    }

    fn fan_out(&self, room: &RoomKey, sender: &SessionId, msg: &RoomMessage) {
        let Some(members) = self.rooms.get(room) else {
            warn!("broadcast to unknown room {room}");
            return;
        };
        for member in members {
            if member == sender {
                continue;
            }
            if let Some(recipient) = self.sessions.get(member) {
                if let Err(e) = recipient.try_send(msg.clone()) {
                    warn!("failed to relay to session {member}: {e}");
                }
            }
        }
        trace!(
            "relayed message from {sender} to {} member(s) of {room}",
            members.len().saturating_sub(1)
        );
    }
}

impl Actor for SignalServer {
    type Context = Context<Self>;
}

impl Handler<Connect> for SignalServer {
    type Result = ();

    fn handle(&mut self, Connect { id, addr }: Connect, _ctx: &mut Self::Context) -> Self::Result {
        debug!("session {id} connected");
        self.sessions.insert(id, addr);
    }
}

impl Handler<Disconnect> for SignalServer {
    type Result = ();

    fn handle(&mut self, Disconnect { session }: Disconnect, _: &mut Self::Context) -> Self::Result {
        debug!("session {session} disconnected");
        self.leave_room(&session);
        self.sessions.remove(&session);
    }
}

impl Handler<JoinRoom> for SignalServer {
    type Result = MessageResult<JoinRoom>;

    fn handle(&mut self, JoinRoom { session, room }: JoinRoom, _: &mut Self::Context) -> Self::Result {
        if !self.sessions.contains_key(&session) {
            return MessageResult(Err(format!("unknown session {session}")));
        }
        if self.membership.get(&session).map(String::as_str) == Some(room.as_str()) {
            debug!("session {session} already in room {room}");
            return MessageResult(Ok(()));
        }
        self.leave_room(&session);
        self.rooms.entry(room.clone()).or_default().insert(session.clone());
        self.membership.insert(session.clone(), room.clone());
        info!("session {session} joined room {room}");
        // Tell everyone already in the room. A streamer that published
        // its offer into an empty room re-publishes when it sees this,
        // so a viewer arriving later still gets an offer.
        let announce = RoomMessage(SignalMessage::JoinRoom {
            room_id: RoomId::from_string(room.clone()),
            emergency: room.starts_with(EMERGENCY_ROOM_PREFIX),
        });
        self.fan_out(&room, &session, &announce);
        MessageResult(Ok(()))
    }
}

impl Handler<Broadcast> for SignalServer {
    type Result = ();

    fn handle(&mut self, Broadcast { session, room, msg }: Broadcast, _: &mut Self::Context) {
        self.fan_out(&room, &session, &RoomMessage(msg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_types::{SignalMessage, StreamId};
    use std::sync::{Arc, Mutex};

    struct Collector {
        inbox: Arc<Mutex<Vec<SignalMessage>>>,
    }

    impl Actor for Collector {
        type Context = Context<Self>;
    }

    impl Handler<RoomMessage> for Collector {
        type Result = ();

        fn handle(&mut self, msg: RoomMessage, _: &mut Self::Context) {
            self.inbox.lock().unwrap().push(msg.0);
        }
    }

    fn spawn_collector() -> (Recipient<RoomMessage>, Arc<Mutex<Vec<SignalMessage>>>) {
        let inbox = Arc::new(Mutex::new(Vec::new()));
        let addr = Collector {
            inbox: inbox.clone(),
        }
        .start();
        (addr.recipient(), inbox)
    }

    #[actix_rt::test]
    async fn broadcast_reaches_other_members_not_sender() {
        let server = SignalServer::new().start();
        let (streamer, streamer_inbox) = spawn_collector();
        let (viewer, viewer_inbox) = spawn_collector();

        server
            .send(Connect {
                id: "streamer".into(),
                addr: streamer,
            })
            .await
            .unwrap();
        server
            .send(Connect {
                id: "viewer".into(),
                addr: viewer,
            })
            .await
            .unwrap();
        server
            .send(JoinRoom {
                session: "streamer".into(),
                room: "emergency_room_emergency_42".into(),
            })
            .await
            .unwrap()
            .unwrap();
        server
            .send(JoinRoom {
                session: "viewer".into(),
                room: "emergency_room_emergency_42".into(),
            })
            .await
            .unwrap()
            .unwrap();

        let offer = SignalMessage::Offer {
            stream_id: StreamId::for_alert("42"),
            sdp: "v=0".into(),
        };
        server
            .send(Broadcast {
                session: "streamer".into(),
                room: "emergency_room_emergency_42".into(),
                msg: offer.clone(),
            })
            .await
            .unwrap();

        // Let the collector actor drain its mailbox.
        actix_rt::task::yield_now().await;

        assert_eq!(viewer_inbox.lock().unwrap().as_slice(), &[offer]);
        // The streamer saw the viewer's join announcement but never its
        // own broadcast back.
        assert_eq!(
            streamer_inbox.lock().unwrap().as_slice(),
            &[SignalMessage::JoinRoom {
                room_id: RoomId::from_string("emergency_room_emergency_42"),
                emergency: true,
            }]
        );
    }

    #[actix_rt::test]
    async fn join_is_announced_to_existing_members() {
        let server = SignalServer::new().start();
        let (streamer, streamer_inbox) = spawn_collector();
        let (viewer, viewer_inbox) = spawn_collector();

        server
            .send(Connect {
                id: "streamer".into(),
                addr: streamer,
            })
            .await
            .unwrap();
        server
            .send(Connect {
                id: "viewer".into(),
                addr: viewer,
            })
            .await
            .unwrap();
        server
            .send(JoinRoom {
                session: "streamer".into(),
                room: "emergency_room_emergency_7".into(),
            })
            .await
            .unwrap()
            .unwrap();
        // The room was empty, so the first join announces to nobody.
        actix_rt::task::yield_now().await;
        assert!(streamer_inbox.lock().unwrap().is_empty());

        server
            .send(JoinRoom {
                session: "viewer".into(),
                room: "emergency_room_emergency_7".into(),
            })
            .await
            .unwrap()
            .unwrap();
        actix_rt::task::yield_now().await;

        assert_eq!(
            streamer_inbox.lock().unwrap().as_slice(),
            &[SignalMessage::JoinRoom {
                room_id: RoomId::from_string("emergency_room_emergency_7"),
                emergency: true,
            }]
        );
        // The joiner itself hears nothing.
        assert!(viewer_inbox.lock().unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn rejoining_the_same_room_is_not_reannounced() {
        let server = SignalServer::new().start();
        let (streamer, streamer_inbox) = spawn_collector();
        let (viewer, _) = spawn_collector();

        server
            .send(Connect {
                id: "streamer".into(),
                addr: streamer,
            })
            .await
            .unwrap();
        server
            .send(Connect {
                id: "viewer".into(),
                addr: viewer,
            })
            .await
            .unwrap();
        for _ in 0..2 {
            server
                .send(JoinRoom {
                    session: "streamer".into(),
                    room: "room1".into(),
                })
                .await
                .unwrap()
                .unwrap();
        }
        // The viewer joins via the URL path and again via the explicit
        // join message; the streamer must see exactly one announcement.
        for _ in 0..2 {
            server
                .send(JoinRoom {
                    session: "viewer".into(),
                    room: "room1".into(),
                })
                .await
                .unwrap()
                .unwrap();
        }
        actix_rt::task::yield_now().await;

        assert_eq!(streamer_inbox.lock().unwrap().len(), 1);
    }

    #[actix_rt::test]
    async fn join_requires_connected_session() {
        let server = SignalServer::new().start();
        let res = server
            .send(JoinRoom {
                session: "ghost".into(),
                room: "r".into(),
            })
            .await
            .unwrap();
        assert!(res.is_err());
    }

    #[actix_rt::test]
    async fn rejoin_moves_session_between_rooms() {
        let server = SignalServer::new().start();
        let (a, _) = spawn_collector();
        let (b, b_inbox) = spawn_collector();

        server.send(Connect { id: "a".into(), addr: a }).await.unwrap();
        server.send(Connect { id: "b".into(), addr: b }).await.unwrap();
        for (session, room) in [("a", "room1"), ("b", "room1"), ("b", "room2")] {
            server
                .send(JoinRoom {
                    session: session.into(),
                    room: room.into(),
                })
                .await
                .unwrap()
                .unwrap();
        }

        server
            .send(Broadcast {
                session: "a".into(),
                room: "room1".into(),
                msg: SignalMessage::StreamEnded {
                    stream_id: StreamId::from_string("s"),
                },
            })
            .await
            .unwrap();
        actix_rt::task::yield_now().await;

        // b moved to room2, so it must not see room1 traffic.
        assert!(b_inbox.lock().unwrap().is_empty());
    }
}
