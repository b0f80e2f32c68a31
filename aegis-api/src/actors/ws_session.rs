//! One actor per websocket connection.
//!
//! Inbound text frames are decoded into [`SignalMessage`] right here at
//! the boundary; frames that do not parse are logged and dropped so a
//! malformed client can never poison a room. `join_room` is handled
//! locally, everything else is relayed to the room via the
//! [`SignalServer`].

use crate::actors::signal_server::SignalServer;
use crate::constants::{CLIENT_TIMEOUT, HEARTBEAT_INTERVAL};
use crate::messages::{Broadcast, Connect, Disconnect, JoinRoom, RoomMessage};

use actix::{
    fut, Actor, ActorContext, ActorFutureExt, Addr, AsyncContext, ContextFutureSpawner, Handler,
    Running, StreamHandler, WrapFuture,
};
use actix_web_actors::ws::{self, WebsocketContext};
use aegis_types::SignalMessage;
use log::{debug, error, info, warn};
use std::time::Instant;
use uuid::Uuid;

pub struct WsSession {
    pub id: String,
    pub room: String,
    pub user: String,
    pub addr: Addr<SignalServer>,
    heartbeat: Instant,
}

impl WsSession {
    pub fn new(addr: Addr<SignalServer>, room: String, user: String) -> Self {
        WsSession {
            id: Uuid::new_v4().to_string(),
            room,
            user,
            addr,
            heartbeat: Instant::now(),
        }
    }

    fn heartbeat(&self, ctx: &mut WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.heartbeat) > CLIENT_TIMEOUT {
                warn!("heartbeat timeout, dropping session {}", act.id);
                act.addr.do_send(Disconnect {
                    session: act.id.clone(),
                });
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn join(&self, room: String, ctx: &mut WebsocketContext<Self>) {
        self.addr
            .send(JoinRoom {
                session: self.id.clone(),
                room: room.clone(),
            })
            .into_actor(self)
            .then(move |response, act, ctx| {
                match response {
                    Ok(Ok(())) => act.room = room,
                    Ok(Err(e)) => error!("join failed: {e}"),
                    Err(e) => {
                        error!("signal server unreachable: {e}");
                        ctx.stop();
                    }
                }
                fut::ready(())
            })
            .wait(ctx);
    }

    fn handle_frame(&mut self, raw: &str, ctx: &mut WebsocketContext<Self>) {
        let msg = match SignalMessage::decode(raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("session {}: rejected malformed frame: {e}", self.id);
                return;
            }
        };
        match msg {
            SignalMessage::JoinRoom { room_id, emergency } => {
                debug!(
                    "session {} ({}) joining {room_id} (emergency: {emergency})",
                    self.id, self.user
                );
                self.join(room_id.as_str().to_owned(), ctx);
            }
            other => self.addr.do_send(Broadcast {
                session: self.id.clone(),
                room: self.room.clone(),
                msg: other,
            }),
        }
    }
}

impl Actor for WsSession {
    type Context = WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("session {} opened by {} for room {}", self.id, self.user, self.room);
        self.heartbeat(ctx);
        let addr = ctx.address();
        self.addr
            .send(Connect {
                id: self.id.clone(),
                addr: addr.recipient(),
            })
            .into_actor(self)
            .then(|res, _act, ctx| {
                if let Err(e) = res {
                    error!("connect failed: {e}");
                    ctx.stop();
                }
                fut::ready(())
            })
            .wait(ctx);
        self.join(self.room.clone(), ctx);
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        self.addr.do_send(Disconnect {
            session: self.id.clone(),
        });
        Running::Stop
    }
}

impl Handler<RoomMessage> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: RoomMessage, ctx: &mut Self::Context) -> Self::Result {
        ctx.text(msg.0.encode());
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match item {
            Ok(msg) => msg,
            Err(e) => {
                error!("websocket protocol error: {e}");
                ctx.stop();
                return;
            }
        };
        match msg {
            ws::Message::Text(raw) => self.handle_frame(&raw, ctx),
            ws::Message::Ping(payload) => {
                self.heartbeat = Instant::now();
                ctx.pong(&payload);
            }
            ws::Message::Pong(_) => {
                self.heartbeat = Instant::now();
            }
            ws::Message::Close(reason) => {
                debug!("session {} closed by peer", self.id);
                ctx.close(reason);
                ctx.stop();
            }
            _ => (),
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        ctx.stop()
    }
}
