//! Actix messages exchanged between websocket sessions and the
//! [`SignalServer`](crate::actors::signal_server::SignalServer).

use actix::prelude::{Message, Recipient};
use aegis_types::SignalMessage;

pub type SessionId = String;
pub type RoomKey = String;

/// Delivered to a session actor when another room member signals.
#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub struct RoomMessage(pub SignalMessage);

#[derive(Message)]
#[rtype(result = "()")]
pub struct Connect {
    pub id: SessionId,
    pub addr: Recipient<RoomMessage>,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Disconnect {
    pub session: SessionId,
}

#[derive(Message)]
#[rtype(result = "Result<(), String>")]
pub struct JoinRoom {
    pub session: SessionId,
    pub room: RoomKey,
}

/// A decoded signaling message to fan out to every other room member.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Broadcast {
    pub session: SessionId,
    pub room: RoomKey,
    pub msg: SignalMessage,
}
