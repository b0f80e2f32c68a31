use crate::actors::signal_server::SignalServer;
use actix::Addr;

pub struct AppState {
    pub signal: Addr<SignalServer>,
}
