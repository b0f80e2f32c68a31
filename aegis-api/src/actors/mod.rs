pub mod signal_server;
pub mod ws_session;
