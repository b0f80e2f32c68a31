mod actors;
mod constants;
mod messages;
mod models;
mod store;

use actix_cors::Cors;
use actix_web::{get, web, App, HttpRequest, HttpResponse, HttpServer, Responder};
use actix_web_actors::ws;
use log::info;

use crate::actors::{signal_server::SignalServer, ws_session::WsSession};
use crate::models::AppState;
use crate::store::{delete_key, get_key, put_key, FallbackStore};
use actix::Actor;

#[get("/ws/{user}/{room}")]
async fn ws_connect(
    path: web::Path<(String, String)>,
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> impl Responder {
    let (user, room) = path.into_inner();
    info!("websocket upgrade for user {user} room {room}");
    let session = WsSession::new(state.signal.clone(), room, user);
    ws::start(session, &req, stream)
}

#[get("/healthz")]
async fn healthz() -> impl Responder {
    HttpResponse::Ok().body("ok")
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let port: u16 = std::env::var("AEGIS_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8090);
    info!("signaling server listening on 0.0.0.0:{port}");

    let signal = SignalServer::new().start();
    let store = web::Data::new(FallbackStore::default());

    HttpServer::new(move || {
        let cors = Cors::permissive();
        App::new()
            .app_data(web::Data::new(AppState {
                signal: signal.clone(),
            }))
            .app_data(store.clone())
            .wrap(cors)
            .service(healthz)
            .service(ws_connect)
            .service(
                web::resource("/store/{key}")
                    .route(web::put().to(put_key))
                    .route(web::get().to(get_key))
                    .route(web::delete().to(delete_key)),
            )
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
