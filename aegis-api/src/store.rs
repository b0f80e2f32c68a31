//! Fallback signaling store.
//!
//! When a client cannot open the realtime channel it degrades to writing
//! and polling plain keys (`webrtc_stream_<id>`, `webrtc_offer_<id>`,
//! `webrtc_answer_<id>`). Semantics are last-write-wins per key with no
//! ordering guarantee; the owning streamer deletes its keys on stop and
//! anything left behind is swept after a TTL.

use crate::constants::STORE_ENTRY_TTL;

use actix_web::{web, HttpResponse};
use log::debug;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry {
    value: String,
    written_at: Instant,
}

pub struct FallbackStore {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
}

impl Default for FallbackStore {
    fn default() -> Self {
        Self::with_ttl(STORE_ENTRY_TTL)
    }
}

impl FallbackStore {
    pub fn with_ttl(ttl: Duration) -> Self {
        FallbackStore {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn put(&self, key: String, value: String) {
        let mut entries = self.entries.lock().unwrap();
        let ttl = self.ttl;
        entries.retain(|_, e| e.written_at.elapsed() < ttl);
        entries.insert(
            key,
            Entry {
                value,
                written_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(key)
            .filter(|e| e.written_at.elapsed() < self.ttl)
            .map(|e| e.value.clone())
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.lock().unwrap().remove(key).is_some()
    }
}

pub async fn put_key(
    store: web::Data<FallbackStore>,
    key: web::Path<String>,
    body: web::Bytes,
) -> HttpResponse {
    let key = key.into_inner();
    match String::from_utf8(body.to_vec()) {
        Ok(value) => {
            debug!("store put {key} ({} bytes)", value.len());
            store.put(key, value);
            HttpResponse::NoContent().finish()
        }
        Err(_) => HttpResponse::BadRequest().body("value must be utf-8"),
    }
}

pub async fn get_key(store: web::Data<FallbackStore>, key: web::Path<String>) -> HttpResponse {
    match store.get(&key.into_inner()) {
        Some(value) => HttpResponse::Ok().content_type("text/plain").body(value),
        None => HttpResponse::NotFound().finish(),
    }
}

pub async fn delete_key(store: web::Data<FallbackStore>, key: web::Path<String>) -> HttpResponse {
    store.delete(&key.into_inner());
    HttpResponse::NoContent().finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};

    fn app_store(ttl: Duration) -> web::Data<FallbackStore> {
        web::Data::new(FallbackStore::with_ttl(ttl))
    }

    #[actix_web::test]
    async fn put_get_delete_round_trip() {
        let store = app_store(STORE_ENTRY_TTL);
        let app = test::init_service(
            App::new().app_data(store).service(
                web::resource("/store/{key}")
                    .route(web::put().to(put_key))
                    .route(web::get().to(get_key))
                    .route(web::delete().to(delete_key)),
            ),
        )
        .await;

        let put = test::TestRequest::put()
            .uri("/store/webrtc_offer_emergency_42")
            .set_payload("v=0\r\no=- 0 0 IN IP4 127.0.0.1")
            .to_request();
        assert!(test::call_service(&app, put).await.status().is_success());

        let get = test::TestRequest::get()
            .uri("/store/webrtc_offer_emergency_42")
            .to_request();
        let body = test::call_and_read_body(&app, get).await;
        assert!(body.starts_with(b"v=0"));

        let del = test::TestRequest::delete()
            .uri("/store/webrtc_offer_emergency_42")
            .to_request();
        assert!(test::call_service(&app, del).await.status().is_success());

        let get = test::TestRequest::get()
            .uri("/store/webrtc_offer_emergency_42")
            .to_request();
        assert_eq!(test::call_service(&app, get).await.status(), 404);
    }

    #[actix_web::test]
    async fn missing_key_is_not_found() {
        let store = FallbackStore::default();
        assert_eq!(store.get("webrtc_answer_nope"), None);
    }

    #[actix_web::test]
    async fn last_write_wins() {
        let store = FallbackStore::default();
        store.put("k".into(), "first".into());
        store.put("k".into(), "second".into());
        assert_eq!(store.get("k").as_deref(), Some("second"));
    }

    #[actix_web::test]
    async fn expired_entries_are_invisible() {
        let store = FallbackStore::with_ttl(Duration::from_millis(0));
        store.put("k".into(), "v".into());
        assert_eq!(store.get("k"), None);
    }
}
