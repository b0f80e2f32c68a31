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

//! Emergency trigger coordination.
//!
//! Every trigger source (hold gesture, voice keyword, shake, paired
//! watch) funnels into one pipeline: normalize the trigger, create the
//! alert, start the emergency stream, notify contacts. The pipeline is
//! deliberately forgiving — a missing location or an undeliverable
//! contact must never stop an emergency from going out.

use crate::error::SessionError;
use crate::media::MediaDevices;
use crate::streamer::{StreamOptions, StreamerSession};
use crate::transport::store::SignalStore;
use crate::ClientContext;

use anyhow::Result;
use async_trait::async_trait;
use log::{error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// How the emergency was raised, with the evidence that raised it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerKind {
    /// The SOS button held to completion.
    ManualHold { held_for_ms: u64 },
    /// A configured keyword heard by the always-on listener.
    VoiceKeyword { keyword: String },
    /// Accelerometer shake pattern.
    Shake { magnitude: f32 },
    /// Relayed from a paired watch.
    Watch { device_id: String },
}

/// A best-effort position fix. [`Location::UNKNOWN`] is the documented
/// sentinel used when the provider fails; downstream consumers must
/// treat it as "no fix", not as coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub known: bool,
}

impl Location {
    pub const UNKNOWN: Location = Location {
        latitude: 0.0,
        longitude: 0.0,
        known: false,
    };

    pub fn new(latitude: f64, longitude: f64) -> Self {
        Location {
            latitude,
            longitude,
            known: true,
        }
    }
}

/// The normalized artifact persisted for every trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencyRecord {
    pub kind: TriggerKind,
    pub location: Location,
    pub triggered_at_ms: u64,
}

/// Someone on the user's emergency contact list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: String,
    pub display_name: String,
}

/// Position source. Failure falls back to [`Location::UNKNOWN`] and
/// never aborts a trigger.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current(&self) -> Result<Location>;
}

/// Delivers the watch link to one contact. Fire-and-forget from the
/// coordinator's point of view.
#[async_trait]
pub trait ContactMessenger: Send + Sync {
    async fn send_deep_link(
        &self,
        contact: &Contact,
        link: Option<&str>,
        location: Location,
    ) -> Result<()>;
}

/// External alert persistence. Returns the alert id the stream id is
/// derived from.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn create_alert(&self, record: &EmergencyRecord) -> Result<String>;
}

/// Everything `trigger` managed to set up. The session stays alive for
/// the caller to own; `notify_error` is set only when every contact
/// notification failed.
pub struct TriggerOutcome {
    pub alert_id: String,
    pub session: Option<StreamerSession>,
    pub watch_url: Option<String>,
    pub notified: usize,
    pub notify_error: Option<String>,
}

/// Runs the trigger pipeline. Holds the collaborators so trigger
/// sources only need a `TriggerKind`.
pub struct TriggerCoordinator {
    ctx: ClientContext,
    store: Arc<dyn SignalStore>,
    devices: Arc<dyn MediaDevices>,
    location: Arc<dyn LocationProvider>,
    messenger: Arc<dyn ContactMessenger>,
    alerts: Arc<dyn AlertSink>,
    contacts: Vec<Contact>,
}

impl TriggerCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: ClientContext,
        store: Arc<dyn SignalStore>,
        devices: Arc<dyn MediaDevices>,
        location: Arc<dyn LocationProvider>,
        messenger: Arc<dyn ContactMessenger>,
        alerts: Arc<dyn AlertSink>,
        contacts: Vec<Contact>,
    ) -> Self {
        TriggerCoordinator {
            ctx,
            store,
            devices,
            location,
            messenger,
            alerts,
            contacts,
        }
    }

    /// Run the full pipeline for one trigger.
    ///
    /// A media-permission failure still notifies contacts, just without
    /// a live link. Any other stream-start failure is propagated after
    /// the alert exists.
    pub async fn trigger(&self, kind: TriggerKind) -> Result<TriggerOutcome> {
        let location = match self.location.current().await {
            Ok(location) => location,
            Err(e) => {
                warn!("location unavailable, recording unknown position: {e}");
                Location::UNKNOWN
            }
        };
        let record = EmergencyRecord {
            kind,
            location,
            triggered_at_ms: unix_millis(),
        };
        let alert_id = self.alerts.create_alert(&record).await?;
        info!("alert {alert_id} created ({:?})", record.kind);

        let (session, watch_url) = match StreamerSession::start(
            &self.ctx,
            self.devices.as_ref(),
            self.store.clone(),
            StreamOptions::emergency(&alert_id),
        )
        .await
        {
            Ok(session) => {
                let url = session.watch_url();
                (Some(session), Some(url))
            }
            Err(SessionError::PermissionDenied(reason)) => {
                error!("emergency stream blocked ({reason}), notifying without a link");
                (None, None)
            }
            Err(e) => return Err(e.into()),
        };

        let (notified, notify_error) = self
            .notify_contacts(watch_url.as_deref(), location)
            .await;

        Ok(TriggerOutcome {
            alert_id,
            session,
            watch_url,
            notified,
            notify_error,
        })
    }

    /// Message every contact independently. A single failure is logged;
    /// only all of them failing surfaces an error.
    async fn notify_contacts(
        &self,
        link: Option<&str>,
        location: Location,
    ) -> (usize, Option<String>) {
        let mut notified = 0;
        for contact in &self.contacts {
            match self.messenger.send_deep_link(contact, link, location).await {
                Ok(()) => notified += 1,
                Err(e) => warn!("contact {} unreachable: {e}", contact.id),
            }
        }
        let notify_error = if !self.contacts.is_empty() && notified == 0 {
            let msg = "no emergency contact could be reached".to_string();
            error!("{msg}");
            Some(msg)
        } else {
            None
        };
        (notified, notify_error)
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
