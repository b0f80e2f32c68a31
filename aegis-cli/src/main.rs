use clap::Parser;
mod cli_args;

use aegis_client::{
    AlertSink, ClientContext, Contact, ContactMessenger, EmergencyRecord, HttpStoreClient,
    Location, LocationProvider, MemoryStore, NullSink, SignalStore, StreamOptions,
    StreamerSession, TestPatternCamera, TriggerCoordinator, TriggerKind, ViewerSession,
    ViewerState,
};
use aegis_types::StreamId;
use anyhow::anyhow;
use async_trait::async_trait;
use cli_args::{Connection, Mode, Opt, TriggerMode};
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter, warn};

fn build_context(connection: &Connection) -> ClientContext {
    let mut ctx = ClientContext::new(
        &connection.user_id,
        &connection.signaling_url,
        &connection.store_url,
    );
    if let Some(base) = &connection.share_base {
        ctx = ctx.with_share_base(base);
    }
    if let Some(url) = &connection.upload_url {
        ctx = ctx.with_upload_url(url);
    }
    ctx
}

/// The CLI has no GPS; the coordinator records the unknown sentinel
/// unless coordinates were passed on the command line.
struct CliLocation(Option<Location>);

#[async_trait]
impl LocationProvider for CliLocation {
    async fn current(&self) -> anyhow::Result<Location> {
        self.0.ok_or_else(|| anyhow!("no location source on this device"))
    }
}

/// "Delivers" the deep link by printing it; stands in for SMS/push.
struct ConsoleMessenger;

#[async_trait]
impl ContactMessenger for ConsoleMessenger {
    async fn send_deep_link(
        &self,
        contact: &Contact,
        link: Option<&str>,
        location: Location,
    ) -> anyhow::Result<()> {
        match link {
            Some(link) => info!("-> {}: watch now at {link}", contact.display_name),
            None => info!("-> {}: emergency raised (no live stream)", contact.display_name),
        }
        if location.known {
            info!("   last known position {:.5}, {:.5}", location.latitude, location.longitude);
        }
        Ok(())
    }
}

/// Alert ids from the wall clock; a real deployment persists through
/// its backend here.
struct LocalAlerts;

#[async_trait]
impl AlertSink for LocalAlerts {
    async fn create_alert(&self, record: &EmergencyRecord) -> anyhow::Result<String> {
        Ok(record.triggered_at_ms.to_string())
    }
}

async fn run_stream(
    ctx: &ClientContext,
    store: Arc<dyn SignalStore>,
    args: cli_args::StreamArgs,
) -> anyhow::Result<()> {
    let mut options = StreamOptions::ad_hoc();
    options.recording_dir = args.record_dir;
    let mut session = StreamerSession::start(ctx, &TestPatternCamera, store, options).await?;
    info!("streaming as {}", session.stream_id());
    info!("share this link: {}", session.watch_url());

    let mut events = session
        .take_events()
        .ok_or_else(|| anyhow!("event stream already taken"))?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => info!("{event:?}"),
                None => break,
            },
        }
    }
    info!("stopping stream");
    session.stop().await;
    Ok(())
}

async fn run_watch(
    ctx: &ClientContext,
    store: Arc<dyn SignalStore>,
    args: cli_args::WatchArgs,
) -> anyhow::Result<()> {
    let sink = Arc::new(NullSink::new());
    let session = ViewerSession::watch(
        ctx,
        store,
        StreamId::from_string(args.stream_id),
        sink.clone(),
    )
    .await?;
    info!("watching {}", session.stream_id());

    let mut states = session.states();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow().clone();
                info!("{state:?} ({} samples received)", sink.received());
                if state.is_terminal() {
                    if let ViewerState::Failed(reason) = state {
                        warn!("{reason}");
                    }
                    break;
                }
            }
        }
    }
    session.stop().await;
    Ok(())
}

async fn run_trigger(
    ctx: &ClientContext,
    store: Arc<dyn SignalStore>,
    args: cli_args::TriggerArgs,
) -> anyhow::Result<()> {
    let kind = match args.kind {
        TriggerMode::Manual { held_for_ms } => TriggerKind::ManualHold { held_for_ms },
        TriggerMode::Voice { keyword } => TriggerKind::VoiceKeyword { keyword },
        TriggerMode::Shake { magnitude } => TriggerKind::Shake { magnitude },
        TriggerMode::Watch { device_id } => TriggerKind::Watch { device_id },
    };
    let location = match (args.lat, args.lon) {
        (Some(lat), Some(lon)) => Some(Location::new(lat, lon)),
        _ => None,
    };
    let contacts = args
        .contacts
        .iter()
        .map(|name| Contact {
            id: name.clone(),
            display_name: name.clone(),
        })
        .collect();

    let coordinator = TriggerCoordinator::new(
        ctx.clone(),
        store,
        Arc::new(TestPatternCamera),
        Arc::new(CliLocation(location)),
        Arc::new(ConsoleMessenger),
        Arc::new(LocalAlerts),
        contacts,
    );

    let outcome = coordinator.trigger(kind).await?;
    info!("alert {} raised, {} contact(s) notified", outcome.alert_id, outcome.notified);
    if let Some(reason) = &outcome.notify_error {
        warn!("{reason}");
    }
    match outcome.session {
        Some(session) => {
            info!("emergency stream live: {}", session.watch_url());
            tokio::signal::ctrl_c().await?;
            session.stop().await;
        }
        None => warn!("no live stream; alert and notifications only"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .finish(),
    )?;

    let opt = Opt::parse();
    let ctx = build_context(&opt.connection);
    let store: Arc<dyn SignalStore> = if opt.connection.store_url.is_empty() {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(HttpStoreClient::new(&opt.connection.store_url))
    };

    match opt.mode {
        Mode::Stream(args) => run_stream(&ctx, store, args).await,
        Mode::Watch(args) => run_watch(&ctx, store, args).await,
        Mode::Trigger(args) => run_trigger(&ctx, store, args).await,
    }
}
