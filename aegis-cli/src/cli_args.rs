use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Aegis CLI
///
/// Streams to, watches, or triggers an emergency stream against an
/// aegis signaling server.
#[derive(Parser, Debug)]
#[clap(name = "aegis")]
pub struct Opt {
    #[clap(flatten)]
    pub connection: Connection,

    #[clap(subcommand)]
    pub mode: Mode,
}

#[derive(Args, Debug, Clone)]
pub struct Connection {
    /// Base URL of the realtime signaling channel.
    #[clap(long, default_value = "ws://localhost:8090")]
    pub signaling_url: String,

    /// Base URL of the fallback store (the same server by default).
    #[clap(long, default_value = "http://localhost:8090")]
    pub store_url: String,

    #[clap(long = "user-id", default_value = "aegis-cli")]
    pub user_id: String,

    /// Base URL printed watch links are built on. Defaults to the
    /// store URL.
    #[clap(long)]
    pub share_base: Option<String>,

    /// Where finished recordings are posted.
    #[clap(long)]
    pub upload_url: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Start an ad hoc stream and print its watch link.
    Stream(StreamArgs),

    /// Watch a running stream by id.
    Watch(WatchArgs),

    /// Raise an emergency: alert, stream, contact notification.
    Trigger(TriggerArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StreamArgs {
    /// Directory for backup recording segments. Omit to disable
    /// recording.
    #[clap(long)]
    pub record_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct WatchArgs {
    /// The stream id from the watch link.
    pub stream_id: String,
}

#[derive(Args, Debug, Clone)]
pub struct TriggerArgs {
    /// Emergency contact to notify; repeat for several.
    #[clap(long = "contact")]
    pub contacts: Vec<String>,

    /// Latitude to attach to the alert.
    #[clap(long, requires = "lon")]
    pub lat: Option<f64>,

    /// Longitude to attach to the alert.
    #[clap(long, requires = "lat")]
    pub lon: Option<f64>,

    #[clap(subcommand)]
    pub kind: TriggerMode,
}

#[derive(Subcommand, Debug, Clone)]
pub enum TriggerMode {
    /// SOS button held to completion.
    Manual {
        #[clap(long, default_value_t = 3000)]
        held_for_ms: u64,
    },
    /// Voice keyword heard.
    Voice { keyword: String },
    /// Shake gesture detected.
    Shake {
        #[clap(long, default_value_t = 2.0)]
        magnitude: f32,
    },
    /// Relayed from a paired watch.
    Watch { device_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Opt::command().debug_assert();
    }

    #[test]
    fn trigger_voice_parses() {
        let opt = Opt::parse_from([
            "aegis",
            "trigger",
            "--contact",
            "ana",
            "--contact",
            "teo",
            "voice",
            "mayday",
        ]);
        match opt.mode {
            Mode::Trigger(args) => {
                assert_eq!(args.contacts, vec!["ana", "teo"]);
                assert!(matches!(args.kind, TriggerMode::Voice { ref keyword } if keyword == "mayday"));
            }
            other => panic!("unexpected mode {other:?}"),
        }
    }

    #[test]
    fn watch_takes_a_stream_id() {
        let opt = Opt::parse_from(["aegis", "watch", "emergency_42"]);
        match opt.mode {
            Mode::Watch(args) => assert_eq!(args.stream_id, "emergency_42"),
            other => panic!("unexpected mode {other:?}"),
        }
    }
}
