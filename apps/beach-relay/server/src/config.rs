use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use beach_relay_core::RtpCodecCapability;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use crate::{
    coordinator::TransportSettings,
    engine::{
        local::{LocalEngineConfig, MAX_ROUTER_CODECS},
        ListenIp,
    },
};

#[derive(Debug, Parser)]
#[command(
    name = "beach-relay-server",
    author,
    version,
    about = "Beach media relay session coordinator"
)]
pub struct Cli {
    #[command(flatten)]
    pub serve: ServeArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect to a running relay, join a room and print the router capabilities.
    Probe(ProbeArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address the signaling websocket listens on.
    #[arg(long, env = "BEACH_RELAY_LISTEN_ADDR", default_value = "127.0.0.1:3000")]
    pub listen_addr: String,

    /// Local address RTC transports bind to.
    #[arg(long, env = "BEACH_RELAY_RTC_LISTEN_IP", default_value = "127.0.0.1")]
    pub rtc_listen_ip: String,

    /// Address advertised in ICE candidates when it differs from the bind address.
    #[arg(long, env = "BEACH_RELAY_ANNOUNCED_IP")]
    pub announced_ip: Option<String>,

    #[arg(long, env = "BEACH_RELAY_RTC_MIN_PORT", default_value_t = 10000)]
    pub rtc_min_port: u16,

    #[arg(long, env = "BEACH_RELAY_RTC_MAX_PORT", default_value_t = 10100)]
    pub rtc_max_port: u16,

    /// Disable UDP candidates entirely.
    #[arg(long, env = "BEACH_RELAY_DISABLE_UDP", default_value_t = false)]
    pub disable_udp: bool,

    /// Disable TCP candidates unless a client forces TCP.
    #[arg(long, env = "BEACH_RELAY_DISABLE_TCP", default_value_t = false)]
    pub disable_tcp: bool,

    #[arg(long, env = "BEACH_RELAY_MAX_INCOMING_BITRATE", default_value_t = 1_500_000)]
    pub max_incoming_bitrate: u32,

    #[arg(
        long,
        env = "BEACH_RELAY_INITIAL_OUTGOING_BITRATE",
        default_value_t = 1_000_000
    )]
    pub initial_outgoing_bitrate: u32,

    /// JSON file with the router's media codecs; defaults to opus + VP8.
    #[arg(long, env = "BEACH_RELAY_MEDIA_CODECS")]
    pub media_codecs: Option<PathBuf>,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,

    /// How long to wait before exiting once the media worker has died.
    #[arg(long, env = "BEACH_RELAY_WORKER_EXIT_DELAY_MS", default_value_t = 2000)]
    pub worker_exit_delay_ms: u64,
}

#[derive(Debug, Args)]
pub struct ProbeArgs {
    /// Relay websocket URL, e.g. ws://127.0.0.1:3000/ws/lobby
    #[arg(long, default_value = "ws://127.0.0.1:3000/ws")]
    pub url: String,

    #[arg(long, default_value_t = 10)]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub engine: LocalEngineConfig,
    pub transport: TransportSettings,
    pub media_codecs: Vec<RtpCodecCapability>,
    pub shutdown_grace: Duration,
    pub worker_exit_delay: Duration,
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        let rtc_ip: IpAddr = args
            .rtc_listen_ip
            .parse()
            .with_context(|| format!("invalid RTC listen ip: {}", args.rtc_listen_ip))?;
        if args.rtc_min_port > args.rtc_max_port {
            bail!(
                "RTC port range is empty: {}..={}",
                args.rtc_min_port,
                args.rtc_max_port
            );
        }
        if args.disable_udp && args.disable_tcp {
            bail!("at least one of UDP or TCP must stay enabled");
        }
        let media_codecs = match &args.media_codecs {
            Some(path) => load_media_codecs(path)?,
            None => default_media_codecs(),
        };

        Ok(ServerConfig {
            listen_addr,
            engine: LocalEngineConfig {
                rtc_min_port: args.rtc_min_port,
                rtc_max_port: args.rtc_max_port,
            },
            transport: TransportSettings {
                listen_ips: vec![ListenIp {
                    ip: rtc_ip,
                    announced_ip: args.announced_ip.filter(|ip| !ip.is_empty()),
                }],
                enable_udp: !args.disable_udp,
                enable_tcp: !args.disable_tcp,
                prefer_udp: !args.disable_udp,
                initial_available_outgoing_bitrate: args.initial_outgoing_bitrate,
                max_incoming_bitrate: args.max_incoming_bitrate,
            },
            media_codecs,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
            worker_exit_delay: Duration::from_millis(args.worker_exit_delay_ms),
        })
    }
}

/// Router codec list used when no file is configured.
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability::audio("audio/opus", 48000, 2),
        RtpCodecCapability::video("video/VP8", 90000).with_parameter("x-google-start-bitrate", 1000),
    ]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaCodecsFile {
    media_codecs: Vec<RtpCodecCapability>,
}

fn load_media_codecs(path: &Path) -> Result<Vec<RtpCodecCapability>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read media codecs from {}", path.display()))?;
    parse_media_codecs(&raw)
        .with_context(|| format!("invalid media codecs file {}", path.display()))
}

fn parse_media_codecs(raw: &str) -> Result<Vec<RtpCodecCapability>> {
    let file: MediaCodecsFile = serde_json::from_str(raw)?;
    if file.media_codecs.is_empty() {
        bail!("mediaCodecs must not be empty");
    }
    if file.media_codecs.len() > MAX_ROUTER_CODECS {
        bail!(
            "mediaCodecs lists {} codecs, at most {} fit the dynamic payload type range",
            file.media_codecs.len(),
            MAX_ROUTER_CODECS
        );
    }
    Ok(file.media_codecs)
}
