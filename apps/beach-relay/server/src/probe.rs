//! `probe` subcommand: a throwaway client that joins a room on a running relay
//! and reports what the router offers.

use std::time::Duration;

use anyhow::{Context, Result};
use beach_relay_client::{ChannelConfig, SignalingChannel};
use beach_relay_core::{
    protocol::{GetRouterRtpCapabilitiesRequest, JoinRequest},
    PeerId, RoomId, RtpCapabilities,
};
use serde::Serialize;
use tracing::info;

use crate::config::ProbeArgs;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub peer_id: PeerId,
    pub room_id: RoomId,
    pub rtp_capabilities: RtpCapabilities,
}

pub async fn probe(url: &str, timeout: Duration) -> Result<ProbeReport> {
    let config = ChannelConfig {
        connect_timeout: timeout,
        request_timeout: timeout,
    };
    let (channel, _events) = SignalingChannel::connect(url, config)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;

    let joined = channel
        .request(&JoinRequest::default())
        .await
        .context("join was rejected")?;
    info!(peer_id = %joined.peer_id, room_id = %joined.room_id, "probe joined");

    let rtp_capabilities = channel
        .request(&GetRouterRtpCapabilitiesRequest {})
        .await
        .context("failed to fetch router capabilities")?;
    channel.close();

    Ok(ProbeReport {
        peer_id: joined.peer_id,
        room_id: joined.room_id,
        rtp_capabilities,
    })
}

pub async fn run(args: ProbeArgs) -> Result<()> {
    let report = probe(&args.url, Duration::from_secs(args.timeout_secs)).await?;
    let rendered = serde_json::to_string_pretty(&report).context("failed to render report")?;
    println!("{rendered}");
    Ok(())
}
