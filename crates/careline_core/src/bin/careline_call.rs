/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use careline_core::media::DetachedMedia;
use careline_core::peer::WebrtcPeerFactory;
use careline_core::transport::{PullConfig, PullTransport, PushConfig, PushTransport, SignalingTransport};
use careline_core::{CallAgent, CallConfig, CallDeps, CallEvent, CallSession};
use careline_protocol::{CallKind, Uid};
use tracing::{info, warn};

fn env_uid(name: &str) -> Result<Uid> {
    std::env::var(name)
        .with_context(|| format!("missing {name}"))?
        .trim()
        .parse()
        .with_context(|| format!("invalid {name}"))
}

/// Peers whose invites a waiting callee listens for. Pull relays only deliver
/// invites for watched rooms, so waiting there without any is an error.
fn watch_list(raw: Option<&str>, pull: bool) -> Result<Vec<Uid>> {
    let uids = raw
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.parse::<Uid>().with_context(|| format!("invalid CARELINE_WATCH entry {v:?}")))
        .collect::<Result<Vec<_>>>()?;
    if pull && uids.is_empty() {
        bail!("pull transport needs CARELINE_PEER or CARELINE_WATCH to receive a call");
    }
    Ok(uids)
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(d) = "info".parse() {
        filter = filter.add_directive(d);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let uid = env_uid("CARELINE_UID")?;
    let peer = std::env::var("CARELINE_PEER").ok().and_then(|v| v.trim().parse::<Uid>().ok());
    let relay_url = std::env::var("CARELINE_RELAY_URL").unwrap_or_else(|_| "http://127.0.0.1:8787".to_string());
    let transport_kind = std::env::var("CARELINE_TRANSPORT").unwrap_or_else(|_| "push".to_string());
    let kind = match std::env::var("CARELINE_CALL_KIND").as_deref() {
        Ok("video") => CallKind::Video,
        _ => CallKind::Audio,
    };
    let config = match std::env::var("CARELINE_CONFIG") {
        Ok(path) => CallConfig::from_json_file(path)?,
        Err(_) => CallConfig::default(),
    };
    let display_name = std::env::var("CARELINE_NAME").ok();

    let transport: Arc<dyn SignalingTransport> = match transport_kind.as_str() {
        "push" => {
            let ws_url = relay_url
                .replacen("https://", "wss://", 1)
                .replacen("http://", "ws://", 1);
            let mut cfg = PushConfig::new(ws_url, uid, &config);
            cfg.display_name = display_name.clone();
            cfg.token = std::env::var("CARELINE_HUB_TOKEN").ok();
            let push = PushTransport::connect(cfg);
            if let Err(e) = push.wait_connected(Duration::from_secs(10)).await {
                warn!("hub not connected yet: {e:#}");
            }
            Arc::new(push)
        }
        "pull" => Arc::new(PullTransport::new(PullConfig::new(relay_url.clone(), uid, &config))?),
        other => bail!("unknown CARELINE_TRANSPORT {other:?} (push|pull)"),
    };

    let agent = CallAgent::new(CallDeps {
        transport,
        peers: Arc::new(WebrtcPeerFactory),
        media: Arc::new(DetachedMedia),
        config,
        display_name,
    });

    let mut session = match peer {
        Some(peer) => {
            info!(uid, peer, kind = kind.as_str(), "calling");
            agent.call(peer, kind).await?
        }
        None => {
            let watch = std::env::var("CARELINE_WATCH").ok();
            for peer in watch_list(watch.as_deref(), transport_kind == "pull")? {
                agent.watch_peer(peer).await?;
            }
            info!(uid, "waiting for a call");
            let Some(session) = agent.next_incoming().await else {
                bail!("incoming stream closed");
            };
            session.accept_call().await?;
            session
        }
    };

    run_until_done(&mut session).await;
    Ok(())
}

async fn run_until_done(session: &mut CallSession) {
    let Some(mut events) = session.take_events() else {
        return;
    };
    loop {
        tokio::select! {
            r = tokio::signal::ctrl_c() => {
                if let Err(e) = r {
                    warn!("ctrl_c failed: {e}");
                }
                if let Err(e) = session.end_call().await {
                    warn!("end call failed: {e}");
                }
            }
            ev = events.recv() => {
                let Some(ev) = ev else { break };
                match ev {
                    CallEvent::StateChanged { from, to, .. } => info!("state {} -> {}", from.as_str(), to.as_str()),
                    CallEvent::RemoteStream { uid, track } => info!(uid, track = %track.id, "remote track"),
                    CallEvent::Error(e) => warn!("call error: {e}"),
                    CallEvent::Ended { state, reason } => {
                        info!("call {}: {reason}", state.as_str());
                        break;
                    }
                    other => info!(event = other.kind(), "call event"),
                }
            }
        }
    }
}
