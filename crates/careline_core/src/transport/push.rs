/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Hub client: one WebSocket per user, kept alive across relay restarts.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use careline_protocol::{HubConnectionState, HubEvent, HubRequest, SignalPayload, SignalingMessage, Uid};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{RoomRouter, RoomSubscription, SignalingTransport, TransportEvent};
use crate::backoff::Backoff;
use crate::config::CallConfig;

const PING_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct PushConfig {
    /// `ws://` or `wss://` base of the relay, without the `/hub` path.
    pub relay_ws_url: String,
    pub uid: Uid,
    pub display_name: Option<String>,
    pub token: Option<String>,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub reconnect_budget: u32,
}

impl PushConfig {
    pub fn new(relay_ws_url: impl Into<String>, uid: Uid, call: &CallConfig) -> Self {
        Self {
            relay_ws_url: relay_ws_url.into(),
            uid,
            display_name: None,
            token: None,
            reconnect_base: call.reconnect_base(),
            reconnect_max: call.reconnect_max(),
            reconnect_budget: call.reconnect_budget(),
        }
    }

    fn hub_url(&self) -> String {
        let mut url = format!("{}/hub?uid={}", self.relay_ws_url.trim_end_matches('/'), self.uid);
        if let Some(name) = &self.display_name {
            url.push_str(&format!("&name={}", urlencoding::encode(name)));
        }
        if let Some(token) = &self.token {
            url.push_str(&format!("&token={}", urlencoding::encode(token)));
        }
        url
    }
}

#[derive(Default)]
struct Presence {
    watching: BTreeSet<Uid>,
    online: HashMap<Uid, bool>,
}

pub struct PushTransport {
    uid: Uid,
    router: Arc<RoomRouter>,
    out_tx: mpsc::UnboundedSender<HubRequest>,
    presence: Arc<Mutex<Presence>>,
    state_rx: watch::Receiver<HubConnectionState>,
    cancel: CancellationToken,
}

impl PushTransport {
    /// Starts the connection task and returns at once; frames sent before the
    /// socket is up are queued.
    pub fn connect(cfg: PushConfig) -> Self {
        let router = Arc::new(RoomRouter::new());
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(HubConnectionState::Reconnecting);
        let presence = Arc::new(Mutex::new(Presence::default()));
        let cancel = CancellationToken::new();
        let uid = cfg.uid;

        tokio::spawn(run_connection(
            cfg,
            router.clone(),
            out_rx,
            presence.clone(),
            state_tx,
            cancel.clone(),
        ));

        Self {
            uid,
            router,
            out_tx,
            presence,
            state_rx,
            cancel,
        }
    }

    pub fn connection_state(&self) -> HubConnectionState {
        *self.state_rx.borrow()
    }

    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state_rx.clone();
        let wait = async {
            loop {
                if *rx.borrow_and_update() == HubConnectionState::Connected {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(anyhow!("push transport stopped"));
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| anyhow!("hub not connected after {timeout:?}"))?
    }

    /// Asks the hub for `user-status-changed` updates about these users. Re-sent after reconnects.
    pub fn subscribe_presence(&self, uids: &[Uid]) -> Result<()> {
        {
            let mut p = lock(&self.presence);
            p.watching.extend(uids.iter().copied());
        }
        self.out_tx
            .send(HubRequest::SubscribePresence { uids: uids.to_vec() })
            .map_err(|_| anyhow!("push transport closed"))
    }

    pub fn is_online(&self, uid: Uid) -> Option<bool> {
        lock(&self.presence).online.get(&uid).copied()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PushTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn lock(p: &Mutex<Presence>) -> std::sync::MutexGuard<'_, Presence> {
    p.lock().unwrap_or_else(|e| e.into_inner())
}

/// Call control has dedicated hub methods so the hub can keep its call records.
fn to_hub_request(target_uid: Uid, message: SignalingMessage) -> HubRequest {
    match message.payload {
        SignalPayload::CallAccept => HubRequest::AcceptCall {
            room_id: message.room_id,
            target_uid,
        },
        SignalPayload::CallReject => HubRequest::RejectCall {
            room_id: message.room_id,
            target_uid,
        },
        SignalPayload::CallEnd => HubRequest::EndCall {
            room_id: message.room_id,
            target_uid,
        },
        _ => HubRequest::SendMessage { target_uid, message },
    }
}

#[async_trait]
impl SignalingTransport for PushTransport {
    fn local_uid(&self) -> Uid {
        self.uid
    }

    async fn join(&self, room_id: &str) -> Result<RoomSubscription> {
        let sub = self.router.subscribe(room_id)?;
        debug!(room = %room_id, subscription = sub.id(), "push join");
        Ok(sub)
    }

    async fn leave(&self, room_id: &str, subscription_id: u64) -> Result<()> {
        debug!(room = %room_id, subscription = subscription_id, "push leave");
        self.router.unsubscribe(room_id, subscription_id);
        Ok(())
    }

    async fn send(&self, target_uid: Uid, message: SignalingMessage) -> Result<()> {
        self.out_tx
            .send(to_hub_request(target_uid, message))
            .map_err(|_| anyhow!("push transport closed"))
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<SignalingMessage>> {
        self.router.take_incoming()
    }
}

enum SocketEnd {
    Closed,
    Cancelled,
    OutboundClosed,
}

async fn run_connection(
    cfg: PushConfig,
    router: Arc<RoomRouter>,
    mut out_rx: mpsc::UnboundedReceiver<HubRequest>,
    presence: Arc<Mutex<Presence>>,
    state_tx: watch::Sender<HubConnectionState>,
    cancel: CancellationToken,
) {
    let url = cfg.hub_url();
    let mut backoff = Backoff::new(cfg.reconnect_base, cfg.reconnect_max);
    let mut failures: u32 = 0;
    let mut outage_reported = false;
    let mut was_connected = false;
    let mut carry: Option<HubRequest> = None;

    loop {
        info!(uid = cfg.uid, "connecting hub");
        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            r = tokio_tungstenite::connect_async(url.as_str()) => r,
        };
        match attempt {
            Ok((ws, _)) => {
                failures = 0;
                backoff.reset();
                let _ = state_tx.send(HubConnectionState::Connected);
                if was_connected || outage_reported {
                    info!(uid = cfg.uid, "hub reconnected");
                    router.broadcast(TransportEvent::Reconnected);
                }
                was_connected = true;
                outage_reported = false;

                let end = drive_socket(ws, &router, &mut out_rx, &presence, &mut carry, &cancel).await;
                let _ = state_tx.send(HubConnectionState::Reconnecting);
                match end {
                    SocketEnd::Cancelled | SocketEnd::OutboundClosed => break,
                    SocketEnd::Closed => warn!(uid = cfg.uid, "hub connection lost"),
                }
            }
            Err(e) => {
                failures += 1;
                warn!(uid = cfg.uid, failures, "hub connect failed: {e}");
                if failures >= cfg.reconnect_budget && !outage_reported {
                    outage_reported = true;
                    router.broadcast(TransportEvent::Unreachable(format!(
                        "hub unreachable after {failures} attempts"
                    )));
                }
            }
        }

        let delay = backoff.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    let _ = state_tx.send(HubConnectionState::Disconnected);
    debug!(uid = cfg.uid, "hub connection task stopped");
}

async fn drive_socket<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    router: &RoomRouter,
    out_rx: &mut mpsc::UnboundedReceiver<HubRequest>,
    presence: &Mutex<Presence>,
    carry: &mut Option<HubRequest>,
    cancel: &CancellationToken,
) -> SocketEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws.split();

    let watching: Vec<Uid> = lock(presence).watching.iter().copied().collect();
    let mut backlog: Vec<HubRequest> = Vec::new();
    if !watching.is_empty() {
        backlog.push(HubRequest::SubscribePresence { uids: watching });
    }
    backlog.extend(carry.take());
    for req in backlog {
        if let Err(end) = send_frame(&mut ws_tx, &req).await {
            *carry = Some(req);
            return end;
        }
    }

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_tx.send(tungstenite::Message::Close(None)).await;
                return SocketEnd::Cancelled;
            }
            _ = ping.tick() => {
                if ws_tx.send(tungstenite::Message::Ping(Vec::new())).await.is_err() {
                    return SocketEnd::Closed;
                }
            }
            req = out_rx.recv() => {
                let Some(req) = req else {
                    let _ = ws_tx.send(tungstenite::Message::Close(None)).await;
                    return SocketEnd::OutboundClosed;
                };
                if let Err(end) = send_frame(&mut ws_tx, &req).await {
                    *carry = Some(req);
                    return end;
                }
            }
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { return SocketEnd::Closed };
                match msg {
                    tungstenite::Message::Text(text) => match serde_json::from_str::<HubEvent>(&text) {
                        Ok(ev) => handle_event(ev, router, presence),
                        Err(e) => warn!("bad hub event json: {e}"),
                    },
                    tungstenite::Message::Ping(p) => {
                        let _ = ws_tx.send(tungstenite::Message::Pong(p)).await;
                    }
                    tungstenite::Message::Close(_) => return SocketEnd::Closed,
                    _ => {}
                }
            }
        }
    }
}

async fn send_frame<W>(ws_tx: &mut W, req: &HubRequest) -> std::result::Result<(), SocketEnd>
where
    W: futures_util::Sink<tungstenite::Message> + Unpin,
{
    let json = match serde_json::to_string(req) {
        Ok(v) => v,
        Err(e) => {
            warn!("serialize hub request failed: {e}");
            return Ok(());
        }
    };
    ws_tx.send(tungstenite::Message::Text(json)).await.map_err(|_| SocketEnd::Closed)
}

fn handle_event(ev: HubEvent, router: &RoomRouter, presence: &Mutex<Presence>) {
    match ev {
        HubEvent::ConnectionStateChanged { state, connection_id } => {
            debug!(?state, connection = %connection_id, "hub connection state");
        }
        HubEvent::UserStatusChanged { uid, online, .. } => {
            debug!(uid, online, "presence");
            lock(presence).online.insert(uid, online);
        }
        HubEvent::DeliveryFailed {
            target_uid,
            room_id,
            reason,
        } => {
            info!(room = %room_id, target = target_uid, "delivery failed: {reason}");
            router.notify(&room_id, TransportEvent::PeerUnavailable { target_uid, reason });
        }
        other => {
            if let Some(msg) = other.into_signaling() {
                router.route(msg);
            }
        }
    }
}
