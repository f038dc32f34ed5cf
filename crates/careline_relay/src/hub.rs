/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Push hub: one live WebSocket per user, messages routed by target uid.
//! Nothing is stored for offline users.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use careline_protocol::{
    now_ms, CallKind, HubConnectionState, HubEvent, HubRequest, SignalPayload, Uid, DELIVERY_OFFLINE,
    DELIVERY_QUEUE_FULL,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Ringing,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub caller: Uid,
    pub callee: Uid,
    pub kind: CallKind,
    pub status: CallStatus,
    pub started_at_ms: i64,
}

impl CallRecord {
    fn counterpart(&self, uid: Uid) -> Option<Uid> {
        if uid == self.caller {
            Some(self.callee)
        } else if uid == self.callee {
            Some(self.caller)
        } else {
            None
        }
    }
}

struct HubConnection {
    connection_id: String,
    name: String,
    tx: mpsc::Sender<HubEvent>,
}

pub struct Hub {
    connections: RwLock<HashMap<Uid, HubConnection>>,
    calls: RwLock<HashMap<String, CallRecord>>,
    // target uid -> uids watching its presence
    watchers: RwLock<HashMap<Uid, HashSet<Uid>>>,
    queue: usize,
}

impl Hub {
    pub fn new(queue: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            calls: RwLock::new(HashMap::new()),
            watchers: RwLock::new(HashMap::new()),
            queue: queue.max(1),
        }
    }

    pub async fn online_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_online(&self, uid: Uid) -> bool {
        self.connections.read().await.contains_key(&uid)
    }

    pub async fn call(&self, room_id: &str) -> Option<CallRecord> {
        self.calls.read().await.get(room_id).cloned()
    }

    /// Registers a live connection for `uid`, replacing any previous one.
    /// Returns the connection id and the event stream for the socket writer.
    pub async fn register(&self, uid: Uid, name: &str) -> (String, mpsc::Receiver<HubEvent>) {
        let connection_id = format!("{uid}-{:016x}", rand::random::<u64>());
        let (tx, rx) = mpsc::channel(self.queue);
        let _ = tx.try_send(HubEvent::ConnectionStateChanged {
            state: HubConnectionState::Connected,
            connection_id: connection_id.clone(),
        });
        let previous = self.connections.write().await.insert(
            uid,
            HubConnection {
                connection_id: connection_id.clone(),
                name: name.to_string(),
                tx,
            },
        );
        match previous {
            Some(old) => info!(uid, old = %old.connection_id, new = %connection_id, "hub connection replaced"),
            None => {
                info!(uid, connection = %connection_id, "hub connected");
                self.notify_watchers(uid, true).await;
            }
        }
        (connection_id, rx)
    }

    /// Drops the connection if it is still the registered one for `uid`, then ends
    /// that user's calls and tells presence watchers.
    pub async fn unregister(&self, uid: Uid, connection_id: &str) -> bool {
        {
            let mut conns = self.connections.write().await;
            match conns.get(&uid) {
                Some(c) if c.connection_id == connection_id => {
                    conns.remove(&uid);
                }
                _ => return false,
            }
        }
        info!(uid, connection = %connection_id, "hub disconnected");

        let ended: Vec<(String, Uid)> = {
            let mut calls = self.calls.write().await;
            let rooms: Vec<String> = calls
                .iter()
                .filter(|(_, r)| r.counterpart(uid).is_some())
                .map(|(k, _)| k.clone())
                .collect();
            rooms
                .into_iter()
                .filter_map(|room| {
                    let rec = calls.remove(&room)?;
                    Some((room, rec.counterpart(uid)?))
                })
                .collect()
        };
        for (room_id, other) in ended {
            info!(room = %room_id, uid, peer = other, "call ended by disconnect");
            self.deliver(
                other,
                HubEvent::CallEnded {
                    room_id,
                    uid,
                    timestamp_ms: now_ms(),
                },
            )
            .await;
        }

        {
            let mut watchers = self.watchers.write().await;
            for set in watchers.values_mut() {
                set.remove(&uid);
            }
            watchers.retain(|_, set| !set.is_empty());
        }
        self.notify_watchers(uid, false).await;
        true
    }

    async fn notify_watchers(&self, uid: Uid, online: bool) {
        let targets: Vec<Uid> = self
            .watchers
            .read()
            .await
            .get(&uid)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for w in targets {
            self.deliver(
                w,
                HubEvent::UserStatusChanged {
                    uid,
                    online,
                    timestamp_ms: now_ms(),
                },
            )
            .await;
        }
    }

    /// Queues an event for `uid`. False when the user is offline or its queue is full.
    pub async fn deliver(&self, uid: Uid, event: HubEvent) -> bool {
        self.try_deliver(uid, event).await.is_ok()
    }

    /// Like [`Hub::deliver`], with the `DeliveryFailed` reason on failure.
    async fn try_deliver(&self, uid: Uid, event: HubEvent) -> Result<(), &'static str> {
        let tx = match self.connections.read().await.get(&uid) {
            Some(c) => c.tx.clone(),
            None => return Err(DELIVERY_OFFLINE),
        };
        match tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(uid, "hub queue full, event dropped");
                Err(DELIVERY_QUEUE_FULL)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DELIVERY_OFFLINE),
        }
    }

    async fn deliver_or_report(&self, from: Uid, target: Uid, room_id: &str, event: HubEvent) -> bool {
        let Err(reason) = self.try_deliver(target, event).await else {
            return true;
        };
        debug!(room = %room_id, from, target, reason, "delivery failed");
        self.deliver(
            from,
            HubEvent::DeliveryFailed {
                target_uid: target,
                room_id: room_id.to_string(),
                reason: reason.to_string(),
            },
        )
        .await;
        false
    }

    async fn route_target(&self, room_id: &str, from: Uid, fallback: Uid) -> Uid {
        self.calls
            .read()
            .await
            .get(room_id)
            .and_then(|r| r.counterpart(from))
            .unwrap_or(fallback)
    }

    pub async fn handle_request(&self, from: Uid, req: HubRequest) {
        match req {
            HubRequest::SendMessage { target_uid, mut message } => {
                if target_uid == from {
                    debug!(uid = from, "message to self dropped");
                    return;
                }
                // The sender is whoever owns the socket, whatever the frame claims.
                message.sender_uid = from;
                let room_id = message.room_id.clone();
                match message.payload.clone() {
                    SignalPayload::CallInvite { call_kind, caller_name } => {
                        let caller_name = match caller_name {
                            Some(n) => Some(n),
                            None => self.connections.read().await.get(&from).map(|c| c.name.clone()),
                        };
                        let event = HubEvent::IncomingCall {
                            room_id: room_id.clone(),
                            caller_uid: from,
                            caller_name,
                            call_kind,
                            timestamp_ms: message.timestamp_ms,
                        };
                        if self.deliver_or_report(from, target_uid, &room_id, event).await {
                            info!(room = %room_id, caller = from, callee = target_uid, kind = call_kind.as_str(), "call invite");
                            self.calls.write().await.insert(
                                room_id,
                                CallRecord {
                                    caller: from,
                                    callee: target_uid,
                                    kind: call_kind,
                                    status: CallStatus::Ringing,
                                    started_at_ms: now_ms(),
                                },
                            );
                        }
                    }
                    payload => {
                        match payload {
                            SignalPayload::CallAccept => self.mark_active(&room_id).await,
                            SignalPayload::CallReject | SignalPayload::CallEnd | SignalPayload::Leave => {
                                self.calls.write().await.remove(&room_id);
                            }
                            _ => {}
                        }
                        self.deliver_or_report(from, target_uid, &room_id, HubEvent::NewMessage { message })
                            .await;
                    }
                }
            }
            HubRequest::AcceptCall { room_id, target_uid } => {
                let target = self.route_target(&room_id, from, target_uid).await;
                self.mark_active(&room_id).await;
                info!(room = %room_id, uid = from, "call accepted");
                let event = HubEvent::CallAccepted {
                    room_id: room_id.clone(),
                    uid: from,
                    timestamp_ms: now_ms(),
                };
                self.deliver_or_report(from, target, &room_id, event).await;
            }
            HubRequest::RejectCall { room_id, target_uid } => {
                let target = self.route_target(&room_id, from, target_uid).await;
                self.calls.write().await.remove(&room_id);
                info!(room = %room_id, uid = from, "call rejected");
                let event = HubEvent::CallRejected {
                    room_id: room_id.clone(),
                    uid: from,
                    timestamp_ms: now_ms(),
                };
                self.deliver_or_report(from, target, &room_id, event).await;
            }
            HubRequest::EndCall { room_id, target_uid } => {
                let target = self.route_target(&room_id, from, target_uid).await;
                self.calls.write().await.remove(&room_id);
                info!(room = %room_id, uid = from, "call ended");
                let event = HubEvent::CallEnded {
                    room_id: room_id.clone(),
                    uid: from,
                    timestamp_ms: now_ms(),
                };
                self.deliver_or_report(from, target, &room_id, event).await;
            }
            HubRequest::SubscribePresence { uids } => {
                {
                    let mut watchers = self.watchers.write().await;
                    for uid in &uids {
                        if *uid != from {
                            watchers.entry(*uid).or_default().insert(from);
                        }
                    }
                }
                for uid in uids {
                    let online = self.is_online(uid).await;
                    self.deliver(
                        from,
                        HubEvent::UserStatusChanged {
                            uid,
                            online,
                            timestamp_ms: now_ms(),
                        },
                    )
                    .await;
                }
            }
        }
    }

    async fn mark_active(&self, room_id: &str) {
        if let Some(rec) = self.calls.write().await.get_mut(room_id) {
            rec.status = CallStatus::Active;
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HubQuery {
    pub uid: Uid,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

pub async fn hub_ws(State(state): State<AppState>, query: Option<Query<HubQuery>>, ws: WebSocketUpgrade) -> Response {
    let Some(Query(q)) = query else {
        return (StatusCode::BAD_REQUEST, "missing uid").into_response();
    };
    if let Some(expected) = state.cfg.hub_token.as_deref() {
        if q.token.as_deref() != Some(expected) {
            warn!(uid = q.uid, "hub rejected: bad token");
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
    }
    let name = q.name.unwrap_or_default();
    ws.on_upgrade(move |socket| handle_hub(state, q.uid, name, socket))
}

async fn handle_hub(state: AppState, uid: Uid, name: String, socket: WebSocket) {
    let (connection_id, mut rx) = state.hub.register(uid, &name).await;
    let (mut ws_tx, mut ws_rx) = socket.split();
    let cancel = CancellationToken::new();

    let cancel_writer = cancel.clone();
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await;
        loop {
            tokio::select! {
                _ = cancel_writer.cancelled() => break,
                ev = rx.recv() => {
                    // None: this connection was replaced.
                    let Some(ev) = ev else { break };
                    let json = match serde_json::to_string(&ev) {
                        Ok(v) => v,
                        Err(e) => {
                            error!(uid, "serialize hub event failed: {e}");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
        cancel_writer.cancel();
    });

    let reader_state = state.clone();
    let cancel_reader = cancel.clone();
    let reader = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = cancel_reader.cancelled() => break,
                msg = ws_rx.next() => msg,
            };
            let Some(Ok(msg)) = msg else { break };
            match msg {
                Message::Text(text) => match serde_json::from_str::<HubRequest>(&text) {
                    Ok(req) => reader_state.hub.handle_request(uid, req).await,
                    Err(e) => warn!(uid, "invalid hub frame: {e}"),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
        cancel_reader.cancel();
    });

    let _ = tokio::join!(writer, reader);
    state.hub.unregister(uid, &connection_id).await;
}
