/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod pull;
pub mod push;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use careline_protocol::{SignalPayload, SignalingMessage, Uid};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

pub use pull::{PullConfig, PullTransport};
pub use push::{PushConfig, PushTransport};

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(SignalingMessage),
    /// The relay could not hand a message to `target_uid`.
    PeerUnavailable { target_uid: Uid, reason: String },
    /// Retry budget exhausted. Sent once per outage.
    Unreachable(String),
    Reconnected,
}

/// Event stream for one joined room, owned by exactly one call session.
#[derive(Debug)]
pub struct RoomSubscription {
    id: u64,
    room_id: String,
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl RoomSubscription {
    pub fn new(id: u64, room_id: impl Into<String>, rx: mpsc::UnboundedReceiver<TransportEvent>) -> Self {
        Self {
            id,
            room_id: room_id.into(),
            rx,
        }
    }

    /// Passed back to [`SignalingTransport::leave`] so that only this
    /// subscription is released.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    fn local_uid(&self) -> Uid;

    /// Fails while another live subscription holds the room.
    async fn join(&self, room_id: &str) -> Result<RoomSubscription>;

    /// Releases the subscription `subscription_id`. Leaving with the id of a
    /// subscription that was already replaced is a no-op.
    async fn leave(&self, room_id: &str, subscription_id: u64) -> Result<()>;

    async fn send(&self, target_uid: Uid, message: SignalingMessage) -> Result<()>;

    /// Invites for rooms nobody joined yet. Handed out once.
    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<SignalingMessage>>;

    /// Start listening for invites in a room without joining it. Only room-based
    /// transports need this; user-addressed ones get invites anyway.
    async fn watch(&self, _room_id: &str) -> Result<()> {
        Ok(())
    }
}

const PENDING_TTL: Duration = Duration::from_secs(60);
const PENDING_MAX_PER_ROOM: usize = 128;
const PENDING_MAX_ROOMS: usize = 256;
const LEFT_QUIET: Duration = Duration::from_secs(3);

struct Joined {
    id: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

struct RouterInner {
    rooms: HashMap<String, Joined>,
    next_id: u64,
    pending: HashMap<String, Vec<(Instant, SignalingMessage)>>,
    recently_left: HashMap<String, Instant>,
    incoming_tx: mpsc::UnboundedSender<SignalingMessage>,
    incoming_rx: Option<mpsc::UnboundedReceiver<SignalingMessage>>,
}

/// Fans user-addressed messages out to per-room subscriptions.
///
/// Messages for a room that is not joined yet are held for a minute and
/// replayed on join, so an offer racing ahead of the callee's session is not
/// lost. Invites for such rooms also go to the incoming stream.
pub struct RoomRouter {
    inner: Mutex<RouterInner>,
}

impl Default for RoomRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRouter {
    pub fn new() -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            inner: Mutex::new(RouterInner {
                rooms: HashMap::new(),
                next_id: 1,
                pending: HashMap::new(),
                recently_left: HashMap::new(),
                incoming_tx,
                incoming_rx: Some(incoming_rx),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, room_id: &str) -> Result<RoomSubscription> {
        let mut inner = self.lock();
        if inner.rooms.get(room_id).is_some_and(|j| !j.tx.is_closed()) {
            bail!("room {room_id} is already joined by another call");
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.recently_left.remove(room_id);
        if let Some(held) = inner.pending.remove(room_id) {
            let mut replayed = 0;
            for (at, msg) in held {
                if at.elapsed() < PENDING_TTL && tx.send(TransportEvent::Message(msg)).is_ok() {
                    replayed += 1;
                }
            }
            debug!(room = %room_id, replayed, "replayed held messages");
        }
        inner.rooms.insert(room_id.to_string(), Joined { id, tx });
        Ok(RoomSubscription::new(id, room_id, rx))
    }

    /// Releases subscription `id`. Returns false, and changes nothing, when the
    /// room is held by a different subscription.
    pub fn unsubscribe(&self, room_id: &str, id: u64) -> bool {
        let mut inner = self.lock();
        if let Some(joined) = inner.rooms.get(room_id) {
            if joined.id != id {
                debug!(room = %room_id, id, owner = joined.id, "stale unsubscribe ignored");
                return false;
            }
            inner.rooms.remove(room_id);
        }
        inner.pending.remove(room_id);
        inner.recently_left.insert(room_id.to_string(), Instant::now());
        true
    }

    pub fn is_joined(&self, room_id: &str) -> bool {
        self.lock().rooms.contains_key(room_id)
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        self.lock().rooms.keys().cloned().collect()
    }

    pub fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<SignalingMessage>> {
        self.lock().incoming_rx.take()
    }

    pub fn route(&self, msg: SignalingMessage) {
        let mut inner = self.lock();
        let room_id = msg.room_id.clone();
        if let Some(joined) = inner.rooms.get(&room_id) {
            if joined.tx.send(TransportEvent::Message(msg.clone())).is_ok() {
                return;
            }
            inner.rooms.remove(&room_id);
        }

        let is_invite = matches!(msg.payload, SignalPayload::CallInvite { .. });
        if !is_invite {
            // Stragglers from a call that just ended must not leak into the next one.
            if let Some(at) = inner.recently_left.get(&room_id) {
                if at.elapsed() < LEFT_QUIET {
                    debug!(room = %room_id, kind = msg.kind(), "late message for left room dropped");
                    return;
                }
            }
        }
        if is_invite {
            let _ = inner.incoming_tx.send(msg.clone());
        }

        let now = Instant::now();
        inner.recently_left.retain(|_, at| at.elapsed() < LEFT_QUIET);
        inner.pending.retain(|_, held| {
            held.retain(|(at, _)| at.elapsed() < PENDING_TTL);
            !held.is_empty()
        });
        if !inner.pending.contains_key(&room_id) && inner.pending.len() >= PENDING_MAX_ROOMS {
            debug!(room = %room_id, "too many held rooms, message dropped");
            return;
        }
        let held = inner.pending.entry(room_id).or_default();
        if held.len() >= PENDING_MAX_PER_ROOM {
            held.remove(0);
        }
        held.push((now, msg));
    }

    /// Sends to one room, if joined.
    pub fn notify(&self, room_id: &str, ev: TransportEvent) -> bool {
        match self.lock().rooms.get(room_id) {
            Some(joined) => joined.tx.send(ev).is_ok(),
            None => false,
        }
    }

    pub fn broadcast(&self, ev: TransportEvent) {
        for joined in self.lock().rooms.values() {
            let _ = joined.tx.send(ev.clone());
        }
    }
}
