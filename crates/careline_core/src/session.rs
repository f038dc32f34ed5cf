/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! One call, one task.
//!
//! [`CallSession`] is a handle; the state machine lives in a spawned actor that
//! owns the room subscription, the negotiation coordinator and the local media.
//! UI commands, transport traffic, peer callbacks and timers all arrive through
//! the same `select!` loop, so no two transitions ever run concurrently.
//! Teardown runs after the loop on every exit path.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use careline_protocol::{
    now_ms, room_id_for, CallKind, IceCandidate, SignalPayload, SignalingMessage, Uid, DELIVERY_QUEUE_FULL,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CallConfig;
use crate::error::{CallError, EndReason};
use crate::events::CallEvent;
use crate::media::{LocalStream, MediaError, MediaProvider, TrackKind};
use crate::negotiation::{NegotiationCoordinator, Step};
use crate::peer::{PeerConnectionFactory, PeerConnectionState, PeerEvent, PeerEventKind};
use crate::transport::{RoomSubscription, SignalingTransport, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Idle,
    Inviting,
    Ringing,
    Negotiating,
    Connected,
    Ended,
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Inviting => "inviting",
            CallState::Ringing => "ringing",
            CallState::Negotiating => "negotiating",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
            CallState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub state: CallState,
    pub role: Option<CallRole>,
    pub room_id: Option<String>,
    pub local_uid: Uid,
    pub remote_uid: Option<Uid>,
    pub remote_name: Option<String>,
    pub call_kind: Option<CallKind>,
    pub audio_muted: bool,
    pub video_muted: bool,
    pub connection_state: PeerConnectionState,
    pub started_at_ms: Option<i64>,
    pub established_at_ms: Option<i64>,
    pub end_reason: Option<EndReason>,
    /// Ring or negotiation timer currently armed (0 or 1).
    pub active_timers: usize,
}

impl CallSnapshot {
    fn idle(local_uid: Uid) -> Self {
        Self {
            state: CallState::Idle,
            role: None,
            room_id: None,
            local_uid,
            remote_uid: None,
            remote_name: None,
            call_kind: None,
            audio_muted: false,
            video_muted: false,
            connection_state: PeerConnectionState::New,
            started_at_ms: None,
            established_at_ms: None,
            end_reason: None,
            active_timers: 0,
        }
    }
}

/// Everything a session needs from the outside. Cheap to clone.
#[derive(Clone)]
pub struct CallDeps {
    pub transport: Arc<dyn SignalingTransport>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub media: Arc<dyn MediaProvider>,
    pub config: CallConfig,
    pub display_name: Option<String>,
}

type Reply = oneshot::Sender<Result<(), CallError>>;

enum Command {
    Start { target: Uid, kind: CallKind, reply: Reply },
    Accept { reply: Reply },
    Reject { reply: Reply },
    End { reply: Reply },
    Mute { kind: TrackKind, muted: bool, reply: Reply },
}

/// Handle to one call. Clones share the call; only the first handle carries the
/// event receiver. Dropping every handle hangs up.
pub struct CallSession {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<CallSnapshot>,
    events: Option<mpsc::UnboundedReceiver<CallEvent>>,
}

impl Clone for CallSession {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            state_rx: self.state_rx.clone(),
            events: None,
        }
    }
}

impl CallSession {
    /// A session that can place a call with [`CallSession::start_call`].
    pub fn idle(deps: CallDeps) -> Self {
        let local_uid = deps.transport.local_uid();
        Self::spawn(deps, CallSnapshot::idle(local_uid), false)
    }

    /// A ringing callee session for a received `call-invite`. Joins the room
    /// right away so a caller hangup is seen while ringing.
    pub fn incoming(invite: &SignalingMessage, deps: CallDeps) -> Result<Self, CallError> {
        let SignalPayload::CallInvite { call_kind, caller_name } = &invite.payload else {
            return Err(CallError::Negotiation(format!("expected call-invite, got {}", invite.kind())));
        };
        let local_uid = deps.transport.local_uid();
        if invite.sender_uid == local_uid {
            return Err(CallError::Negotiation("invite from self".to_string()));
        }
        let mut snap = CallSnapshot::idle(local_uid);
        snap.role = Some(CallRole::Callee);
        snap.room_id = Some(invite.room_id.clone());
        snap.remote_uid = Some(invite.sender_uid);
        snap.remote_name = caller_name.clone();
        snap.call_kind = Some(*call_kind);
        snap.started_at_ms = Some(now_ms());
        Ok(Self::spawn(deps, snap, true))
    }

    fn spawn(deps: CallDeps, snap: CallSnapshot, ring: bool) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(snap.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let actor = Actor {
            deps,
            snap,
            state_tx,
            events_tx,
            sub: None,
            joined: None,
            coordinator: None,
            peer_tx,
            peer_rx,
            local_stream: None,
            held_candidates: Vec::new(),
            early_offer: None,
            deadline: None,
            end_reason: None,
            end_replies: Vec::new(),
        };
        tokio::spawn(actor.run(cmd_rx, ring));
        Self {
            cmd_tx,
            state_rx,
            events: Some(events_rx),
        }
    }

    async fn request(&self, make: impl FnOnce(Reply) -> Command) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).map_err(|_| CallError::SessionClosed)?;
        rx.await.map_err(|_| CallError::SessionClosed)?
    }

    /// Joins the room, sends the invite and starts ringing.
    pub async fn start_call(&self, target_uid: Uid, kind: CallKind) -> Result<(), CallError> {
        self.request(|reply| Command::Start {
            target: target_uid,
            kind,
            reply,
        })
        .await
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Reject { reply }).await
    }

    /// Hangs up and returns once teardown finished. Ending a finished call is a no-op.
    pub async fn end_call(&self) -> Result<(), CallError> {
        match self.request(|reply| Command::End { reply }).await {
            Err(CallError::SessionClosed) if self.state().is_terminal() => Ok(()),
            other => other,
        }
    }

    pub async fn toggle_audio(&self, muted: bool) -> Result<(), CallError> {
        self.request(|reply| Command::Mute {
            kind: TrackKind::Audio,
            muted,
            reply,
        })
        .await
    }

    pub async fn toggle_video(&self, muted: bool) -> Result<(), CallError> {
        self.request(|reply| Command::Mute {
            kind: TrackKind::Video,
            muted,
            reply,
        })
        .await
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.state_rx.borrow().clone()
    }

    pub fn state(&self) -> CallState {
        self.state_rx.borrow().state
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.state_rx.clone()
    }

    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<CallEvent>> {
        self.events.take()
    }

    /// A handle that does not keep the call alive.
    pub fn downgrade(&self) -> WeakCallSession {
        WeakCallSession {
            cmd_tx: self.cmd_tx.downgrade(),
            state_rx: self.state_rx.clone(),
        }
    }

    /// Resolves with the first snapshot matching `pred`.
    pub async fn wait_for(&self, pred: impl Fn(&CallSnapshot) -> bool) -> Result<CallSnapshot, CallError> {
        wait_snapshot(self.state_rx.clone(), pred).await
    }

    /// Resolves once the call is over and its resources are released.
    pub async fn finished(&self) -> CallSnapshot {
        match self.wait_for(|s| s.state.is_terminal()).await {
            Ok(s) => s,
            Err(_) => self.snapshot(),
        }
    }
}

#[derive(Clone)]
pub struct WeakCallSession {
    cmd_tx: mpsc::WeakUnboundedSender<Command>,
    state_rx: watch::Receiver<CallSnapshot>,
}

impl WeakCallSession {
    /// `None` once every strong handle is gone and the call is hanging up.
    pub fn upgrade(&self) -> Option<CallSession> {
        Some(CallSession {
            cmd_tx: self.cmd_tx.upgrade()?,
            state_rx: self.state_rx.clone(),
            events: None,
        })
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.state_rx.borrow().clone()
    }
}

pub(crate) async fn wait_snapshot(
    mut rx: watch::Receiver<CallSnapshot>,
    pred: impl Fn(&CallSnapshot) -> bool,
) -> Result<CallSnapshot, CallError> {
    loop {
        {
            let snap = rx.borrow_and_update();
            if pred(&snap) {
                return Ok(snap.clone());
            }
        }
        if rx.changed().await.is_err() {
            let snap = rx.borrow().clone();
            return if pred(&snap) { Ok(snap) } else { Err(CallError::SessionClosed) };
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    Ring,
    Negotiation,
}

struct Actor {
    deps: CallDeps,
    snap: CallSnapshot,
    state_tx: watch::Sender<CallSnapshot>,
    events_tx: mpsc::UnboundedSender<CallEvent>,
    sub: Option<RoomSubscription>,
    /// Subscription id to release on leave.
    joined: Option<u64>,
    coordinator: Option<NegotiationCoordinator>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    local_stream: Option<LocalStream>,
    held_candidates: Vec<IceCandidate>,
    /// Offer that reached a ringing callee before it accepted.
    early_offer: Option<String>,
    deadline: Option<(Instant, Timer)>,
    end_reason: Option<EndReason>,
    end_replies: Vec<Reply>,
}

async fn next_room_event(sub: &mut Option<RoomSubscription>) -> Option<TransportEvent> {
    match sub {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}

fn sleep_until_opt(at: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}

impl Actor {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>, ring: bool) {
        if ring {
            self.start_ringing().await;
        }

        while self.end_reason.is_none() {
            let deadline = self.deadline.map(|(at, _)| at);
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => {
                        debug!(room = ?self.snap.room_id, "all call handles dropped");
                        self.finish(EndReason::LocalHangup);
                    }
                },
                ev = next_room_event(&mut self.sub) => match ev {
                    Some(ev) => self.on_transport_event(ev).await,
                    None => {
                        warn!(room = ?self.snap.room_id, "room subscription closed");
                        self.sub = None;
                        self.finish(EndReason::SignalingUnreachable);
                    }
                },
                Some(ev) = self.peer_rx.recv() => self.on_peer_event(ev).await,
                _ = sleep_until_opt(deadline) => self.on_timer(),
            }
        }

        self.teardown().await;

        cmd_rx.close();
        while let Ok(cmd) = cmd_rx.try_recv() {
            self.refuse(cmd);
        }
    }

    fn local_uid(&self) -> Uid {
        self.snap.local_uid
    }

    fn config(&self) -> &CallConfig {
        &self.deps.config
    }

    fn emit(&self, ev: CallEvent) {
        let _ = self.events_tx.send(ev);
    }

    fn publish(&mut self) {
        self.snap.active_timers = usize::from(self.deadline.is_some());
        self.state_tx.send_replace(self.snap.clone());
    }

    fn transition(&mut self, to: CallState) {
        let from = self.snap.state;
        if from == to {
            return;
        }
        info!(
            room = ?self.snap.room_id,
            uid = self.local_uid(),
            peer = ?self.snap.remote_uid,
            "call {} -> {}",
            from.as_str(),
            to.as_str()
        );
        self.snap.state = to;
        self.emit(CallEvent::state_changed(from, to));
        self.publish();
    }

    fn arm(&mut self, timer: Timer, after: Duration) {
        self.deadline = Some((Instant::now() + after, timer));
        self.publish();
    }

    fn disarm(&mut self) {
        self.deadline = None;
        self.publish();
    }

    /// Records why the call ends; the loop exits and teardown follows.
    fn finish(&mut self, reason: EndReason) {
        if self.end_reason.is_some() {
            return;
        }
        info!(room = ?self.snap.room_id, uid = self.local_uid(), reason = %reason, "call finishing");
        self.end_reason = Some(reason);
        self.deadline = None;
    }

    fn end_error(&self) -> Option<CallError> {
        self.end_reason.and_then(|r| r.as_error())
    }

    fn invalid(&self, op: &'static str) -> CallError {
        CallError::InvalidState {
            op,
            state: self.snap.state,
        }
    }

    fn refuse(&self, cmd: Command) {
        let state = self.snap.state;
        match cmd {
            Command::End { reply } => {
                let _ = reply.send(Ok(()));
            }
            Command::Mute { reply, .. } => {
                let _ = reply.send(Ok(()));
            }
            Command::Start { reply, .. } => {
                let _ = reply.send(Err(CallError::InvalidState { op: "start_call", state }));
            }
            Command::Accept { reply } => {
                let _ = reply.send(Err(CallError::InvalidState { op: "accept_call", state }));
            }
            Command::Reject { reply } => {
                let _ = reply.send(Err(CallError::InvalidState { op: "reject_call", state }));
            }
        }
    }

    fn message(&self, payload: SignalPayload) -> Option<(Uid, SignalingMessage)> {
        let remote = self.snap.remote_uid?;
        let room = self.snap.room_id.clone()?;
        Some((remote, SignalingMessage::new(self.local_uid(), room, payload)))
    }

    async fn send_to_remote(&self, payload: SignalPayload) -> anyhow::Result<()> {
        let Some((target, msg)) = self.message(payload) else {
            return Ok(());
        };
        let kind = msg.kind();
        self.deps.transport.send(target, msg).await.map_err(|e| {
            warn!(room = ?self.snap.room_id, kind, "signaling send failed: {e:#}");
            e
        })
    }

    async fn start_ringing(&mut self) {
        let Some(room) = self.snap.room_id.clone() else {
            self.finish(EndReason::SignalingUnreachable);
            return;
        };
        match self.deps.transport.join(&room).await {
            Ok(sub) => {
                self.joined = Some(sub.id());
                self.sub = Some(sub);
            }
            Err(e) => {
                warn!(room = %room, "join failed: {e:#}");
                self.finish(EndReason::SignalingUnreachable);
                return;
            }
        }
        self.transition(CallState::Ringing);
        let timeout = self.config().invite_timeout();
        self.arm(Timer::Ring, timeout);
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { target, kind, reply } => {
                let res = self.start_call(target, kind).await;
                let _ = reply.send(res);
            }
            Command::Accept { reply } => {
                let res = self.accept_call().await;
                let _ = reply.send(res);
            }
            Command::Reject { reply } => {
                let res = self.reject_call().await;
                let _ = reply.send(res);
            }
            Command::End { reply } => {
                self.end_replies.push(reply);
                self.finish(EndReason::LocalHangup);
            }
            Command::Mute { kind, muted, reply } => {
                self.set_muted(kind, muted);
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn start_call(&mut self, target: Uid, kind: CallKind) -> Result<(), CallError> {
        if self.snap.state != CallState::Idle {
            return Err(self.invalid("start_call"));
        }
        if target == self.local_uid() {
            return Err(CallError::Negotiation("cannot call yourself".to_string()));
        }
        let room = room_id_for(self.local_uid(), target);
        self.snap.role = Some(CallRole::Caller);
        self.snap.remote_uid = Some(target);
        self.snap.call_kind = Some(kind);
        self.snap.room_id = Some(room.clone());
        self.snap.started_at_ms = Some(now_ms());
        self.transition(CallState::Inviting);

        match self.deps.transport.join(&room).await {
            Ok(sub) => {
                self.joined = Some(sub.id());
                self.sub = Some(sub);
            }
            Err(e) => {
                warn!(room = %room, "join failed: {e:#}");
                self.finish(EndReason::SignalingUnreachable);
                return Err(CallError::SignalingUnreachable(format!("{e:#}")));
            }
        }
        let invite = SignalPayload::CallInvite {
            call_kind: kind,
            caller_name: self.deps.display_name.clone(),
        };
        if let Err(e) = self.send_to_remote(invite).await {
            self.finish(EndReason::SignalingUnreachable);
            return Err(CallError::SignalingUnreachable(format!("{e:#}")));
        }
        self.transition(CallState::Ringing);
        let timeout = self.config().invite_timeout();
        self.arm(Timer::Ring, timeout);
        Ok(())
    }

    async fn accept_call(&mut self) -> Result<(), CallError> {
        if self.snap.role != Some(CallRole::Callee) || self.snap.state != CallState::Ringing {
            return Err(self.invalid("accept_call"));
        }
        if let Err(e) = self.send_to_remote(SignalPayload::CallAccept).await {
            self.finish(EndReason::SignalingUnreachable);
            return Err(CallError::SignalingUnreachable(format!("{e:#}")));
        }
        self.enter_negotiating().await;
        match self.end_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn reject_call(&mut self) -> Result<(), CallError> {
        if self.snap.role != Some(CallRole::Callee) || self.snap.state != CallState::Ringing {
            return Err(self.invalid("reject_call"));
        }
        // Best effort; the caller's ring timer covers a lost reject.
        let _ = self.send_to_remote(SignalPayload::CallReject).await;
        self.finish(EndReason::LocalRejected);
        Ok(())
    }

    fn set_muted(&mut self, kind: TrackKind, muted: bool) {
        match kind {
            TrackKind::Audio => self.snap.audio_muted = muted,
            TrackKind::Video => self.snap.video_muted = muted,
        }
        if let Some(stream) = &self.local_stream {
            let n = stream.set_enabled(kind, !muted);
            debug!(?kind, muted, tracks = n, "local tracks toggled");
        }
        self.publish();
    }

    async fn enter_negotiating(&mut self) {
        self.transition(CallState::Negotiating);
        let timeout = self.config().negotiation_timeout();
        self.arm(Timer::Negotiation, timeout);

        let kind = self.snap.call_kind.unwrap_or(CallKind::Audio);
        let stream = match self.deps.media.get_local_media(kind).await {
            Ok(s) => Some(s),
            Err(MediaError::PermissionDenied(msg)) => {
                warn!(room = ?self.snap.room_id, "media permission denied: {msg}");
                self.finish(EndReason::MediaPermissionDenied);
                return;
            }
            Err(MediaError::Unavailable(msg)) => {
                warn!(room = ?self.snap.room_id, "no local media, continuing receive-only: {msg}");
                None
            }
        };

        let Some(remote) = self.snap.remote_uid else {
            self.finish(EndReason::ConnectionFailed);
            return;
        };
        let mut coordinator = NegotiationCoordinator::new(
            self.local_uid(),
            remote,
            self.deps.peers.clone(),
            self.config().ice_servers(),
            self.config().answer_cooldown(),
            self.peer_tx.clone(),
        );
        coordinator.hold_candidates(std::mem::take(&mut self.held_candidates));

        let mut tracks = Vec::new();
        if let Some(stream) = stream {
            stream.set_enabled(TrackKind::Audio, !self.snap.audio_muted);
            stream.set_enabled(TrackKind::Video, !self.snap.video_muted);
            tracks = stream.tracks.clone();
            self.emit(CallEvent::LocalStream(stream.clone()));
            self.local_stream = Some(stream);
        }
        let attached = coordinator.attach_local_tracks(&tracks).await;
        self.coordinator = Some(coordinator);
        if let Err(e) = attached {
            self.fail_negotiation(e);
            return;
        }

        let step = match (self.early_offer.take(), self.coordinator.as_mut()) {
            (Some(sdp), Some(c)) => c.handle_remote_offer(sdp).await,
            (None, Some(c)) if c.is_offerer() => c.create_offer().await,
            _ => return,
        };
        self.apply_step(step).await;
    }

    fn fail_negotiation(&mut self, e: anyhow::Error) {
        warn!(room = ?self.snap.room_id, "negotiation failed: {e:#}");
        self.emit(CallEvent::Error(CallError::negotiation(e)));
        self.finish(EndReason::ConnectionFailed);
    }

    async fn apply_step(&mut self, step: anyhow::Result<Step>) {
        match step {
            Ok(Step::Send(payload)) => {
                if let Err(e) = self.send_to_remote(payload).await {
                    self.emit(CallEvent::Error(CallError::transport(e)));
                }
            }
            Ok(Step::Ignored(reason)) => debug!(room = ?self.snap.room_id, ?reason, "signaling message ignored"),
            Ok(Step::Applied) | Ok(Step::Queued(_)) => {}
            Err(e) => self.fail_negotiation(e),
        }
    }

    async fn on_transport_event(&mut self, ev: TransportEvent) {
        match ev {
            TransportEvent::Message(msg) => self.on_message(msg).await,
            TransportEvent::PeerUnavailable { target_uid, reason } => {
                let waiting = matches!(self.snap.state, CallState::Inviting | CallState::Ringing);
                if reason == DELIVERY_QUEUE_FULL {
                    // The peer is online; timeouts cover a message that never arrives.
                    warn!(room = ?self.snap.room_id, peer = target_uid, "peer queue full, message dropped");
                    self.emit(CallEvent::Error(CallError::Transport(format!("delivery to {target_uid} failed: {reason}"))));
                } else if waiting && Some(target_uid) == self.snap.remote_uid {
                    info!(room = ?self.snap.room_id, peer = target_uid, "peer unavailable: {reason}");
                    self.finish(EndReason::PeerOffline);
                } else {
                    debug!(peer = target_uid, "delivery failure ignored: {reason}");
                }
            }
            TransportEvent::Unreachable(reason) => {
                if self.snap.state == CallState::Connected {
                    // Media is peer to peer; only a later hangup is affected.
                    warn!(room = ?self.snap.room_id, "signaling lost during call: {reason}");
                } else {
                    warn!(room = ?self.snap.room_id, "signaling unreachable: {reason}");
                    self.finish(EndReason::SignalingUnreachable);
                }
            }
            TransportEvent::Reconnected => {
                info!(room = ?self.snap.room_id, "signaling reconnected");
            }
        }
    }

    async fn on_message(&mut self, msg: SignalingMessage) {
        if msg.sender_uid == self.local_uid() || self.snap.room_id.as_deref() != Some(msg.room_id.as_str()) {
            return;
        }
        if self.snap.remote_uid != Some(msg.sender_uid) {
            debug!(room = %msg.room_id, sender = msg.sender_uid, "message from third party ignored");
            return;
        }
        let state = self.snap.state;
        let caller_ringing = self.snap.role == Some(CallRole::Caller) && state == CallState::Ringing;
        let callee_ringing = self.snap.role == Some(CallRole::Callee) && state == CallState::Ringing;
        let negotiating = matches!(state, CallState::Negotiating | CallState::Connected);

        match msg.payload {
            SignalPayload::CallInvite { .. } if caller_ringing => {
                info!(room = %msg.room_id, "crossed invites, accepting");
                if let Err(e) = self.send_to_remote(SignalPayload::CallAccept).await {
                    self.emit(CallEvent::Error(CallError::transport(e)));
                }
                self.enter_negotiating().await;
            }
            SignalPayload::CallAccept if caller_ringing => self.enter_negotiating().await,
            SignalPayload::CallReject => self.finish(EndReason::Rejected),
            SignalPayload::CallEnd | SignalPayload::Leave => self.finish(EndReason::RemoteHangup),
            SignalPayload::Offer { sdp } if caller_ringing => {
                self.early_offer = Some(sdp);
                self.enter_negotiating().await;
            }
            SignalPayload::Offer { sdp } if callee_ringing => {
                debug!(room = %msg.room_id, "offer before accept held");
                self.early_offer = Some(sdp);
            }
            SignalPayload::Offer { sdp } if negotiating => {
                if let Some(c) = self.coordinator.as_mut() {
                    let step = c.handle_remote_offer(sdp).await;
                    self.apply_step(step).await;
                }
            }
            SignalPayload::Answer { sdp } if caller_ringing || negotiating => {
                if caller_ringing {
                    self.enter_negotiating().await;
                }
                if let Some(c) = self.coordinator.as_mut() {
                    let step = c.handle_remote_answer(sdp).await;
                    self.apply_step(step).await;
                }
            }
            SignalPayload::IceCandidate { candidate } => match self.coordinator.as_mut() {
                Some(c) => {
                    let step = c.handle_remote_candidate(candidate).await;
                    self.apply_step(step).await;
                }
                None => self.held_candidates.push(candidate),
            },
            other => debug!(room = %msg.room_id, kind = other.kind(), state = state.as_str(), "message ignored"),
        }
    }

    async fn on_peer_event(&mut self, ev: PeerEvent) {
        let Some(kind) = self.coordinator.as_mut().and_then(|c| c.accept_event(ev)) else {
            return;
        };
        match kind {
            PeerEventKind::LocalCandidate(candidate) => {
                let _ = self.send_to_remote(SignalPayload::IceCandidate { candidate }).await;
            }
            PeerEventKind::StateChanged(st) => {
                self.snap.connection_state = st;
                self.emit(CallEvent::ConnectionStateChanged(st));
                self.publish();
                match st {
                    PeerConnectionState::Connected if self.snap.state == CallState::Negotiating => {
                        self.snap.established_at_ms = Some(now_ms());
                        self.disarm();
                        self.transition(CallState::Connected);
                    }
                    PeerConnectionState::Failed => self.finish(EndReason::ConnectionFailed),
                    PeerConnectionState::Disconnected => {
                        warn!(room = ?self.snap.room_id, "peer connection disconnected");
                    }
                    _ => {}
                }
            }
            PeerEventKind::RemoteTrack(track) => {
                if let Some(uid) = self.snap.remote_uid {
                    self.emit(CallEvent::RemoteStream { uid, track });
                }
            }
        }
    }

    fn on_timer(&mut self) {
        let Some((_, timer)) = self.deadline.take() else {
            return;
        };
        match timer {
            Timer::Ring => self.finish(EndReason::NoAnswer),
            Timer::Negotiation => self.finish(EndReason::NegotiationTimeout),
        }
    }

    async fn teardown(&mut self) {
        let reason = self.end_reason.unwrap_or(EndReason::LocalHangup);
        self.deadline = None;

        if reason.notifies_remote() && self.snap.state != CallState::Idle {
            let _ = self.send_to_remote(SignalPayload::CallEnd).await;
        }
        self.sub = None;
        if let (Some(subscription), Some(room)) = (self.joined.take(), self.snap.room_id.clone()) {
            if let Err(e) = self.deps.transport.leave(&room, subscription).await {
                warn!(room = %room, "leave failed: {e:#}");
            }
        }
        if let Some(c) = self.coordinator.as_mut() {
            c.close().await;
        }
        if let Some(stream) = self.local_stream.take() {
            self.deps.media.release_media(&stream).await;
        }

        self.snap.connection_state = PeerConnectionState::Closed;
        self.snap.end_reason = Some(reason);
        if let Some(e) = reason.as_error() {
            self.emit(CallEvent::Error(e));
        }
        self.transition(reason.terminal_state());
        self.publish();
        self.emit(CallEvent::Ended {
            state: self.snap.state,
            reason,
        });
        for reply in self.end_replies.drain(..) {
            let _ = reply.send(Ok(()));
        }
    }
}
