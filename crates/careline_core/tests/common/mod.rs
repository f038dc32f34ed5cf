/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use careline_core::media::{LocalStream, LocalTrack, MediaError, MediaProvider, RemoteTrack, TrackKind};
use careline_core::peer::{
    IceServerConfig, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEventKind, PeerEventSink,
};
use careline_core::transport::{RoomRouter, RoomSubscription, SignalingTransport, TransportEvent};
use careline_core::{CallConfig, CallDeps, CallSession, CallSnapshot};
use careline_protocol::{CallKind, IceCandidate, SessionDescription, SignalingMessage, Uid};
use tokio::sync::mpsc;

/// In-process stand-in for the push hub: user-addressed, drops messages for
/// users that are not registered and tells the sender.
#[derive(Default)]
pub struct LoopbackHub {
    users: Mutex<HashMap<Uid, Arc<RoomRouter>>>,
    sent: Mutex<Vec<(Uid, SignalingMessage)>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect(self: &Arc<Self>, uid: Uid) -> Arc<LoopbackTransport> {
        let router = Arc::new(RoomRouter::new());
        self.users.lock().unwrap().insert(uid, router.clone());
        Arc::new(LoopbackTransport {
            uid,
            hub: self.clone(),
            router,
        })
    }

    /// Kinds sent by `uid`, in order.
    pub fn sent_by(&self, uid: Uid) -> Vec<&'static str> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, m)| m.sender_uid == uid)
            .map(|(_, m)| m.kind())
            .collect()
    }

    pub fn count(&self, uid: Uid, kind: &str) -> usize {
        self.sent_by(uid).into_iter().filter(|k| *k == kind).count()
    }
}

pub struct LoopbackTransport {
    pub uid: Uid,
    hub: Arc<LoopbackHub>,
    pub router: Arc<RoomRouter>,
}

#[async_trait]
impl SignalingTransport for LoopbackTransport {
    fn local_uid(&self) -> Uid {
        self.uid
    }

    async fn join(&self, room_id: &str) -> Result<RoomSubscription> {
        self.router.subscribe(room_id)
    }

    async fn leave(&self, room_id: &str, subscription_id: u64) -> Result<()> {
        self.router.unsubscribe(room_id, subscription_id);
        Ok(())
    }

    async fn send(&self, target_uid: Uid, message: SignalingMessage) -> Result<()> {
        self.hub.sent.lock().unwrap().push((target_uid, message.clone()));
        let target = self.hub.users.lock().unwrap().get(&target_uid).cloned();
        match target {
            Some(router) => router.route(message),
            None => {
                self.router.notify(
                    &message.room_id,
                    TransportEvent::PeerUnavailable {
                        target_uid,
                        reason: "user not online".into(),
                    },
                );
            }
        }
        Ok(())
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<SignalingMessage>> {
        self.router.take_incoming()
    }
}

#[derive(Default)]
pub struct PeerStats {
    pub created: AtomicUsize,
    pub offers: AtomicUsize,
    pub answers: AtomicUsize,
    pub candidates: AtomicUsize,
    pub closed: AtomicUsize,
}

impl PeerStats {
    pub fn get(n: &AtomicUsize) -> usize {
        n.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PeerBehavior {
    /// Connects once both descriptions are set.
    Connect,
    /// Never leaves `Checking`.
    Stall,
    /// Reports `Failed` once both descriptions are set.
    Fail,
}

pub struct FakePeerFactory {
    pub stats: Arc<PeerStats>,
    behavior: PeerBehavior,
}

impl FakePeerFactory {
    pub fn new(behavior: PeerBehavior) -> Arc<Self> {
        Arc::new(Self {
            stats: Arc::new(PeerStats::default()),
            behavior,
        })
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(&self, _ice: &[IceServerConfig], events: PeerEventSink) -> Result<Box<dyn PeerConnection>> {
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePeer {
            stats: self.stats.clone(),
            behavior: self.behavior,
            events,
            local: AtomicBool::new(false),
            remote: AtomicBool::new(false),
            done: AtomicBool::new(false),
        }))
    }
}

struct FakePeer {
    stats: Arc<PeerStats>,
    behavior: PeerBehavior,
    events: PeerEventSink,
    local: AtomicBool,
    remote: AtomicBool,
    done: AtomicBool,
}

impl FakePeer {
    fn maybe_connect(&self) {
        if !self.local.load(Ordering::SeqCst) || !self.remote.load(Ordering::SeqCst) {
            return;
        }
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        self.events.emit(PeerEventKind::StateChanged(PeerConnectionState::Checking));
        self.events.emit(PeerEventKind::LocalCandidate(IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.1 50000 typ host", self.events.generation()),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        match self.behavior {
            PeerBehavior::Connect => {
                self.events.emit(PeerEventKind::StateChanged(PeerConnectionState::Connected));
                self.events.emit(PeerEventKind::RemoteTrack(RemoteTrack {
                    id: "remote-audio".into(),
                    kind: TrackKind::Audio,
                    handle: None,
                }));
            }
            PeerBehavior::Fail => {
                self.events.emit(PeerEventKind::StateChanged(PeerConnectionState::Failed));
            }
            PeerBehavior::Stall => {}
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_local_track(&self, _track: &LocalTrack) -> Result<()> {
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        self.stats.offers.fetch_add(1, Ordering::SeqCst);
        Ok("v=0 offer".into())
    }

    async fn create_answer(&self) -> Result<String> {
        self.stats.answers.fetch_add(1, Ordering::SeqCst);
        Ok("v=0 answer".into())
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<()> {
        self.local.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, _desc: SessionDescription) -> Result<()> {
        self.remote.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        self.stats.candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeMedia {
    pub deny: bool,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    pub streams: Mutex<Vec<LocalStream>>,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn denying() -> Arc<Self> {
        Arc::new(Self {
            deny: true,
            ..Self::default()
        })
    }

    pub fn last_stream(&self) -> Option<LocalStream> {
        self.streams.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl MediaProvider for FakeMedia {
    async fn get_local_media(&self, kind: CallKind) -> Result<LocalStream, MediaError> {
        if self.deny {
            return Err(MediaError::PermissionDenied("microphone".into()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let mut tracks = vec![LocalTrack::new("mic", TrackKind::Audio)];
        if kind == CallKind::Video {
            tracks.push(LocalTrack::new("cam", TrackKind::Video));
        }
        let stream = LocalStream {
            id: "local".into(),
            tracks,
        };
        self.streams.lock().unwrap().push(stream.clone());
        Ok(stream)
    }

    async fn release_media(&self, stream: &LocalStream) {
        self.released.fetch_add(1, Ordering::SeqCst);
        for t in &stream.tracks {
            t.set_enabled(false);
        }
    }
}

pub struct Party {
    pub uid: Uid,
    pub transport: Arc<LoopbackTransport>,
    pub peers: Arc<FakePeerFactory>,
    pub media: Arc<FakeMedia>,
}

impl Party {
    pub fn new(hub: &Arc<LoopbackHub>, uid: Uid) -> Self {
        Self::with(hub, uid, PeerBehavior::Connect, FakeMedia::new())
    }

    pub fn with(hub: &Arc<LoopbackHub>, uid: Uid, behavior: PeerBehavior, media: Arc<FakeMedia>) -> Self {
        Self {
            uid,
            transport: hub.connect(uid),
            peers: FakePeerFactory::new(behavior),
            media,
        }
    }

    pub fn deps(&self) -> CallDeps {
        CallDeps {
            transport: self.transport.clone(),
            peers: self.peers.clone(),
            media: self.media.clone(),
            config: CallConfig::default(),
            display_name: Some(format!("user {}", self.uid)),
        }
    }
}

pub async fn wait_state(session: &CallSession, pred: impl Fn(&CallSnapshot) -> bool) -> CallSnapshot {
    tokio::time::timeout(Duration::from_secs(120), session.wait_for(pred))
        .await
        .expect("timed out waiting for call state")
        .expect("session closed")
}
