/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Owns exactly one peer connection per call and applies SDP and ICE traffic
//! to it at most once.
//!
//! Every handler reports what it did as a [`Step`]. Duplicates delivered by an
//! at-least-once transport come back as [`Step::Ignored`] with the guard that
//! absorbed them, never as errors.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use careline_protocol::{IceCandidate, SessionDescription, SignalPayload, Uid};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::media::LocalTrack;
use crate::peer::{
    IceServerConfig, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, PeerEventKind,
    PeerEventSink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// No description on either side.
    Stable,
    /// Our offer is set locally; waiting for the answer.
    HaveLocalOffer,
    /// Remote offer applied and our answer sent.
    AnswerSent,
    /// Our offer was answered.
    Established,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    DuplicateOffer,
    AnswerCooldown,
    DuplicateAnswer,
    AnswerWithoutOffer,
    OfferInProgress,
    GlareKeptLocalOffer,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Deliver this payload to the remote peer.
    Send(SignalPayload),
    Applied,
    /// Candidate held until a remote description exists; carries the queue length.
    Queued(usize),
    Ignored(IgnoreReason),
}

pub struct NegotiationCoordinator {
    local_uid: Uid,
    remote_uid: Uid,
    factory: Arc<dyn PeerConnectionFactory>,
    ice: Vec<IceServerConfig>,
    events: mpsc::UnboundedSender<PeerEvent>,
    peer: Option<Box<dyn PeerConnection>>,
    generation: u64,
    phase: NegotiationPhase,
    answer_cooldown: Duration,
    last_answer_at: Option<Instant>,
    pending_candidates: Vec<IceCandidate>,
    local_tracks: Vec<LocalTrack>,
    connection_state: PeerConnectionState,
}

impl NegotiationCoordinator {
    pub fn new(
        local_uid: Uid,
        remote_uid: Uid,
        factory: Arc<dyn PeerConnectionFactory>,
        ice: Vec<IceServerConfig>,
        answer_cooldown: Duration,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            local_uid,
            remote_uid,
            factory,
            ice,
            events,
            peer: None,
            generation: 0,
            phase: NegotiationPhase::Stable,
            answer_cooldown,
            last_answer_at: None,
            pending_candidates: Vec::new(),
            local_tracks: Vec::new(),
            connection_state: PeerConnectionState::New,
        }
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        self.connection_state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// The lower uid offers; the same rule settles glare.
    pub fn is_offerer(&self) -> bool {
        self.local_uid < self.remote_uid
    }

    fn has_remote_description(&self) -> bool {
        matches!(self.phase, NegotiationPhase::AnswerSent | NegotiationPhase::Established)
    }

    async fn ensure_peer(&mut self) -> Result<()> {
        if self.peer.is_some() {
            return Ok(());
        }
        self.generation += 1;
        let sink = PeerEventSink::new(self.generation, self.events.clone());
        let peer = self.factory.create(&self.ice, sink).await?;
        for track in &self.local_tracks {
            peer.add_local_track(track).await?;
        }
        debug!(generation = self.generation, tracks = self.local_tracks.len(), "peer connection created");
        self.peer = Some(peer);
        self.connection_state = PeerConnectionState::New;
        Ok(())
    }

    fn peer(&self) -> Result<&dyn PeerConnection> {
        self.peer.as_deref().ok_or_else(|| anyhow!("no peer connection"))
    }

    /// Creates the connection (if needed) and attaches the tracks. They are
    /// re-attached to any replacement connection.
    pub async fn attach_local_tracks(&mut self, tracks: &[LocalTrack]) -> Result<()> {
        if self.phase == NegotiationPhase::Closed {
            return Ok(());
        }
        self.local_tracks.extend(tracks.iter().cloned());
        if let Some(peer) = self.peer.as_deref() {
            for t in tracks {
                peer.add_local_track(t).await?;
            }
            return Ok(());
        }
        self.ensure_peer().await
    }

    /// Candidates that reached the session before this coordinator existed.
    pub fn hold_candidates(&mut self, candidates: Vec<IceCandidate>) {
        self.pending_candidates.extend(candidates);
    }

    pub async fn create_offer(&mut self) -> Result<Step> {
        match self.phase {
            NegotiationPhase::Closed => return Ok(Step::Ignored(IgnoreReason::Closed)),
            NegotiationPhase::Stable => {}
            _ => {
                warn!(phase = ?self.phase, "create_offer ignored: negotiation already started");
                return Ok(Step::Ignored(IgnoreReason::OfferInProgress));
            }
        }
        self.ensure_peer().await?;
        let peer = self.peer()?;
        let sdp = peer.create_offer().await?;
        peer.set_local_description(SessionDescription::offer(sdp.clone())).await?;
        self.phase = NegotiationPhase::HaveLocalOffer;
        info!(local = self.local_uid, remote = self.remote_uid, "offer created");
        Ok(Step::Send(SignalPayload::Offer { sdp }))
    }

    pub async fn handle_remote_offer(&mut self, sdp: String) -> Result<Step> {
        match self.phase {
            NegotiationPhase::Closed => return Ok(Step::Ignored(IgnoreReason::Closed)),
            NegotiationPhase::AnswerSent | NegotiationPhase::Established => {
                let cooling = self
                    .last_answer_at
                    .is_some_and(|t| t.elapsed() < self.answer_cooldown);
                let reason = if cooling {
                    IgnoreReason::AnswerCooldown
                } else {
                    IgnoreReason::DuplicateOffer
                };
                debug!(?reason, "remote offer ignored");
                return Ok(Step::Ignored(reason));
            }
            NegotiationPhase::HaveLocalOffer => {
                if self.is_offerer() {
                    info!(local = self.local_uid, remote = self.remote_uid, "glare resolved: keeping local offer");
                    return Ok(Step::Ignored(IgnoreReason::GlareKeptLocalOffer));
                }
                info!(local = self.local_uid, remote = self.remote_uid, "glare resolved: discarding local offer");
                self.discard_peer().await;
            }
            NegotiationPhase::Stable => {}
        }

        self.ensure_peer().await?;
        self.peer()?
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        let peer = self.peer()?;
        let answer = peer.create_answer().await?;
        peer.set_local_description(SessionDescription::answer(answer.clone()))
            .await?;
        self.phase = NegotiationPhase::AnswerSent;
        self.last_answer_at = Some(Instant::now());
        self.flush_candidates().await;
        info!(local = self.local_uid, remote = self.remote_uid, "answer created");
        Ok(Step::Send(SignalPayload::Answer { sdp: answer }))
    }

    pub async fn handle_remote_answer(&mut self, sdp: String) -> Result<Step> {
        match self.phase {
            NegotiationPhase::Closed => Ok(Step::Ignored(IgnoreReason::Closed)),
            NegotiationPhase::Established => {
                debug!("duplicate answer ignored");
                Ok(Step::Ignored(IgnoreReason::DuplicateAnswer))
            }
            NegotiationPhase::Stable | NegotiationPhase::AnswerSent => {
                warn!(phase = ?self.phase, "answer without a local offer ignored");
                Ok(Step::Ignored(IgnoreReason::AnswerWithoutOffer))
            }
            NegotiationPhase::HaveLocalOffer => {
                self.peer()?
                    .set_remote_description(SessionDescription::answer(sdp))
                    .await?;
                self.phase = NegotiationPhase::Established;
                self.flush_candidates().await;
                info!(local = self.local_uid, remote = self.remote_uid, "answer applied");
                Ok(Step::Applied)
            }
        }
    }

    pub async fn handle_remote_candidate(&mut self, candidate: IceCandidate) -> Result<Step> {
        if self.phase == NegotiationPhase::Closed {
            return Ok(Step::Ignored(IgnoreReason::Closed));
        }
        if !self.has_remote_description() || self.peer.is_none() {
            self.pending_candidates.push(candidate);
            return Ok(Step::Queued(self.pending_candidates.len()));
        }
        self.peer()?.add_ice_candidate(candidate).await?;
        Ok(Step::Applied)
    }

    async fn flush_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        if pending.is_empty() {
            return;
        }
        let Some(peer) = self.peer.as_deref() else {
            self.pending_candidates = pending;
            return;
        };
        let n = pending.len();
        for c in pending {
            if let Err(e) = peer.add_ice_candidate(c).await {
                warn!("queued candidate rejected: {e:#}");
            }
        }
        debug!(count = n, "flushed queued candidates");
    }

    async fn discard_peer(&mut self) {
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                warn!("close discarded peer failed: {e:#}");
            }
        }
        self.phase = NegotiationPhase::Stable;
    }

    /// Filters events from replaced connections and tracks the connection state.
    pub fn accept_event(&mut self, ev: PeerEvent) -> Option<PeerEventKind> {
        if ev.generation != self.generation || self.phase == NegotiationPhase::Closed {
            debug!(generation = ev.generation, current = self.generation, "stale peer event dropped");
            return None;
        }
        if let PeerEventKind::StateChanged(st) = &ev.kind {
            if *st == self.connection_state {
                return None;
            }
            self.connection_state = *st;
        }
        Some(ev.kind)
    }

    pub async fn close(&mut self) {
        if self.phase == NegotiationPhase::Closed {
            return;
        }
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                warn!("close peer failed: {e:#}");
            }
        }
        self.pending_candidates.clear();
        self.local_tracks.clear();
        self.phase = NegotiationPhase::Closed;
        self.connection_state = PeerConnectionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        offers: AtomicUsize,
        answers: AtomicUsize,
        remote_descriptions: AtomicUsize,
        candidates: AtomicUsize,
        tracks: AtomicUsize,
        closed: AtomicUsize,
    }

    struct FakePeer {
        n: Arc<Counters>,
        applied: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl PeerConnection for FakePeer {
        async fn add_local_track(&self, _track: &LocalTrack) -> Result<()> {
            self.n.tracks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn create_offer(&self) -> Result<String> {
            self.n.offers.fetch_add(1, Ordering::SeqCst);
            Ok("offer-sdp".into())
        }
        async fn create_answer(&self) -> Result<String> {
            self.n.answers.fetch_add(1, Ordering::SeqCst);
            Ok("answer-sdp".into())
        }
        async fn set_local_description(&self, _desc: SessionDescription) -> Result<()> {
            Ok(())
        }
        async fn set_remote_description(&self, _desc: SessionDescription) -> Result<()> {
            self.n.remote_descriptions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            self.n.candidates.fetch_add(1, Ordering::SeqCst);
            self.applied.lock().unwrap().push(candidate.candidate);
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            self.n.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeFactory {
        n: Arc<Counters>,
        applied: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl PeerConnectionFactory for FakeFactory {
        async fn create(&self, _ice: &[IceServerConfig], _events: PeerEventSink) -> Result<Box<dyn PeerConnection>> {
            self.n.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakePeer {
                n: self.n.clone(),
                applied: self.applied.clone(),
            }))
        }
    }

    fn coordinator(local: Uid, remote: Uid) -> (NegotiationCoordinator, Arc<Counters>, Arc<Mutex<Vec<String>>>) {
        let n = Arc::new(Counters::default());
        let applied = Arc::new(Mutex::new(Vec::new()));
        let factory = Arc::new(FakeFactory {
            n: n.clone(),
            applied: applied.clone(),
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let c = NegotiationCoordinator::new(local, remote, factory, vec![], Duration::from_millis(500), tx);
        (c, n, applied)
    }

    fn cand(s: &str) -> IceCandidate {
        IceCandidate {
            candidate: s.into(),
            sdp_mid: None,
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn second_offer_attempt_is_a_no_op() {
        let (mut c, n, _) = coordinator(5, 9);
        assert!(matches!(c.create_offer().await.unwrap(), Step::Send(SignalPayload::Offer { .. })));
        assert_eq!(
            c.create_offer().await.unwrap(),
            Step::Ignored(IgnoreReason::OfferInProgress)
        );
        assert_eq!(n.offers.load(Ordering::SeqCst), 1);
        assert_eq!(c.phase(), NegotiationPhase::HaveLocalOffer);
    }

    #[tokio::test]
    async fn answer_applies_once() {
        let (mut c, n, _) = coordinator(5, 9);
        c.create_offer().await.unwrap();
        assert_eq!(c.handle_remote_answer("a".into()).await.unwrap(), Step::Applied);
        let state = c.connection_state();
        assert_eq!(
            c.handle_remote_answer("a".into()).await.unwrap(),
            Step::Ignored(IgnoreReason::DuplicateAnswer)
        );
        assert_eq!(n.remote_descriptions.load(Ordering::SeqCst), 1);
        assert_eq!(c.connection_state(), state);
        assert_eq!(c.phase(), NegotiationPhase::Established);
    }

    #[tokio::test]
    async fn answer_without_offer_is_ignored() {
        let (mut c, n, _) = coordinator(5, 9);
        assert_eq!(
            c.handle_remote_answer("a".into()).await.unwrap(),
            Step::Ignored(IgnoreReason::AnswerWithoutOffer)
        );
        assert_eq!(n.remote_descriptions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn glare_lower_uid_keeps_its_offer() {
        let (mut c, n, _) = coordinator(5, 9);
        c.create_offer().await.unwrap();
        assert_eq!(
            c.handle_remote_offer("theirs".into()).await.unwrap(),
            Step::Ignored(IgnoreReason::GlareKeptLocalOffer)
        );
        assert_eq!(c.phase(), NegotiationPhase::HaveLocalOffer);
        assert_eq!(n.answers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn glare_higher_uid_discards_and_answers() {
        let (mut c, n, _) = coordinator(9, 5);
        c.attach_local_tracks(&[LocalTrack::new("a", TrackKind::Audio)]).await.unwrap();
        c.create_offer().await.unwrap();
        let first_gen = c.generation();

        let step = c.handle_remote_offer("theirs".into()).await.unwrap();
        assert!(matches!(step, Step::Send(SignalPayload::Answer { .. })));
        assert_eq!(c.phase(), NegotiationPhase::AnswerSent);
        assert_eq!(c.generation(), first_gen + 1);
        assert_eq!(n.closed.load(Ordering::SeqCst), 1);
        assert_eq!(n.created.load(Ordering::SeqCst), 2);
        // Local track re-attached to the replacement connection.
        assert_eq!(n.tracks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_offers_do_not_create_new_answers() {
        let (mut c, n, _) = coordinator(9, 5);
        assert!(matches!(c.handle_remote_offer("o".into()).await.unwrap(), Step::Send(_)));
        assert_eq!(
            c.handle_remote_offer("o".into()).await.unwrap(),
            Step::Ignored(IgnoreReason::AnswerCooldown)
        );
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            c.handle_remote_offer("o".into()).await.unwrap(),
            Step::Ignored(IgnoreReason::DuplicateOffer)
        );
        assert_eq!(n.answers.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn early_candidates_are_applied_after_remote_description() {
        let (mut c, n, applied) = coordinator(5, 9);
        c.hold_candidates(vec![cand("held")]);
        c.create_offer().await.unwrap();
        assert_eq!(c.handle_remote_candidate(cand("early")).await.unwrap(), Step::Queued(2));
        assert_eq!(n.candidates.load(Ordering::SeqCst), 0);

        c.handle_remote_answer("a".into()).await.unwrap();
        assert_eq!(c.pending_candidates(), 0);
        assert_eq!(*applied.lock().unwrap(), vec!["held".to_string(), "early".to_string()]);

        assert_eq!(c.handle_remote_candidate(cand("late")).await.unwrap(), Step::Applied);
        assert_eq!(n.candidates.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stale_generation_events_are_dropped() {
        let (mut c, _, _) = coordinator(9, 5);
        c.create_offer().await.unwrap();
        let old = c.generation();
        c.handle_remote_offer("o".into()).await.unwrap();
        let stale = PeerEvent {
            generation: old,
            kind: PeerEventKind::StateChanged(PeerConnectionState::Failed),
        };
        assert!(c.accept_event(stale).is_none());
        let current = PeerEvent {
            generation: c.generation(),
            kind: PeerEventKind::StateChanged(PeerConnectionState::Connected),
        };
        assert!(c.accept_event(current).is_some());
        assert_eq!(c.connection_state(), PeerConnectionState::Connected);
    }

    #[tokio::test]
    async fn closed_coordinator_ignores_everything() {
        let (mut c, n, _) = coordinator(5, 9);
        c.create_offer().await.unwrap();
        c.close().await;
        assert_eq!(c.phase(), NegotiationPhase::Closed);
        assert_eq!(c.connection_state(), PeerConnectionState::Closed);
        assert_eq!(n.closed.load(Ordering::SeqCst), 1);
        assert_eq!(
            c.handle_remote_answer("a".into()).await.unwrap(),
            Step::Ignored(IgnoreReason::Closed)
        );
        assert_eq!(
            c.handle_remote_candidate(cand("x")).await.unwrap(),
            Step::Ignored(IgnoreReason::Closed)
        );
        c.close().await;
        assert_eq!(n.closed.load(Ordering::SeqCst), 1);
    }
}
