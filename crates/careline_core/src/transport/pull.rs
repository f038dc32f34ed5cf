/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Room-addressed transport over the relay's `/signaling/*` HTTP API.
//!
//! Every joined room gets one poll task. Polls return the full room snapshot,
//! so entries are deduplicated by their sequence number within the room's
//! current epoch.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use careline_protocol::{
    AnswerRequest, ControlRequest, IceCandidateRequest, OfferRequest, PollResponse, RoomMembership,
    SessionDescription, SignalPayload, SignalingMessage, SuccessResponse, Uid,
};
use reqwest::Response;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{RoomRouter, RoomSubscription, SignalingTransport, TransportEvent};
use crate::backoff::send_with_retry;
use crate::config::CallConfig;

#[derive(Debug, Clone)]
pub struct PullConfig {
    /// `http://` or `https://` base of the relay.
    pub base_url: String,
    pub uid: Uid,
    pub poll_interval: Duration,
    /// Consecutive failed polls before the room is told the relay is unreachable.
    pub poll_failure_budget: u32,
    pub retry_attempts: u32,
    pub request_timeout: Duration,
}

impl PullConfig {
    pub fn new(base_url: impl Into<String>, uid: Uid, call: &CallConfig) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            uid,
            poll_interval: call.poll_interval(),
            poll_failure_budget: call.poll_failure_budget(),
            retry_attempts: 3,
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollMode {
    /// Joined: everything from the other participant is delivered.
    Session,
    /// Not joined: only invites are picked up.
    Watch,
}

struct PollTask {
    cancel: CancellationToken,
    mode: PollMode,
}

/// Sequence numbers already routed for one lifetime of a room.
#[derive(Default)]
struct SeenEntries {
    epoch: u64,
    seqs: HashSet<u64>,
}

type SeenMap = Arc<Mutex<HashMap<String, SeenEntries>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone)]
struct PollContext {
    http: reqwest::Client,
    base_url: String,
    uid: Uid,
    poll_interval: Duration,
    poll_failure_budget: u32,
    router: Arc<RoomRouter>,
    seen: SeenMap,
}

pub struct PullTransport {
    cfg: PullConfig,
    http: reqwest::Client,
    router: Arc<RoomRouter>,
    seen: SeenMap,
    polls: Mutex<HashMap<String, PollTask>>,
    watched: Mutex<HashSet<String>>,
}

impl PullTransport {
    pub fn new(cfg: PullConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            cfg,
            http,
            router: Arc::new(RoomRouter::new()),
            seen: Arc::new(Mutex::new(HashMap::new())),
            polls: Mutex::new(HashMap::new()),
            watched: Mutex::new(HashSet::new()),
        })
    }

    /// Number of running poll tasks, joined and watched rooms together.
    pub fn active_polls(&self) -> usize {
        lock(&self.polls).len()
    }

    /// Rooms polled as a joined participant.
    pub fn joined_polls(&self) -> usize {
        lock(&self.polls).values().filter(|t| t.mode == PollMode::Session).count()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/signaling/{path}", self.cfg.base_url)
    }

    fn context(&self) -> PollContext {
        PollContext {
            http: self.http.clone(),
            base_url: self.cfg.base_url.clone(),
            uid: self.cfg.uid,
            poll_interval: self.cfg.poll_interval,
            poll_failure_budget: self.cfg.poll_failure_budget,
            router: self.router.clone(),
            seen: self.seen.clone(),
        }
    }

    fn start_poll(&self, room_id: &str, mode: PollMode) {
        let cancel = CancellationToken::new();
        let prev = lock(&self.polls).insert(
            room_id.to_string(),
            PollTask {
                cancel: cancel.clone(),
                mode,
            },
        );
        if let Some(prev) = prev {
            prev.cancel.cancel();
        }
        debug!(room = %room_id, ?mode, "poll started");
        tokio::spawn(poll_loop(self.context(), room_id.to_string(), mode, cancel));
    }

    fn stop_poll(&self, room_id: &str) {
        if let Some(task) = lock(&self.polls).remove(room_id) {
            task.cancel.cancel();
            debug!(room = %room_id, mode = ?task.mode, "poll stopped");
        }
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<()> {
        let url = self.url(path);
        let resp = send_with_retry(|| self.http.post(&url).json(body), self.cfg.retry_attempts)
            .await
            .with_context(|| format!("POST {path}"))?;
        check_success(path, resp).await
    }
}

impl Drop for PullTransport {
    fn drop(&mut self) {
        for (_, task) in lock(&self.polls).drain() {
            task.cancel.cancel();
        }
    }
}

async fn check_success(path: &str, resp: Response) -> Result<()> {
    let status = resp.status();
    let body: Option<SuccessResponse> = resp.json().await.ok();
    match body {
        Some(b) if status.is_success() && b.success => Ok(()),
        Some(b) => bail!(
            "{path} failed: {status} {}",
            b.error.unwrap_or_else(|| "unknown error".to_string())
        ),
        None => bail!("{path} failed: {status}"),
    }
}

#[async_trait]
impl SignalingTransport for PullTransport {
    fn local_uid(&self) -> Uid {
        self.cfg.uid
    }

    async fn join(&self, room_id: &str) -> Result<RoomSubscription> {
        let sub = self.router.subscribe(room_id)?;
        let body = RoomMembership {
            room_id: room_id.to_string(),
            uid: self.cfg.uid,
        };
        if let Err(e) = self.post("join", &body).await {
            self.router.unsubscribe(room_id, sub.id());
            return Err(e);
        }
        self.start_poll(room_id, PollMode::Session);
        info!(room = %room_id, uid = self.cfg.uid, "joined room");
        Ok(sub)
    }

    async fn leave(&self, room_id: &str, subscription_id: u64) -> Result<()> {
        if !self.router.unsubscribe(room_id, subscription_id) {
            return Ok(());
        }
        self.stop_poll(room_id);
        if lock(&self.watched).contains(room_id) {
            self.start_poll(room_id, PollMode::Watch);
        }
        let body = RoomMembership {
            room_id: room_id.to_string(),
            uid: self.cfg.uid,
        };
        self.post("leave", &body).await?;
        info!(room = %room_id, uid = self.cfg.uid, "left room");
        Ok(())
    }

    async fn send(&self, target_uid: Uid, message: SignalingMessage) -> Result<()> {
        let uid = self.cfg.uid;
        let room_id = message.room_id;
        debug!(room = %room_id, target = target_uid, kind = message.payload.kind(), "post");
        match message.payload {
            SignalPayload::Offer { sdp } => {
                self.post(
                    "offer",
                    &OfferRequest {
                        room_id,
                        uid,
                        offer: SessionDescription::offer(sdp),
                    },
                )
                .await
            }
            SignalPayload::Answer { sdp } => {
                self.post(
                    "answer",
                    &AnswerRequest {
                        room_id,
                        uid,
                        answer: SessionDescription::answer(sdp),
                    },
                )
                .await
            }
            SignalPayload::IceCandidate { candidate } => {
                self.post("ice-candidate", &IceCandidateRequest { room_id, uid, candidate })
                    .await
            }
            message => self.post("control", &ControlRequest { room_id, uid, message }).await,
        }
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<SignalingMessage>> {
        self.router.take_incoming()
    }

    async fn watch(&self, room_id: &str) -> Result<()> {
        if !lock(&self.watched).insert(room_id.to_string()) {
            return Ok(());
        }
        if !self.router.is_joined(room_id) {
            self.start_poll(room_id, PollMode::Watch);
        }
        Ok(())
    }
}

async fn fetch(ctx: &PollContext, room_id: &str) -> Result<PollResponse> {
    let url = format!(
        "{}/signaling/poll?roomId={}&uid={}",
        ctx.base_url,
        urlencoding::encode(room_id),
        ctx.uid
    );
    let resp = ctx.http.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(anyhow!("poll returned {status}"));
    }
    Ok(resp.json::<PollResponse>().await?)
}

async fn poll_loop(ctx: PollContext, room_id: String, mode: PollMode, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(ctx.poll_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut failures: u32 = 0;
    let mut outage = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        let res = tokio::select! {
            _ = cancel.cancelled() => break,
            r = fetch(&ctx, &room_id) => r,
        };
        match res {
            Ok(snapshot) => {
                failures = 0;
                if outage {
                    outage = false;
                    info!(room = %room_id, "relay reachable again");
                    ctx.router.notify(&room_id, TransportEvent::Reconnected);
                }
                deliver(&ctx.router, &ctx.seen, &room_id, mode, snapshot);
            }
            Err(e) => {
                failures += 1;
                warn!(room = %room_id, failures, "poll failed: {e:#}");
                if failures >= ctx.poll_failure_budget && !outage {
                    outage = true;
                    ctx.router.notify(
                        &room_id,
                        TransportEvent::Unreachable(format!("relay unreachable after {failures} polls")),
                    );
                }
            }
        }
    }
    debug!(room = %room_id, ?mode, "poll loop stopped");
}

/// Routes entries not seen before. Sequence numbers restart whenever the relay
/// recreates the room, so a new epoch forgets everything seen in the old one.
fn deliver(
    router: &RoomRouter,
    seen: &Mutex<HashMap<String, SeenEntries>>,
    room_id: &str,
    mode: PollMode,
    snapshot: PollResponse,
) -> usize {
    let mut seen_map = lock(seen);
    if snapshot.is_empty() {
        seen_map.remove(room_id);
        return 0;
    }
    let seen = seen_map.entry(room_id.to_string()).or_default();
    if seen.epoch != snapshot.epoch {
        if seen.epoch != 0 {
            debug!(room = %room_id, old = seen.epoch, new = snapshot.epoch, "room recreated");
        }
        seen.epoch = snapshot.epoch;
        seen.seqs.clear();
    }
    let mut delivered = 0;
    for (seq, msg) in snapshot.into_messages(room_id) {
        if seen.seqs.contains(&seq) {
            continue;
        }
        if mode == PollMode::Watch && !matches!(msg.payload, SignalPayload::CallInvite { .. }) {
            continue;
        }
        seen.seqs.insert(seq);
        router.route(msg);
        delivered += 1;
    }
    delivered
}
