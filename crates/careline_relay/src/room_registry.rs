/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! In-memory rendezvous buffers for clients on the polling transport.
//!
//! The room table lock is only held to look up or insert a room handle; every
//! read and write of a room's buffers goes through that room's own mutex, so
//! unrelated calls never wait on each other.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use careline_protocol::{now_ms, IceCandidate, PollResponse, PostedEntry, SessionDescription, SignalPayload, Uid};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

pub const MAX_PARTICIPANTS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("room full")]
    RoomFull,
    #[error("queue full")]
    QueueFull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomHandle {
    pub room_id: String,
    pub participants: Vec<Uid>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub rooms: usize,
    pub entries: usize,
}

struct Room {
    epoch: u64,
    participants: BTreeSet<Uid>,
    offers: Vec<PostedEntry<SessionDescription>>,
    answers: Vec<PostedEntry<SessionDescription>>,
    ice_candidates: Vec<PostedEntry<IceCandidate>>,
    controls: Vec<PostedEntry<SignalPayload>>,
    next_seq: u64,
    last_activity: Instant,
    // Set once the room has been removed from the table; late holders of the handle must look it up again.
    closed: bool,
}

impl Room {
    fn new() -> Self {
        Self {
            // Never zero; zero is the epoch of a room that does not exist.
            epoch: rand::random::<u64>().max(1),
            participants: BTreeSet::new(),
            offers: Vec::new(),
            answers: Vec::new(),
            ice_candidates: Vec::new(),
            controls: Vec::new(),
            next_seq: 1,
            last_activity: Instant::now(),
            closed: false,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn entries(&self) -> usize {
        self.offers.len() + self.answers.len() + self.ice_candidates.len() + self.controls.len()
    }

    fn admit(&mut self, uid: Uid) -> Result<bool, RegistryError> {
        if self.participants.contains(&uid) {
            return Ok(false);
        }
        if self.participants.len() >= MAX_PARTICIPANTS {
            return Err(RegistryError::RoomFull);
        }
        self.participants.insert(uid);
        Ok(true)
    }

    fn handle(&self, room_id: &str) -> RoomHandle {
        RoomHandle {
            room_id: room_id.to_string(),
            participants: self.participants.iter().copied().collect(),
        }
    }

    fn append(&mut self, sender_uid: Uid, payload: SignalPayload) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let timestamp_ms = now_ms();
        match payload {
            SignalPayload::Offer { sdp } => self.offers.push(PostedEntry {
                seq,
                sender_uid,
                payload: SessionDescription::offer(sdp),
                timestamp_ms,
            }),
            SignalPayload::Answer { sdp } => self.answers.push(PostedEntry {
                seq,
                sender_uid,
                payload: SessionDescription::answer(sdp),
                timestamp_ms,
            }),
            SignalPayload::IceCandidate { candidate } => self.ice_candidates.push(PostedEntry {
                seq,
                sender_uid,
                payload: candidate,
                timestamp_ms,
            }),
            other => self.controls.push(PostedEntry {
                seq,
                sender_uid,
                payload: other,
                timestamp_ms,
            }),
        }
        seq
    }

    fn snapshot_for(&self, uid: Uid) -> PollResponse {
        fn not_from<T: Clone>(entries: &[PostedEntry<T>], uid: Uid) -> Vec<PostedEntry<T>> {
            entries.iter().filter(|e| e.sender_uid != uid).cloned().collect()
        }
        PollResponse {
            epoch: self.epoch,
            offers: not_from(&self.offers, uid),
            answers: not_from(&self.answers, uid),
            ice_candidates: not_from(&self.ice_candidates, uid),
            controls: not_from(&self.controls, uid),
        }
    }
}

pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Mutex<Room>>>>,
    max_entries_per_room: usize,
}

impl RoomRegistry {
    pub fn new(max_entries_per_room: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            max_entries_per_room: max_entries_per_room.max(1),
        }
    }

    async fn get(&self, room_id: &str) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    async fn get_or_create(&self, room_id: &str) -> Arc<Mutex<Room>> {
        if let Some(room) = self.get(room_id).await {
            return room;
        }
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                debug!(room = %room_id, "room created");
                Arc::new(Mutex::new(Room::new()))
            })
            .clone()
    }

    async fn remove_if_same(&self, room_id: &str, handle: &Arc<Mutex<Room>>) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(room_id).is_some_and(|r| Arc::ptr_eq(r, handle)) {
            rooms.remove(room_id);
        }
    }

    /// Adds `uid` to the room, creating it if absent. Joining twice is a no-op.
    pub async fn join(&self, room_id: &str, uid: Uid) -> Result<RoomHandle, RegistryError> {
        loop {
            let handle = self.get_or_create(room_id).await;
            let mut room = handle.lock().await;
            if room.closed {
                continue;
            }
            room.touch();
            if room.admit(uid)? {
                info!(room = %room_id, uid, participants = room.participants.len(), "joined room");
            }
            return Ok(room.handle(room_id));
        }
    }

    /// Removes `uid`; the room and its buffers go away with the last participant.
    pub async fn leave(&self, room_id: &str, uid: Uid) -> bool {
        let Some(handle) = self.get(room_id).await else {
            return false;
        };
        let mut room = handle.lock().await;
        if room.closed {
            return false;
        }
        let removed = room.participants.remove(&uid);
        room.touch();
        if removed {
            info!(room = %room_id, uid, "left room");
        }
        if room.participants.is_empty() {
            room.closed = true;
            drop(room);
            self.remove_if_same(room_id, &handle).await;
            debug!(room = %room_id, "room removed");
        }
        removed
    }

    pub async fn post_offer(&self, room_id: &str, uid: Uid, offer: SessionDescription) -> Result<u64, RegistryError> {
        self.post(room_id, uid, SignalPayload::Offer { sdp: offer.sdp }).await
    }

    pub async fn post_answer(&self, room_id: &str, uid: Uid, answer: SessionDescription) -> Result<u64, RegistryError> {
        self.post(room_id, uid, SignalPayload::Answer { sdp: answer.sdp }).await
    }

    pub async fn post_ice_candidate(&self, room_id: &str, uid: Uid, candidate: IceCandidate) -> Result<u64, RegistryError> {
        self.post(room_id, uid, SignalPayload::IceCandidate { candidate }).await
    }

    pub async fn post_control(&self, room_id: &str, uid: Uid, message: SignalPayload) -> Result<u64, RegistryError> {
        self.post(room_id, uid, message).await
    }

    /// Appends to the buffer matching the payload kind. Posting implies presence, so
    /// the poster is joined first. Returns the entry's sequence number.
    async fn post(&self, room_id: &str, uid: Uid, payload: SignalPayload) -> Result<u64, RegistryError> {
        loop {
            let handle = self.get_or_create(room_id).await;
            let mut room = handle.lock().await;
            if room.closed {
                continue;
            }
            room.admit(uid)?;
            if room.entries() >= self.max_entries_per_room {
                return Err(RegistryError::QueueFull);
            }
            room.touch();
            let kind = payload.kind();
            let seq = room.append(uid, payload);
            debug!(room = %room_id, uid, seq, kind, "posted");
            return Ok(seq);
        }
    }

    /// Full snapshot of everything in the room not authored by `uid`.
    /// An unknown room is an empty snapshot.
    pub async fn poll(&self, room_id: &str, uid: Uid) -> PollResponse {
        let Some(handle) = self.get(room_id).await else {
            return PollResponse::default();
        };
        let mut room = handle.lock().await;
        if room.closed {
            return PollResponse::default();
        }
        room.touch();
        room.snapshot_for(uid)
    }

    /// Drops rooms with no activity for `ttl`. Returns how many were evicted.
    pub async fn cleanup_idle(&self, ttl: Duration) -> usize {
        let handles: Vec<(String, Arc<Mutex<Room>>)> = self
            .rooms
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut evicted = 0;
        for (room_id, handle) in handles {
            let mut room = handle.lock().await;
            if room.closed || room.last_activity.elapsed() < ttl {
                continue;
            }
            room.closed = true;
            drop(room);
            self.remove_if_same(&room_id, &handle).await;
            evicted += 1;
        }
        if evicted > 0 {
            info!(evicted, "evicted idle rooms");
        }
        evicted
    }

    pub async fn stats(&self) -> RegistryStats {
        let handles: Vec<Arc<Mutex<Room>>> = self.rooms.read().await.values().cloned().collect();
        let mut stats = RegistryStats {
            rooms: handles.len(),
            entries: 0,
        };
        for handle in handles {
            stats.entries += handle.lock().await.entries();
        }
        stats
    }
}
