/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Wire types shared by the relay and the call clients.

use serde::{Deserialize, Serialize};

pub type Uid = u64;

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Rendezvous room for a call between `a` and `b`. Both sides derive the same name.
pub fn room_id_for(a: Uid, b: Uid) -> String {
    format!("call_{}_{}", a.min(b), a.max(b))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    Video,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Audio => "audio",
            CallKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    IceCandidate {
        candidate: IceCandidate,
    },
    Join,
    Leave,
    #[serde(rename_all = "camelCase")]
    CallInvite {
        call_kind: CallKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caller_name: Option<String>,
    },
    CallAccept,
    CallReject,
    CallEnd,
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::IceCandidate { .. } => "ice-candidate",
            SignalPayload::Join => "join",
            SignalPayload::Leave => "leave",
            SignalPayload::CallInvite { .. } => "call-invite",
            SignalPayload::CallAccept => "call-accept",
            SignalPayload::CallReject => "call-reject",
            SignalPayload::CallEnd => "call-end",
        }
    }

    /// Offer, answer and candidates travel on their own room buffers; everything else is call control.
    pub fn is_control(&self) -> bool {
        !matches!(
            self,
            SignalPayload::Offer { .. } | SignalPayload::Answer { .. } | SignalPayload::IceCandidate { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    pub sender_uid: Uid,
    pub room_id: String,
    pub timestamp_ms: i64,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

impl SignalingMessage {
    pub fn new(sender_uid: Uid, room_id: impl Into<String>, payload: SignalPayload) -> Self {
        Self {
            sender_uid,
            room_id: room_id.into(),
            timestamp_ms: now_ms(),
            payload,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

// Pull API (`/signaling/*`).

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMembership {
    pub room_id: String,
    pub uid: Uid,
}

pub type JoinRequest = RoomMembership;
pub type LeaveRequest = RoomMembership;
pub type PollQuery = RoomMembership;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferRequest {
    pub room_id: String,
    pub uid: Uid,
    pub offer: SessionDescription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRequest {
    pub room_id: String,
    pub uid: Uid,
    pub answer: SessionDescription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateRequest {
    pub room_id: String,
    pub uid: Uid,
    pub candidate: IceCandidate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    pub room_id: String,
    pub uid: Uid,
    pub message: SignalPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SuccessResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostedEntry<T> {
    /// Per-room sequence number, strictly increasing in posting order.
    pub seq: u64,
    pub sender_uid: Uid,
    pub payload: T,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    /// Identifies one lifetime of the room. A room that is deleted and created
    /// again gets a new epoch and restarts its sequence numbers. Zero when the
    /// room does not exist.
    #[serde(default)]
    pub epoch: u64,
    pub offers: Vec<PostedEntry<SessionDescription>>,
    pub answers: Vec<PostedEntry<SessionDescription>>,
    pub ice_candidates: Vec<PostedEntry<IceCandidate>>,
    #[serde(default)]
    pub controls: Vec<PostedEntry<SignalPayload>>,
}

impl PollResponse {
    pub fn is_empty(&self) -> bool {
        self.offers.is_empty() && self.answers.is_empty() && self.ice_candidates.is_empty() && self.controls.is_empty()
    }

    /// Flattens the snapshot back into messages, in posting order.
    pub fn into_messages(self, room_id: &str) -> Vec<(u64, SignalingMessage)> {
        let mut out = Vec::with_capacity(
            self.offers.len() + self.answers.len() + self.ice_candidates.len() + self.controls.len(),
        );
        let wrap = |e_seq: u64, sender_uid: Uid, timestamp_ms: i64, payload: SignalPayload| {
            (
                e_seq,
                SignalingMessage {
                    sender_uid,
                    room_id: room_id.to_string(),
                    timestamp_ms,
                    payload,
                },
            )
        };
        for e in self.offers {
            out.push(wrap(e.seq, e.sender_uid, e.timestamp_ms, SignalPayload::Offer { sdp: e.payload.sdp }));
        }
        for e in self.answers {
            out.push(wrap(e.seq, e.sender_uid, e.timestamp_ms, SignalPayload::Answer { sdp: e.payload.sdp }));
        }
        for e in self.ice_candidates {
            out.push(wrap(
                e.seq,
                e.sender_uid,
                e.timestamp_ms,
                SignalPayload::IceCandidate { candidate: e.payload },
            ));
        }
        for e in self.controls {
            out.push(wrap(e.seq, e.sender_uid, e.timestamp_ms, e.payload));
        }
        out.sort_by_key(|(seq, _)| *seq);
        out
    }
}

// Push hub (`/hub` WebSocket).

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum HubRequest {
    #[serde(rename_all = "camelCase")]
    SendMessage { target_uid: Uid, message: SignalingMessage },
    #[serde(rename_all = "camelCase")]
    AcceptCall { room_id: String, target_uid: Uid },
    #[serde(rename_all = "camelCase")]
    RejectCall { room_id: String, target_uid: Uid },
    #[serde(rename_all = "camelCase")]
    EndCall { room_id: String, target_uid: Uid },
    #[serde(rename_all = "camelCase")]
    SubscribePresence { uids: Vec<Uid> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HubConnectionState {
    Connected,
    Reconnecting,
    Disconnected,
}

/// `DeliveryFailed` reason when the target has no live hub connection.
pub const DELIVERY_OFFLINE: &str = "user not online";
/// `DeliveryFailed` reason when the target is online but its outgoing queue is full.
pub const DELIVERY_QUEUE_FULL: &str = "queue full";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum HubEvent {
    NewMessage {
        message: SignalingMessage,
    },
    #[serde(rename_all = "camelCase")]
    IncomingCall {
        room_id: String,
        caller_uid: Uid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caller_name: Option<String>,
        call_kind: CallKind,
        timestamp_ms: i64,
    },
    #[serde(rename_all = "camelCase")]
    CallAccepted { room_id: String, uid: Uid, timestamp_ms: i64 },
    #[serde(rename_all = "camelCase")]
    CallRejected { room_id: String, uid: Uid, timestamp_ms: i64 },
    #[serde(rename_all = "camelCase")]
    CallEnded { room_id: String, uid: Uid, timestamp_ms: i64 },
    #[serde(rename_all = "camelCase")]
    UserStatusChanged { uid: Uid, online: bool, timestamp_ms: i64 },
    #[serde(rename_all = "camelCase")]
    ConnectionStateChanged {
        state: HubConnectionState,
        connection_id: String,
    },
    #[serde(rename_all = "camelCase")]
    DeliveryFailed {
        target_uid: Uid,
        room_id: String,
        reason: String,
    },
}

impl HubEvent {
    /// The signaling message this hub event stands for, if it belongs to a call.
    pub fn into_signaling(self) -> Option<SignalingMessage> {
        let msg = match self {
            HubEvent::NewMessage { message } => message,
            HubEvent::IncomingCall {
                room_id,
                caller_uid,
                caller_name,
                call_kind,
                timestamp_ms,
            } => SignalingMessage {
                sender_uid: caller_uid,
                room_id,
                timestamp_ms,
                payload: SignalPayload::CallInvite { call_kind, caller_name },
            },
            HubEvent::CallAccepted { room_id, uid, timestamp_ms } => SignalingMessage {
                sender_uid: uid,
                room_id,
                timestamp_ms,
                payload: SignalPayload::CallAccept,
            },
            HubEvent::CallRejected { room_id, uid, timestamp_ms } => SignalingMessage {
                sender_uid: uid,
                room_id,
                timestamp_ms,
                payload: SignalPayload::CallReject,
            },
            HubEvent::CallEnded { room_id, uid, timestamp_ms } => SignalingMessage {
                sender_uid: uid,
                room_id,
                timestamp_ms,
                payload: SignalPayload::CallEnd,
            },
            _ => return None,
        };
        Some(msg)
    }
}
