/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use careline_protocol::{now_ms, Uid};

use crate::error::{CallError, EndReason};
use crate::media::{LocalStream, RemoteTrack};
use crate::peer::PeerConnectionState;
use crate::session::CallState;

/// What a call session tells its UI. One receiver per session.
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged { from: CallState, to: CallState, ts_ms: i64 },
    LocalStream(LocalStream),
    RemoteStream { uid: Uid, track: RemoteTrack },
    ConnectionStateChanged(PeerConnectionState),
    Error(CallError),
    Ended { state: CallState, reason: EndReason },
}

impl CallEvent {
    pub fn state_changed(from: CallState, to: CallState) -> Self {
        CallEvent::StateChanged {
            from,
            to,
            ts_ms: now_ms(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CallEvent::StateChanged { .. } => "state_changed",
            CallEvent::LocalStream(_) => "local_stream",
            CallEvent::RemoteStream { .. } => "remote_stream",
            CallEvent::ConnectionStateChanged(_) => "connection_state_changed",
            CallEvent::Error(_) => "error",
            CallEvent::Ended { .. } => "ended",
        }
    }
}
