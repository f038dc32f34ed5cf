/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::session::CallState;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("media permission denied: {0}")]
    MediaPermissionDenied(String),
    #[error("signaling unreachable: {0}")]
    SignalingUnreachable(String),
    #[error("negotiation timed out")]
    NegotiationTimeout,
    #[error("cannot {op} while {state:?}")]
    InvalidState { op: &'static str, state: CallState },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("negotiation error: {0}")]
    Negotiation(String),
    #[error("call session closed")]
    SessionClosed,
}

impl CallError {
    pub fn transport(e: anyhow::Error) -> Self {
        CallError::Transport(format!("{e:#}"))
    }

    pub fn negotiation(e: anyhow::Error) -> Self {
        CallError::Negotiation(format!("{e:#}"))
    }
}

/// Why a call reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    LocalRejected,
    Rejected,
    NoAnswer,
    NegotiationTimeout,
    ConnectionFailed,
    MediaPermissionDenied,
    SignalingUnreachable,
    PeerOffline,
}

impl EndReason {
    pub fn terminal_state(&self) -> CallState {
        match self {
            EndReason::LocalHangup | EndReason::RemoteHangup | EndReason::LocalRejected => CallState::Ended,
            _ => CallState::Failed,
        }
    }

    /// Reason string shown when the call screen closes.
    pub fn describe(&self) -> &'static str {
        match self {
            EndReason::LocalHangup => "call ended",
            EndReason::RemoteHangup => "the other participant left the call",
            EndReason::LocalRejected => "call declined",
            EndReason::Rejected => "call was declined",
            EndReason::NoAnswer => "no answer",
            EndReason::NegotiationTimeout => "could not establish the call in time",
            EndReason::ConnectionFailed => "connection lost",
            EndReason::MediaPermissionDenied => "camera or microphone permission denied",
            EndReason::SignalingUnreachable => "signaling server unreachable",
            EndReason::PeerOffline => "user not online",
        }
    }

    /// Whether the other side should get a `call-end` during teardown.
    pub(crate) fn notifies_remote(&self) -> bool {
        matches!(
            self,
            EndReason::LocalHangup
                | EndReason::NoAnswer
                | EndReason::NegotiationTimeout
                | EndReason::ConnectionFailed
                | EndReason::MediaPermissionDenied
        )
    }

    pub fn as_error(&self) -> Option<CallError> {
        match self {
            EndReason::MediaPermissionDenied => Some(CallError::MediaPermissionDenied(self.describe().to_string())),
            EndReason::SignalingUnreachable => Some(CallError::SignalingUnreachable(self.describe().to_string())),
            EndReason::NegotiationTimeout => Some(CallError::NegotiationTimeout),
            EndReason::ConnectionFailed => Some(CallError::Negotiation(self.describe().to_string())),
            _ => None,
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}
