/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::{Mutex as StdMutex, MutexGuard};

use anyhow::Result;
use careline_protocol::{room_id_for, CallKind, SignalingMessage, Uid};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::error::CallError;
use crate::session::{CallDeps, CallRole, CallSession, CallState, WeakCallSession};

struct LiveCall {
    /// Known up front for placed and incoming calls, so the room is claimed
    /// before the session has processed anything.
    room_id: Option<String>,
    session: WeakCallSession,
}

impl LiveCall {
    fn room(&self) -> Option<String> {
        self.room_id.clone().or_else(|| self.session.snapshot().room_id)
    }

    fn is_live(&self) -> bool {
        !self.session.snapshot().state.is_terminal() && self.session.upgrade().is_some()
    }
}

/// Per-user entry point. Shares one transport between all calls of the user
/// and turns unsolicited invites into ringing sessions.
///
/// At most one live session exists per room: calling a peer whose invite is
/// already ringing accepts that invite, and an invite for a room with a call in
/// progress is left to that call.
pub struct CallAgent {
    deps: CallDeps,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<SignalingMessage>>>,
    live: StdMutex<Vec<LiveCall>>,
}

impl CallAgent {
    pub fn new(deps: CallDeps) -> Self {
        deps.config.check_ice();
        let incoming = deps.transport.take_incoming();
        if incoming.is_none() {
            debug!(uid = deps.transport.local_uid(), "incoming stream already taken; invites go elsewhere");
        }
        Self {
            deps,
            incoming: Mutex::new(incoming),
            live: StdMutex::new(Vec::new()),
        }
    }

    pub fn local_uid(&self) -> Uid {
        self.deps.transport.local_uid()
    }

    pub fn deps(&self) -> &CallDeps {
        &self.deps
    }

    fn live(&self) -> MutexGuard<'_, Vec<LiveCall>> {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        live.retain(LiveCall::is_live);
        live
    }

    fn find(live: &[LiveCall], room_id: &str) -> Option<CallSession> {
        live.iter()
            .filter(|c| c.room().as_deref() == Some(room_id))
            .find_map(|c| c.session.upgrade())
    }

    /// Rooms of calls this agent owns that are not over yet.
    pub fn active_rooms(&self) -> Vec<String> {
        self.live().iter().filter_map(LiveCall::room).collect()
    }

    pub fn new_call(&self) -> CallSession {
        let session = CallSession::idle(self.deps.clone());
        self.live().push(LiveCall {
            room_id: None,
            session: session.downgrade(),
        });
        session
    }

    /// Calls `target_uid`. When that peer's invite is already ringing here the
    /// two calls crossed, and the ringing session is accepted and returned.
    pub async fn call(&self, target_uid: Uid, kind: CallKind) -> Result<CallSession, CallError> {
        let room_id = room_id_for(self.local_uid(), target_uid);
        let claimed = {
            let mut live = self.live();
            match Self::find(&live, &room_id) {
                Some(existing) => Err(existing),
                None => {
                    let session = CallSession::idle(self.deps.clone());
                    live.push(LiveCall {
                        room_id: Some(room_id.clone()),
                        session: session.downgrade(),
                    });
                    Ok(session)
                }
            }
        };

        match claimed {
            Ok(session) => {
                session.start_call(target_uid, kind).await?;
                Ok(session)
            }
            Err(existing) => {
                let snap = existing.snapshot();
                // An incoming session queues the accept behind its own ringing setup.
                let ringing = matches!(snap.state, CallState::Idle | CallState::Ringing);
                if snap.role == Some(CallRole::Callee) && ringing {
                    info!(room = %room_id, peer = target_uid, "peer is already calling, accepting");
                    existing.accept_call().await?;
                    Ok(existing)
                } else {
                    Err(CallError::InvalidState {
                        op: "call",
                        state: snap.state,
                    })
                }
            }
        }
    }

    /// Listen for invites from `peer`. Needed by room-based transports only.
    pub async fn watch_peer(&self, peer: Uid) -> Result<()> {
        self.deps.transport.watch(&room_id_for(self.local_uid(), peer)).await
    }

    fn claim_invite(&self, invite: &SignalingMessage) -> Option<CallSession> {
        let mut live = self.live();
        if Self::find(&live, &invite.room_id).is_some() {
            debug!(room = %invite.room_id, "invite for a call already in progress");
            return None;
        }
        match CallSession::incoming(invite, self.deps.clone()) {
            Ok(session) => {
                live.push(LiveCall {
                    room_id: Some(invite.room_id.clone()),
                    session: session.downgrade(),
                });
                Some(session)
            }
            Err(e) => {
                debug!(room = %invite.room_id, "invite dropped: {e}");
                None
            }
        }
    }

    /// Next invite as a ringing callee session. `None` once the transport is gone
    /// or another owner took the invite stream.
    pub async fn next_incoming(&self) -> Option<CallSession> {
        let mut guard = self.incoming.lock().await;
        let rx = guard.as_mut()?;
        while let Some(invite) = rx.recv().await {
            if let Some(session) = self.claim_invite(&invite) {
                info!(room = %invite.room_id, caller = invite.sender_uid, "incoming call");
                return Some(session);
            }
        }
        None
    }
}
