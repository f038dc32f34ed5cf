/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod agent;
pub mod backoff;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod session;
pub mod transport;

pub use agent::CallAgent;
pub use config::CallConfig;
pub use error::{CallError, EndReason};
pub use events::CallEvent;
pub use session::{CallDeps, CallRole, CallSession, CallSnapshot, CallState, WeakCallSession};
