/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_STUN_SERVERS: [&str; 2] = ["stun:stun.l.google.com:19302", "stun:stun1.l.google.com:19302"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

/// Client tuning. Every field is optional; accessors apply defaults and clamp.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub ice_servers: Option<Vec<IceServerConfig>>,
    pub invite_timeout_secs: Option<u64>,
    pub negotiation_timeout_secs: Option<u64>,
    pub answer_cooldown_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub poll_failure_budget: Option<u32>,
    pub reconnect_base_ms: Option<u64>,
    pub reconnect_max_ms: Option<u64>,
    pub reconnect_budget: Option<u32>,
}

impl CallConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
    }

    /// Configured servers, or the two public STUN servers. No TURN is assumed.
    pub fn ice_servers(&self) -> Vec<IceServerConfig> {
        match &self.ice_servers {
            Some(v) if !v.is_empty() => v.clone(),
            _ => DEFAULT_STUN_SERVERS.iter().map(|u| IceServerConfig::stun(u)).collect(),
        }
    }

    pub fn invite_timeout(&self) -> Duration {
        Duration::from_secs(self.invite_timeout_secs.unwrap_or(30).clamp(5, 300))
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs.unwrap_or(30).clamp(5, 300))
    }

    pub fn answer_cooldown(&self) -> Duration {
        Duration::from_millis(self.answer_cooldown_ms.unwrap_or(500).min(10_000))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(2000).clamp(50, 10_000))
    }

    pub fn poll_failure_budget(&self) -> u32 {
        self.poll_failure_budget.unwrap_or(10).clamp(1, 1000)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms.unwrap_or(1000).clamp(50, 60_000))
    }

    pub fn reconnect_max(&self) -> Duration {
        let max = Duration::from_millis(self.reconnect_max_ms.unwrap_or(30_000).min(300_000));
        max.max(self.reconnect_base())
    }

    pub fn reconnect_budget(&self) -> u32 {
        self.reconnect_budget.unwrap_or(8).clamp(1, 1000)
    }

    /// Logs a warning when fewer than two STUN urls are configured.
    pub fn check_ice(&self) -> usize {
        let stun = self
            .ice_servers()
            .iter()
            .flat_map(|s| s.urls.iter())
            .filter(|u| u.starts_with("stun:") || u.starts_with("stuns:"))
            .count();
        if stun < 2 {
            warn!(stun, "fewer than two STUN servers configured; connectivity may suffer");
        }
        stun
    }
}
