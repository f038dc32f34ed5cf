/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::net::SocketAddr;
use std::time::Duration;

use tracing::warn;

const DEFAULT_BIND: &str = "0.0.0.0:8787";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    pub room_ttl_secs: u64,
    pub cleanup_interval_secs: u64,
    pub max_entries_per_room: usize,
    pub max_body_bytes: usize,
    /// Shared secret for `/hub` connections. `None` accepts any client.
    pub hub_token: Option<String>,
    /// Outbound event queue per hub connection.
    pub hub_queue: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8787)),
            room_ttl_secs: 10 * 60,
            cleanup_interval_secs: 30,
            max_entries_per_room: 500,
            max_body_bytes: 256 * 1024,
            hub_token: None,
            hub_queue: 64,
        }
    }
}

impl RelayConfig {
    pub fn room_ttl(&self) -> Duration {
        Duration::from_secs(self.room_ttl_secs.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

pub fn load_config() -> RelayConfig {
    let defaults = RelayConfig::default();

    let bind_raw = std::env::var("CARELINE_RELAY_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let bind = match bind_raw.parse::<SocketAddr>() {
        Ok(v) => v,
        Err(e) => {
            warn!("CARELINE_RELAY_BIND invalid ({bind_raw}): {e}; using {DEFAULT_BIND}");
            defaults.bind
        }
    };
    let room_ttl_secs = std::env::var("CARELINE_RELAY_ROOM_TTL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(defaults.room_ttl_secs)
        .clamp(10, 24 * 3600);
    let cleanup_interval_secs = std::env::var("CARELINE_RELAY_CLEANUP_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(defaults.cleanup_interval_secs)
        .clamp(1, 3600);
    let max_entries_per_room = std::env::var("CARELINE_RELAY_MAX_ENTRIES_PER_ROOM")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(defaults.max_entries_per_room)
        .clamp(16, 100_000);
    let max_body_bytes = std::env::var("CARELINE_RELAY_MAX_BODY_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(defaults.max_body_bytes)
        .clamp(4 * 1024, 16 * 1024 * 1024);
    let hub_token = std::env::var("CARELINE_RELAY_HUB_TOKEN")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let hub_queue = std::env::var("CARELINE_RELAY_HUB_QUEUE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(defaults.hub_queue)
        .clamp(8, 4096);

    RelayConfig {
        bind,
        room_ttl_secs,
        cleanup_interval_secs,
        max_entries_per_room,
        max_body_bytes,
        hub_token,
        hub_queue,
    }
}
