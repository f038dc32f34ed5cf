/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod config;
pub mod hub;
pub mod room_registry;
pub mod signaling_api;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span};

use crate::config::RelayConfig;
use crate::hub::Hub;
use crate::room_registry::RoomRegistry;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<RelayConfig>,
    pub rooms: Arc<RoomRegistry>,
    pub hub: Arc<Hub>,
}

impl AppState {
    pub fn new(cfg: RelayConfig) -> Self {
        Self {
            rooms: Arc::new(RoomRegistry::new(cfg.max_entries_per_room)),
            hub: Arc::new(Hub::new(cfg.hub_queue)),
            cfg: Arc::new(cfg),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let max_body = state.cfg.max_body_bytes;
    Router::new()
        .route("/healthz", get(signaling_api::healthz))
        .route("/signaling/join", post(signaling_api::join))
        .route("/signaling/leave", post(signaling_api::leave))
        .route("/signaling/poll", get(signaling_api::poll))
        .route("/signaling/offer", post(signaling_api::offer))
        .route("/signaling/answer", post(signaling_api::answer))
        .route("/signaling/ice-candidate", post(signaling_api::ice_candidate))
        .route("/signaling/control", post(signaling_api::control))
        .route("/hub", get(hub::hub_ws))
        .layer(axum::extract::DefaultBodyLimit::max(max_body))
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                let request_id = req
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("req");
                info_span!(
                    "http",
                    method = %req.method(),
                    uri = %req.uri(),
                    request_id = %request_id
                )
            }),
        )
        .with_state(state)
}

/// Periodic eviction of idle rooms, until `shutdown` fires.
pub fn spawn_cleanup(state: AppState, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ttl = state.cfg.room_ttl();
        let mut interval = tokio::time::interval(state.cfg.cleanup_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    state.rooms.cleanup_idle(ttl).await;
                }
            }
        }
    })
}

/// Serves the relay on an already bound listener until `shutdown` fires.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let addr = listener.local_addr().context("listener addr")?;
    let cleanup = spawn_cleanup(state.clone(), shutdown.clone());
    info!("careline_relay listening on http://{addr}");
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("serve")?;
    let _ = cleanup.await;
    Ok(())
}

pub async fn run(cfg: RelayConfig, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(cfg.bind)
        .await
        .with_context(|| format!("bind {}", cfg.bind))?;
    serve(listener, AppState::new(cfg), shutdown).await
}
