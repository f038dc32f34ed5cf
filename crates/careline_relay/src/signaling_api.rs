/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! `/signaling/*` handlers for the polling transport.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use careline_protocol::{
    AnswerRequest, ControlRequest, IceCandidateRequest, JoinRequest, LeaveRequest, OfferRequest, PollQuery, SdpType,
    SignalPayload, SuccessResponse,
};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::room_registry::RegistryError;
use crate::AppState;

const MAX_ROOM_ID_LEN: usize = 128;

fn failure(status: StatusCode, error: impl Into<String>) -> Response {
    (status, Json(SuccessResponse::failed(error))).into_response()
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| failure(StatusCode::BAD_REQUEST, format!("invalid json: {e}")))
}

fn check_room_id(room_id: &str) -> Result<(), Response> {
    if room_id.trim().is_empty() || room_id.len() > MAX_ROOM_ID_LEN {
        return Err(failure(StatusCode::BAD_REQUEST, "invalid roomId"));
    }
    Ok(())
}

fn posted(result: Result<u64, RegistryError>) -> Response {
    match result {
        Ok(_) => Json(SuccessResponse::ok()).into_response(),
        Err(e) => registry_failure(e),
    }
}

fn registry_failure(e: RegistryError) -> Response {
    let status = match e {
        RegistryError::RoomFull => StatusCode::CONFLICT,
        RegistryError::QueueFull => StatusCode::TOO_MANY_REQUESTS,
    };
    failure(status, e.to_string())
}

pub async fn join(State(state): State<AppState>, body: Bytes) -> Response {
    let req: JoinRequest = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = check_room_id(&req.room_id) {
        return resp;
    }
    match state.rooms.join(&req.room_id, req.uid).await {
        Ok(_) => Json(SuccessResponse::ok()).into_response(),
        Err(e) => registry_failure(e),
    }
}

pub async fn leave(State(state): State<AppState>, body: Bytes) -> Response {
    let req: LeaveRequest = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = check_room_id(&req.room_id) {
        return resp;
    }
    // Leaving a room that is already gone still succeeds.
    state.rooms.leave(&req.room_id, req.uid).await;
    Json(SuccessResponse::ok()).into_response()
}

pub async fn poll(State(state): State<AppState>, query: Option<Query<PollQuery>>) -> Response {
    let Some(Query(q)) = query else {
        return failure(StatusCode::BAD_REQUEST, "roomId and uid required");
    };
    if let Err(resp) = check_room_id(&q.room_id) {
        return resp;
    }
    Json(state.rooms.poll(&q.room_id, q.uid).await).into_response()
}

pub async fn offer(State(state): State<AppState>, body: Bytes) -> Response {
    let req: OfferRequest = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = check_room_id(&req.room_id) {
        return resp;
    }
    if req.offer.sdp_type != SdpType::Offer {
        return failure(StatusCode::BAD_REQUEST, "offer must have type \"offer\"");
    }
    debug!(room = %req.room_id, uid = req.uid, "offer posted");
    posted(state.rooms.post_offer(&req.room_id, req.uid, req.offer).await)
}

pub async fn answer(State(state): State<AppState>, body: Bytes) -> Response {
    let req: AnswerRequest = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = check_room_id(&req.room_id) {
        return resp;
    }
    if req.answer.sdp_type != SdpType::Answer {
        return failure(StatusCode::BAD_REQUEST, "answer must have type \"answer\"");
    }
    debug!(room = %req.room_id, uid = req.uid, "answer posted");
    posted(state.rooms.post_answer(&req.room_id, req.uid, req.answer).await)
}

pub async fn ice_candidate(State(state): State<AppState>, body: Bytes) -> Response {
    let req: IceCandidateRequest = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = check_room_id(&req.room_id) {
        return resp;
    }
    posted(state.rooms.post_ice_candidate(&req.room_id, req.uid, req.candidate).await)
}

pub async fn control(State(state): State<AppState>, body: Bytes) -> Response {
    let req: ControlRequest = match parse_body(&body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = check_room_id(&req.room_id) {
        return resp;
    }
    if !req.message.is_control() {
        return failure(StatusCode::BAD_REQUEST, "use the offer/answer/ice-candidate endpoints");
    }
    let leaving = matches!(req.message, SignalPayload::Leave);
    let result = state.rooms.post_control(&req.room_id, req.uid, req.message).await;
    if leaving {
        state.rooms.leave(&req.room_id, req.uid).await;
    }
    posted(result)
}

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.rooms.stats().await;
    let online = state.hub.online_count().await;
    Json(serde_json::json!({
        "ok": true,
        "rooms": stats.rooms,
        "entries": stats.entries,
        "online": online,
    }))
}
