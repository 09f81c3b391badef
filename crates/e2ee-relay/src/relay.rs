//! `POST /relay/messages`, `GET /relay/messages/{userId}?since=`, and
//! `POST /relay/messages/{id}/ack` (§4.8, §6). The relay is an opaque
//! forwarder: it validates structural well-formedness of the envelope and
//! never reads, computes over, or depends on `ciphertext` (P8).

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use e2ee_crypto::wire::MessageEnvelope;

use crate::error::RelayError;
use crate::state::{now_unix_ms, SharedState};

fn caller_id(headers: &HeaderMap) -> Result<String, RelayError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .ok_or(RelayError::Unauthorized)
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub to: String,
    #[serde(default)]
    pub from: Option<String>,
    pub content: MessageEnvelope,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub id: i64,
    pub timestamp: i64,
    pub status: &'static str,
}

pub async fn send_message(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, RelayError> {
    let caller = caller_id(&headers)?;
    let from = req.from.unwrap_or(caller);

    if !req.content.is_well_formed() {
        return Err(RelayError::MalformedEnvelope);
    }
    if !state.db.user_exists(&req.to)? {
        return Err(RelayError::UnknownRecipient(req.to.clone()));
    }

    let now = now_unix_ms();
    let content_json = serde_json::to_string(&req.content)
        .map_err(|e| RelayError::Malformed(e.to_string()))?;
    let id = state.db.insert_message(&from, &req.to, &content_json, now)?;

    tracing::debug!(from = %from, to = %req.to, id, "relayed message");
    Ok(Json(SendMessageResponse {
        id,
        timestamp: now,
        status: "sent",
    }))
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    #[serde(default)]
    since: i64,
}

#[derive(Debug, Serialize)]
pub struct RelayedMessage {
    pub id: i64,
    pub from: String,
    pub to: String,
    pub content: MessageEnvelope,
    pub timestamp: i64,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct PollResponse {
    pub messages: Vec<RelayedMessage>,
}

pub async fn poll_messages(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Query(query): Query<PollQuery>,
) -> Result<Json<PollResponse>, RelayError> {
    let caller = caller_id(&headers)?;
    if caller != user_id {
        return Err(RelayError::Unauthorized);
    }

    let rows = state.db.messages_since(&user_id, query.since)?;
    let messages = rows
        .into_iter()
        .map(|row| {
            let content: MessageEnvelope = serde_json::from_str(&row.content)
                .map_err(|e| RelayError::Storage(e.to_string()))?;
            Ok(RelayedMessage {
                id: row.id,
                from: row.from_user,
                to: row.to_user,
                content,
                timestamp: row.timestamp_unix_ms,
                status: row.status,
            })
        })
        .collect::<Result<Vec<_>, RelayError>>()?;

    Ok(Json(PollResponse { messages }))
}

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    pub status: AckStatus,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Delivered,
    Read,
}

impl AckStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }
}

pub async fn ack_message(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<AckRequest>,
) -> Result<Json<serde_json::Value>, RelayError> {
    caller_id(&headers)?;
    if !state.db.ack_message(id, req.status.as_str())? {
        return Err(RelayError::UnknownMessage(id));
    }
    Ok(Json(serde_json::json!({ "success": true })))
}
