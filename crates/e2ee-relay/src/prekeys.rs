//! `GET /users/{userId}/prekeys` and `POST /users/prekeys` (§4.7, §6).

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;

use e2ee_crypto::wire::PrekeyUploadRequest;

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

pub async fn get_bundle(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<e2ee_crypto::wire::PrekeyBundle>, RelayError> {
    let caller = caller_id(&headers)?;
    tracing::debug!(caller = %caller, target = %user_id, "GET /users/{userId}/prekeys");

    if !state.check_fetch_rate(&caller, now_unix_ms()) {
        tracing::warn!(caller = %caller, "prekey bundle fetch rate limited");
        return Err(RelayError::RateLimited);
    }

    let bundle = state
        .db
        .fetch_bundle(&user_id)?
        .ok_or_else(|| RelayError::UnknownUser(user_id.clone()))?;
    Ok(Json(bundle))
}

pub async fn upload_bundle(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<PrekeyUploadRequest>,
) -> Result<Json<serde_json::Value>, RelayError> {
    let caller = caller_id(&headers)?;
    tracing::debug!(caller = %caller, "POST /users/prekeys");

    if req.one_time_prekeys.len() > state.config.one_time_prekey_request_cap {
        return Err(RelayError::TooManyOneTimePrekeys);
    }

    let now = now_unix_ms();
    if !state.check_upload_rate(&caller, now) {
        tracing::warn!(caller = %caller, "prekey upload rate limited");
        return Err(RelayError::RateLimited);
    }

    let existing_unconsumed = state.db.count_unconsumed_one_time_prekeys(&caller)?;
    if existing_unconsumed + req.one_time_prekeys.len() > state.config.one_time_prekey_account_cap {
        tracing::warn!(caller = %caller, "one-time prekey account cap exceeded");
        return Err(RelayError::RateLimited);
    }

    state.db.upsert_bundle(
        &caller,
        &req.identity_key,
        &req.signing_key,
        &req.signed_prekey,
        &req.one_time_prekeys,
        now,
    )?;

    Ok(Json(serde_json::json!({ "success": true })))
}
