//! Peer route handlers

use super::state::ApiState;
use super::tls::PeerIdentity;
use crate::error::KmeError;
use crate::ledger::{KeyIdList, LedgerBatch};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use log::{debug, warn};
use qkme_common::LoggingTransformer;
use serde_json::json;

fn error_response(err: &KmeError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "message": err.to_string() }))).into_response()
}

/// `PUT /api/v1/ledger/:kme_id/key_ids`: store entries replicated by the peer
/// and echo the accepted key ids
///
/// On a TLS connection the path sender must match the client certificate.
pub async fn handle_ledger_push(
    State(state): State<ApiState>,
    Path(sender_kme_id): Path<String>,
    identity: Option<Extension<PeerIdentity>>,
    body: Result<Json<LedgerBatch>, JsonRejection>,
) -> Response {
    if let Some(Extension(PeerIdentity(certified))) = identity {
        if certified != sender_kme_id {
            LoggingTransformer::log_auth_failure("ledger_sender_mismatch", &certified);
            return error_response(&KmeError::Unauthorized(format!(
                "certificate identity {certified} cannot replicate as {sender_kme_id}"
            )));
        }
    }

    let Ok(_permit) = state.gate.try_acquire() else {
        warn!("Replication gate saturated; refusing batch from {sender_kme_id}");
        return error_response(&KmeError::PeerBusy("too many concurrent replication requests".to_string()));
    };

    let batch = match body {
        Ok(Json(batch)) => batch,
        Err(rejection) => {
            debug!("Unreadable replication body from {sender_kme_id}: {rejection}");
            return error_response(&KmeError::invalid(rejection.body_text()));
        }
    };

    match state.receiver.accept(&sender_kme_id, batch).await {
        Ok(accepted) => (StatusCode::CREATED, Json(KeyIdList::new(accepted))).into_response(),
        Err(err) => {
            warn!("Replication from {sender_kme_id} failed: {err}");
            error_response(&err)
        }
    }
}
