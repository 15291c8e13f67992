//! HTTP endpoints implemented by the upto **facilitator**.
//!
//! These are the server-side handlers for processing client-submitted
//! payments: the protocol-critical endpoints (`/verify`, `/settle`), the
//! discovery endpoints (`/supported`, `GET /verify`, `GET /settle`), the
//! aggregate `/stats` view, and a health probe.
//!
//! Verification failures are protocol results, not HTTP errors: `/verify`
//! answers `200 OK` with `isValid: false` and a reason tag. Malformed bodies
//! yield `400`; unexpected internal failures yield a generic `500` with the
//! full error logged, never returned.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

use crate::audit::AuditStore;
use crate::facilitator::Facilitator;
use crate::types::{ErrorResponse, SettleRequest, VerifyRequest};

fn bad_request(error: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "Internal server error".to_string(),
        }),
    )
        .into_response()
}

/// `GET /`: liveness probe.
pub async fn health() -> impl IntoResponse {
    "OK"
}

/// `GET /verify`: machine-readable description of the `/verify` endpoint.
///
/// Optional metadata, primarily useful for discoverability and debugging
/// tools.
#[instrument(skip_all)]
pub async fn get_verify_info() -> impl IntoResponse {
    Json(json!({
        "endpoint": "/verify",
        "description": "POST to verify upto payments",
        "body": {
            "payload": "UptoPayload",
            "requirements": "PaymentRequirements",
        }
    }))
}

/// `GET /settle`: machine-readable description of the `/settle` endpoint.
#[instrument(skip_all)]
pub async fn get_settle_info() -> impl IntoResponse {
    Json(json!({
        "endpoint": "/settle",
        "description": "POST to settle upto payments",
        "body": {
            "payload": "UptoPayload",
            "requirements": "PaymentRequirements",
        }
    }))
}

/// `POST /verify`: facilitator-side verification of a proposed payment.
///
/// Checks whether the payload satisfies the declared requirements, including
/// spender binding, recipient, time window, ceiling, signature, allowance,
/// and balance. Responds with the verifier result verbatim.
#[instrument(skip_all)]
pub async fn post_verify<F>(
    Extension(facilitator): Extension<F>,
    body: Result<Json<VerifyRequest>, JsonRejection>,
) -> Response
where
    F: Facilitator + Clone + Send + Sync + 'static,
{
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            tracing::warn!(error = %rejection, "rejected malformed verify body");
            return bad_request("Invalid request body");
        }
    };
    match facilitator.verify(&request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(error) => {
            tracing::error!(error = %error, "verification failed unexpectedly");
            internal_error()
        }
    }
}

/// `POST /settle`: facilitator-side execution of a payment on-chain.
///
/// Given an accepted payload carrying its metered `settlementAmount`, executes
/// the transfer via the upto proxy and returns the settler result verbatim.
/// Typically called after a successful `/verify` step.
#[instrument(skip_all)]
pub async fn post_settle<F>(
    Extension(facilitator): Extension<F>,
    body: Result<Json<SettleRequest>, JsonRejection>,
) -> Response
where
    F: Facilitator + Clone + Send + Sync + 'static,
{
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            tracing::warn!(error = %rejection, "rejected malformed settle body");
            return bad_request("Invalid request body");
        }
    };
    match facilitator.settle(&request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(error) => {
            tracing::error!(error = %error, "settlement failed unexpectedly");
            internal_error()
        }
    }
}

/// `GET /supported`: the schemes and networks this facilitator serves, plus
/// its settlement signer address.
#[instrument(skip_all)]
pub async fn get_supported<F>(Extension(facilitator): Extension<F>) -> Response
where
    F: Facilitator + Clone + Send + Sync + 'static,
{
    match facilitator.supported().await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(error) => {
            tracing::error!(error = %error, "supported lookup failed");
            internal_error()
        }
    }
}

/// `GET /stats`: aggregate totals over the audit store, including the savings
/// relative to authorized ceilings.
#[instrument(skip_all)]
pub async fn get_stats(Extension(audit): Extension<Arc<AuditStore>>) -> Response {
    match audit.stats() {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(error) => {
            tracing::error!(error = %error, "stats aggregation failed");
            internal_error()
        }
    }
}
