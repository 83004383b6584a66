//! Request handlers.

use std::sync::Arc;

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use facematch_core::VerificationOutcome;
use serde::Serialize;
use serde_json::json;

use crate::error::ApiError;
use crate::AppState;

/// Multipart field carrying the probe image.
pub const IMAGE_FIELD: &str = "image";

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub comparator: String,
    /// Scratch artifacts held by in-flight verifications.
    pub scratch_in_use: usize,
}

/// GET /
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        comparator: state.engine.comparator_name().to_string(),
        scratch_in_use: state.engine.scratch_in_use(),
    })
}

/// POST /verify-face
///
/// The scan runs on its own blocking worker. If it outlives the timeout the
/// caller gets a 500 right away; the worker still finishes and cleans up.
pub async fn verify_face(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let payload = read_image_field(&mut multipart).await?;
    tracing::info!(bytes = payload.len(), "received /verify-face request");

    let engine = Arc::clone(&state.engine);
    let worker = tokio::task::spawn_blocking(move || engine.verify(&payload));

    let outcome = match tokio::time::timeout(state.verify_timeout, worker).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "verification worker failed");
            return Err(ApiError::internal("verification worker failed"));
        }
        Err(_) => {
            tracing::error!(timeout = ?state.verify_timeout, "verification timed out");
            return Err(ApiError::internal("verification timed out"));
        }
    };

    match outcome {
        VerificationOutcome::Matched { identity } => {
            Ok(Json(json!({ "verified": true, "identity": identity })).into_response())
        }
        VerificationOutcome::NoMatch => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "verified": false, "message": "Face not recognized" })),
        )
            .into_response()),
        VerificationOutcome::InputError { reason } => Err(ApiError::bad_request(reason)),
        VerificationOutcome::InternalError { reason } => Err(ApiError::internal(reason)),
    }
}

/// Bytes of the first `image` field. Other fields are ignored.
async fn read_image_field(multipart: &mut Multipart) -> Result<Vec<u8>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed multipart body: {e}")))?
    {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("cannot read image field: {e}")))?;
        return Ok(bytes.to_vec());
    }
    Err(ApiError::bad_request("No file uploaded"))
}
